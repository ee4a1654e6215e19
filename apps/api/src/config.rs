use std::path::Path;

use anyhow::bail;
use gf_llm::{ChatProviderConfig, EmbedProviderConfig};
use gf_rag::{CacheConfig, HybridConfig, LexicalConfig, PipelineConfig, RerankConfig};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub chat_provider: ChatCfgYaml,
    pub embedding_provider: EmbedCfgYaml,
    pub vector_store: VectorStoreCfg,
    pub cache: CacheCfg,
    pub retrieval: RetrievalCfg,
    pub rerank: RerankConfig,
    pub pipeline: PipelineConfig,
    pub corpus: CorpusCfg,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 对话模型配置，密钥通过 api_key_env 指向的环境变量读取
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChatCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: String,
    pub timeout_secs: Option<u64>,
}

impl Default for ChatCfgYaml {
    fn default() -> Self {
        Self {
            kind: "ollama".to_string(),
            base_url: None,
            api_key_env: None,
            model: "phi3:mini".to_string(),
            timeout_secs: Some(120),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmbedCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: String,
    pub dimensions: Option<usize>,
}

impl Default for EmbedCfgYaml {
    fn default() -> Self {
        Self {
            kind: "ollama".to_string(),
            base_url: None,
            api_key_env: None,
            model: "nomic-embed-text:latest".to_string(),
            dimensions: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorStoreCfg {
    #[default]
    Memory,
    Qdrant {
        #[serde(default = "default_qdrant_url")]
        url: String,
        #[serde(default = "default_collection")]
        collection: String,
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".to_string()
}

fn default_collection() -> String {
    "greenfrog_docs".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    Redis,
    Memory,
    Disabled,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheCfg {
    pub backend: CacheBackendKind,
    pub redis_url: String,
    #[serde(flatten)]
    pub semantic: CacheConfig,
}

impl Default for CacheCfg {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            semantic: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrievalCfg {
    #[serde(flatten)]
    pub hybrid: HybridConfig,
    pub k1: f64,
    pub b: f64,
}

impl Default for RetrievalCfg {
    fn default() -> Self {
        let lexical = LexicalConfig::default();
        Self {
            hybrid: HybridConfig::default(),
            k1: lexical.k1,
            b: lexical.b,
        }
    }
}

impl RetrievalCfg {
    pub fn lexical(&self) -> LexicalConfig {
        LexicalConfig {
            k1: self.k1,
            b: self.b,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CorpusCfg {
    /// 启动时加载的 JSONL 语料
    pub path: Option<String>,
}

/// 读取 YAML 配置；GF_CONFIG 可指定路径，文件缺失时使用默认值
pub fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var("GF_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut cfg = if Path::new(&path).exists() {
        let s = std::fs::read_to_string(&path)?;
        parse_config(&s)?
    } else {
        info!(%path, "config file not found, using defaults");
        AppConfig::default()
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    info!("load_config: {:?}", cfg);
    Ok(cfg)
}

pub fn parse_config(s: &str) -> anyhow::Result<AppConfig> {
    Ok(serde_yaml::from_str(s)?)
}

fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env {}", key))
}

impl AppConfig {
    /// 环境变量覆盖服务地址
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(url) = env("OLLAMA_BASE_URL") {
            if self.chat_provider.kind == "ollama" {
                self.chat_provider.base_url = Some(url.clone());
            }
            if self.embedding_provider.kind == "ollama" {
                self.embedding_provider.base_url = Some(url);
            }
        }
        if let Some(url) = env("REDIS_URL") {
            self.cache.redis_url = url;
        }
        if let Some(new_url) = env("QDRANT_URL") {
            if let VectorStoreCfg::Qdrant { url, .. } = &mut self.vector_store {
                *url = new_url;
            }
        }
    }

    pub fn chat_provider_config(&self) -> anyhow::Result<ChatProviderConfig> {
        let c = &self.chat_provider;
        Ok(match c.kind.as_str() {
            "ollama" => ChatProviderConfig::Ollama {
                base_url: c
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".into()),
                model: c.model.clone(),
                timeout_secs: c.timeout_secs,
            },
            "openai_compat" | "openai" => ChatProviderConfig::OpenAiCompat {
                base_url: c
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into()),
                api_key: read_env(
                    &c.api_key_env
                        .clone()
                        .unwrap_or_else(|| "OPENAI_API_KEY".into()),
                )?,
                model: c.model.clone(),
            },
            other => bail!("unsupported chat provider kind={}", other),
        })
    }

    pub fn embed_provider_config(&self) -> anyhow::Result<EmbedProviderConfig> {
        let e = &self.embedding_provider;
        Ok(match e.kind.as_str() {
            "ollama" => EmbedProviderConfig::Ollama {
                base_url: e
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".into()),
                model: e.model.clone(),
            },
            "openai_compat" | "openai" => EmbedProviderConfig::OpenAiCompat {
                base_url: e
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into()),
                api_key: read_env(
                    &e.api_key_env
                        .clone()
                        .unwrap_or_else(|| "OPENAI_API_KEY".into()),
                )?,
                model: e.model.clone(),
            },
            "hashing" => EmbedProviderConfig::Hashing {
                dimensions: e.dimensions.unwrap_or(256),
            },
            other => bail!("unsupported embedding provider kind={}", other),
        })
    }
}
