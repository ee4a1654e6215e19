use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use gf_error::{GfError, Result};

mod hashing;
mod lines;
mod ollama;
mod openai;

pub use hashing::HashingEmbedModel;
pub use ollama::{OllamaClient, OllamaConfig};
pub use openai::{OpenAiCompatClient, OpenAiCompatConfig};

/// 单次嵌入请求的默认超时
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// 逐 token 输出的生成流
pub type TokenStream = BoxStream<'static, Result<String>>;

/// 单次生成调用的参数
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// 为空时使用客户端默认模型
    pub model: Option<String>,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 非流式请求的传输层超时
    pub timeout: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: None,
            system: None,
            temperature: 0.7,
            max_tokens: 1024,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<Generation>;

    async fn generate_stream(&self, prompt: &str, opts: &GenerateOptions) -> Result<TokenStream>;

    fn provider(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GfError::EmbeddingService {
                provider: "embed".to_string(),
                message: "empty embedding response".to_string(),
                retry_after: None,
            })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// 把传输层错误映射为生成错误分类：超时可重试，其余视为服务不可用
pub(crate) fn generation_error(
    provider: &str,
    model: &str,
    timeout: Option<Duration>,
    err: reqwest::Error,
) -> GfError {
    if err.is_timeout() {
        GfError::GenerationTimeout {
            model: model.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
        }
    } else {
        GfError::GenerationUnavailable {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn embedding_error(provider: &str, message: impl Into<String>) -> GfError {
    GfError::EmbeddingService {
        provider: provider.to_string(),
        message: message.into(),
        retry_after: None,
    }
}

// ========== Provider Factory & Config ==========

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_hashing_dimensions() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "ollama")]
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        model: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
}

impl Default for ChatProviderConfig {
    fn default() -> Self {
        ChatProviderConfig::Ollama {
            base_url: default_ollama_url(),
            model: "phi3:mini".to_string(),
            timeout_secs: Some(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "ollama")]
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        model: String,
    },
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "hashing")]
    Hashing {
        #[serde(default = "default_hashing_dimensions")]
        dimensions: usize,
    },
}

impl Default for EmbedProviderConfig {
    fn default() -> Self {
        EmbedProviderConfig::Ollama {
            base_url: default_ollama_url(),
            model: "nomic-embed-text:latest".to_string(),
        }
    }
}

pub struct Providers {
    pub chat: Arc<dyn ChatModel>,
    pub embed: Arc<dyn EmbedModel>,
}

pub fn make_providers(chat: ChatProviderConfig, embed: EmbedProviderConfig) -> Result<Providers> {
    let chat: Arc<dyn ChatModel> = match chat {
        ChatProviderConfig::Ollama {
            base_url,
            model,
            timeout_secs,
        } => Arc::new(OllamaClient::new(OllamaConfig {
            base_url,
            model,
            embedding_model: None,
            timeout: timeout_secs.map(Duration::from_secs),
        })?),
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: model,
            embedding_model: None,
        })),
    };

    let embed: Arc<dyn EmbedModel> = match embed {
        EmbedProviderConfig::Ollama { base_url, model } => {
            Arc::new(OllamaClient::new(OllamaConfig {
                base_url,
                model: String::new(),
                embedding_model: Some(model),
                timeout: None,
            })?)
        }
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
        })),
        EmbedProviderConfig::Hashing { dimensions } => {
            if dimensions == 0 {
                return Err(GfError::Configuration {
                    key: "embedding_provider.dimensions".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            Arc::new(HashingEmbedModel::new(dimensions))
        }
    };

    Ok(Providers { chat, embed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_from_yaml_like_json() {
        let chat: ChatProviderConfig =
            serde_json::from_str(r#"{"kind":"ollama","model":"phi3:mini"}"#).unwrap();
        match chat {
            ChatProviderConfig::Ollama { base_url, model, .. } => {
                assert_eq!(base_url, "http://localhost:11434");
                assert_eq!(model, "phi3:mini");
            }
            other => panic!("unexpected config {other:?}"),
        }

        let embed: EmbedProviderConfig = serde_json::from_str(r#"{"kind":"hashing"}"#).unwrap();
        assert!(matches!(embed, EmbedProviderConfig::Hashing { dimensions: 256 }));
    }

    #[test]
    fn test_make_providers_rejects_zero_dimensions() {
        let result = make_providers(
            ChatProviderConfig::default(),
            EmbedProviderConfig::Hashing { dimensions: 0 },
        );
        assert!(matches!(result, Err(GfError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_embed_one_uses_batch() {
        let model = HashingEmbedModel::new(32);
        let single = model.embed_one("solar panels").await.unwrap();
        let batch = model.embed(&["solar panels".to_string()]).await.unwrap();
        assert_eq!(single, batch[0]);
    }
}
