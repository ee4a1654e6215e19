use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use gf_error::{GfError as Error, Result};

pub const DEFAULT_WORKSPACE: &str = "greenfrog";
pub const MAX_QUERY_CHARS: usize = 10_000;
pub const MAX_TOP_K: usize = 20;
pub const MAX_GENERATION_TOKENS: u32 = 4096;
pub const MAX_WORKSPACE_CHARS: usize = 64;

/// workspace 名会成为缓存键的一段，只允许字母、数字与 `-` `_` `.`
pub fn validate_workspace(workspace: &str) -> Result<()> {
    if workspace.is_empty() {
        return Err(Error::validation("workspace must not be empty"));
    }
    if workspace.chars().count() > MAX_WORKSPACE_CHARS {
        return Err(Error::validation(format!(
            "workspace exceeds {MAX_WORKSPACE_CHARS} characters"
        )));
    }
    if let Some(c) = workspace
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::validation(format!(
            "workspace contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// 文档元数据，值为标量 (source, title, 时间戳等)
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// 可检索的最小文本单元，由外部加载器创建，管线内只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// 来源标签：metadata.source > metadata.title > id
    pub fn source_label(&self) -> String {
        ["source", "title"]
            .iter()
            .find_map(|key| self.metadata.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Lexical,
    Semantic,
    Hybrid,
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMethod::Lexical => "lexical",
            RetrievalMethod::Semantic => "semantic",
            RetrievalMethod::Hybrid => "hybrid",
        }
    }
}

/// 带排序信号的文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Arc<Document>,
    pub lexical_score: Option<f64>,
    pub semantic_score: Option<f64>,
    pub fused_score: f64,
    pub rerank_score: Option<f64>,
    pub retrieval_method: RetrievalMethod,
}

impl ScoredDocument {
    /// 最终排序分数：有重排分数时优先使用
    pub fn score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.fused_score)
    }

    pub fn id(&self) -> &str {
        &self.document.id
    }

    /// 生成用于缓存的摘要，正文截断到 `max_chars` 个字符
    pub fn summarize(&self, max_chars: usize) -> ScoredDocument {
        let mut summary = self.clone();
        if self.document.text.chars().count() > max_chars {
            let text: String = self.document.text.chars().take(max_chars).collect();
            summary.document = Arc::new(Document {
                id: self.document.id.clone(),
                text: format!("{text}..."),
                metadata: self.document.metadata.clone(),
            });
        }
        summary
    }
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

/// 用户查询及其运行时参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(alias = "message")]
    pub text: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_top_k", alias = "k")]
    pub top_k: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub use_cache: Option<bool>,
    #[serde(default)]
    pub use_rerank: Option<bool>,
    #[serde(default)]
    pub model: Option<String>,
    /// 本次请求的生成截止时间，覆盖服务默认值
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            workspace: default_workspace(),
            top_k: default_top_k(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            use_cache: None,
            use_rerank: None,
            model: None,
            timeout_ms: None,
        }
    }

    pub fn workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = Some(enabled);
        self
    }

    pub fn use_rerank(mut self, enabled: bool) -> Self {
        self.use_rerank = Some(enabled);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// 在任何 I/O 之前完成参数校验
    pub fn validate(&self) -> Result<()> {
        let chars = self.text.trim().chars().count();
        if chars == 0 {
            return Err(Error::validation("query text must not be empty"));
        }
        if self.text.chars().count() > MAX_QUERY_CHARS {
            return Err(Error::validation(format!(
                "query text exceeds {MAX_QUERY_CHARS} characters"
            )));
        }
        validate_workspace(&self.workspace)?;
        if self.top_k == 0 || self.top_k > MAX_TOP_K {
            return Err(Error::validation(format!(
                "top_k must be between 1 and {MAX_TOP_K}, got {}",
                self.top_k
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::validation(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 || self.max_tokens > MAX_GENERATION_TOKENS {
            return Err(Error::validation(format!(
                "max_tokens must be between 1 and {MAX_GENERATION_TOKENS}, got {}",
                self.max_tokens
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::validation("timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// 缓存的 (查询向量, 回答) 对
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub workspace: String,
    pub query_text: String,
    pub query_embedding: Vec<f32>,
    pub response_text: String,
    pub sources: Vec<ScoredDocument>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age >= chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

/// 请求级元数据：缓存命中、各阶段耗时、模型与 token 统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub cached: bool,
    pub cache_time_ms: Option<f64>,
    pub retrieval_method: Option<RetrievalMethod>,
    pub retrieval_time_ms: f64,
    pub rerank_time_ms: f64,
    pub generation_time_ms: f64,
    pub total_time_ms: f64,
    pub model: String,
    pub workspace: String,
    pub context_length: usize,
    pub source_count: usize,
    pub use_cache: bool,
    pub use_rerank: bool,
    pub no_context_found: bool,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub response_text: String,
    pub sources: Vec<ScoredDocument>,
    pub metadata: PipelineMetadata,
    pub timestamp: DateTime<Utc>,
}

/// 流式生成的累计指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub token_count: u64,
    pub chunk_count: u64,
    pub total_characters: u64,
    pub elapsed_ms: f64,
    pub tokens_per_second: f64,
}

impl StreamMetrics {
    pub fn observe(&mut self, chunk: &str, elapsed: Duration) {
        self.chunk_count += 1;
        if !chunk.is_empty() {
            self.token_count += 1;
            self.total_characters += chunk.chars().count() as u64;
        }
        self.update_elapsed(elapsed);
    }

    pub fn update_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let secs = elapsed.as_secs_f64().max(0.001);
        self.tokens_per_second = (self.token_count as f64 / secs * 100.0).round() / 100.0;
    }
}

/// 流式查询事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Token {
        token: String,
        metrics: StreamMetrics,
    },
    Done {
        metrics: StreamMetrics,
        metadata: PipelineMetadata,
        sources: Vec<ScoredDocument>,
    },
}

impl StreamEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { error: String },
}

/// 各依赖独立上报的健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub cache: bool,
    pub retriever: bool,
    pub reranker: bool,
    pub llm: bool,
    #[serde(flatten)]
    pub status: HealthStatus,
}

impl HealthReport {
    pub fn new(cache: bool, retriever: bool, reranker: bool, llm: bool) -> Self {
        let status = if cache && retriever && reranker && llm {
            HealthStatus::Healthy
        } else if retriever && llm {
            let mut down = Vec::new();
            if !cache {
                down.push("cache");
            }
            if !reranker {
                down.push("reranker");
            }
            HealthStatus::Degraded {
                reason: format!("unavailable: {}", down.join(", ")),
            }
        } else {
            let mut down = Vec::new();
            if !retriever {
                down.push("retriever");
            }
            if !llm {
                down.push("llm");
            }
            HealthStatus::Unhealthy {
                error: format!("unavailable: {}", down.join(", ")),
            }
        };
        Self {
            cache,
            retriever,
            reranker,
            llm,
            status,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.status, HealthStatus::Unhealthy { .. })
    }
}
