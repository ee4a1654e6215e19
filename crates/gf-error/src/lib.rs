use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum GfError {
    // === 请求错误 ===
    #[error("验证失败: {message}")]
    Validation { message: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    // === 管线错误 ===
    #[error("缓存后端不可用 ({backend}): {message}")]
    CacheUnavailable { backend: String, message: String },

    #[error("检索不可用: lexical={lexical}, semantic={semantic}")]
    RetrievalUnavailable { lexical: String, semantic: String },

    #[error("生成超时: {model} 超过 {timeout_ms}ms")]
    GenerationTimeout { model: String, timeout_ms: u64 },

    #[error("生成服务不可用 ({provider}): {message}")]
    GenerationUnavailable { provider: String, message: String },

    #[error("嵌入服务错误 ({provider}): {message}")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("向量存储错误: {operation} 失败")]
    VectorStore { operation: String, message: String },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("并发错误: {operation}")]
    Concurrency { operation: String, message: String },
}

/// 对外暴露的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CacheUnavailable,
    /// 单一检索通道失败，仅用于日志与元数据，不作为错误返回
    RetrievalDegraded,
    RetrievalUnavailable,
    GenerationTimeout,
    GenerationUnavailable,
    ValidationError,
    NotFound,
    EmbeddingUnavailable,
    VectorStore,
    Internal,
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的请求错误
    Medium,   // 依赖故障但可降级
    High,     // 影响当前请求的错误
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub workspace: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

/// 返回给调用方的错误载荷，不包含内部细节
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl GfError {
    pub fn validation(message: impl Into<String>) -> Self {
        GfError::Validation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GfError::Internal {
            message: message.into(),
            details: None,
        }
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            GfError::Validation { .. } => ErrorKind::ValidationError,
            GfError::NotFound { .. } => ErrorKind::NotFound,
            GfError::CacheUnavailable { .. } => ErrorKind::CacheUnavailable,
            GfError::RetrievalUnavailable { .. } => ErrorKind::RetrievalUnavailable,
            GfError::GenerationTimeout { .. } => ErrorKind::GenerationTimeout,
            GfError::GenerationUnavailable { .. } => ErrorKind::GenerationUnavailable,
            GfError::EmbeddingService { .. } => ErrorKind::EmbeddingUnavailable,
            GfError::VectorStore { .. } => ErrorKind::VectorStore,
            _ => ErrorKind::Internal,
        }
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GfError::Validation { .. } | GfError::NotFound { .. } => ErrorSeverity::Low,
            GfError::CacheUnavailable { .. }
            | GfError::EmbeddingService { .. }
            | GfError::VectorStore { .. }
            | GfError::Network { .. }
            | GfError::Timeout { .. } => ErrorSeverity::Medium,
            GfError::RetrievalUnavailable { .. }
            | GfError::GenerationTimeout { .. }
            | GfError::GenerationUnavailable { .. }
            | GfError::Serialization { .. }
            | GfError::Concurrency { .. } => ErrorSeverity::High,
            GfError::Internal { .. } | GfError::Configuration { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            GfError::GenerationTimeout { .. } => true,
            GfError::Network { .. } | GfError::Timeout { .. } => true,
            GfError::EmbeddingService { retry_after, .. } => retry_after.is_some(),
            GfError::Concurrency { .. } => true,
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            GfError::EmbeddingService { retry_after, .. } => *retry_after,
            GfError::GenerationTimeout { .. } => Some(std::time::Duration::from_millis(1000)),
            GfError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            GfError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            GfError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    workspace = ?metadata.workspace,
                    request_id = ?metadata.request_id,
                    kind = ?self.kind(),
                    error = %self,
                    "请求错误"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    workspace = ?metadata.workspace,
                    request_id = ?metadata.request_id,
                    kind = ?self.kind(),
                    error = %self,
                    context = ?metadata.context,
                    "依赖错误"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    workspace = ?metadata.workspace,
                    request_id = ?metadata.request_id,
                    kind = ?self.kind(),
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "严重错误"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            GfError::Validation { .. } => 400,
            GfError::NotFound { .. } => 404,
            GfError::GenerationTimeout { .. } | GfError::Timeout { .. } => 504,
            GfError::RetrievalUnavailable { .. }
            | GfError::GenerationUnavailable { .. }
            | GfError::CacheUnavailable { .. }
            | GfError::EmbeddingService { .. } => 503,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            GfError::Validation { message } => format!("请求参数有误: {message}"),
            GfError::NotFound { .. } => "请求的资源不存在".to_string(),
            GfError::RetrievalUnavailable { .. } => "知识库检索暂时不可用，请稍后重试".to_string(),
            GfError::GenerationTimeout { .. } => "模型生成超时，请重试".to_string(),
            GfError::GenerationUnavailable { .. } => "模型服务不可用，请联系管理员".to_string(),
            GfError::CacheUnavailable { .. } => "缓存服务暂时不可用".to_string(),
            GfError::EmbeddingService { .. } => "嵌入服务暂时不可用，请稍后重试".to_string(),
            GfError::Timeout { .. } => "请求超时，请重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: self.kind(),
            message: self.user_message(),
            retryable: self.is_retryable(),
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                workspace: None,
                request_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn workspace(mut self, workspace: &str) -> Self {
        self.metadata.workspace = Some(workspace.to_string());
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.metadata.request_id = Some(request_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &GfError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, GfError>;

// === 转换实现 ===

impl From<serde_json::Error> for GfError {
    fn from(err: serde_json::Error) -> Self {
        GfError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GfError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GfError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000, // 默认超时时间
            }
        } else if err.is_connect() {
            GfError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            GfError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio::task::JoinError> for GfError {
    fn from(err: tokio::task::JoinError) -> Self {
        GfError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<qdrant_client::QdrantError> for GfError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        GfError::VectorStore {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for GfError {
    fn from(err: redis::RedisError) -> Self {
        GfError::CacheUnavailable {
            backend: "redis".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for GfError {
    fn from(err: anyhow::Error) -> Self {
        GfError::Internal {
            message: err.to_string(),
            details: None,
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for GfError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status_code, Json(self.to_payload())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_errors_are_distinct() {
        let timeout = GfError::GenerationTimeout {
            model: "phi3:mini".to_string(),
            timeout_ms: 5000,
        };
        let unavailable = GfError::GenerationUnavailable {
            provider: "ollama".to_string(),
            message: "connection refused".to_string(),
        };

        assert_eq!(timeout.kind(), ErrorKind::GenerationTimeout);
        assert_eq!(unavailable.kind(), ErrorKind::GenerationUnavailable);
        assert!(timeout.is_retryable());
        assert!(!unavailable.is_retryable());
        assert_eq!(timeout.to_http_status(), 504);
        assert_eq!(unavailable.to_http_status(), 503);
    }

    #[test]
    fn test_validation_maps_to_bad_request() {
        let err = GfError::validation("top_k must be between 1 and 20");
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(err.to_http_status(), 400);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_payload_hides_internal_details() {
        let err = GfError::Internal {
            message: "pool poisoned".to_string(),
            details: Some("stack frame 0x1f".to_string()),
        };
        let payload = serde_json::to_value(err.to_payload()).unwrap();
        assert_eq!(payload["error"], "internal");
        let text = payload.to_string();
        assert!(!text.contains("pool poisoned"));
        assert!(!text.contains("0x1f"));
    }

    #[test]
    fn test_metadata_builder_uses_error_severity() {
        let err = GfError::RetrievalUnavailable {
            lexical: "index not loaded".to_string(),
            semantic: "qdrant unreachable".to_string(),
        };
        let metadata = ErrorMetadataBuilder::new("pipeline")
            .operation("retrieve")
            .workspace("greenfrog")
            .context("top_k", "5")
            .build(&err);
        assert!(matches!(metadata.severity, ErrorSeverity::High));
        assert_eq!(metadata.workspace.as_deref(), Some("greenfrog"));
        assert_eq!(metadata.context.get("top_k").map(String::as_str), Some("5"));
    }
}
