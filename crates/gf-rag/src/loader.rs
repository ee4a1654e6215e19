use std::path::PathBuf;

use async_trait::async_trait;
use gf_core::Document;
use gf_error::{GfError, Result};
use tracing::info;

/// 文档来源：启动或重载时提供完整文档集
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<Document>>;

    fn name(&self) -> &str;
}

/// 从 JSONL 文件加载文档，每行一个 `{"id", "text", "metadata"}`
pub struct JsonlDocumentLoader {
    path: PathBuf,
}

impl JsonlDocumentLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(content: &str) -> Result<Vec<Document>> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str::<Document>(line).map_err(|e| GfError::Serialization {
                    format: "jsonl".to_string(),
                    message: format!("line {}: {}", idx + 1, e),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentLoader for JsonlDocumentLoader {
    async fn load(&self) -> Result<Vec<Document>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| GfError::Configuration {
                key: "corpus.path".to_string(),
                reason: format!("{}: {}", self.path.display(), e),
            })?;
        let documents = Self::parse(&content)?;
        info!(
            path = %self.path.display(),
            documents = documents.len(),
            "Loaded documents from JSONL"
        );
        Ok(documents)
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_lines() {
        let content = r#"{"id":"a","text":"solar panels reduce emissions","metadata":{"source":"epa"}}

{"id":"b","text":"recycling programs cut waste"}
"#;
        let docs = JsonlDocumentLoader::parse(content).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].source_label(), "epa");
        assert!(docs[1].metadata.is_empty());
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = JsonlDocumentLoader::parse("{\"id\":\"a\",\"text\":\"x\"}\nnot json").unwrap_err();
        match err {
            GfError::Serialization { message, .. } => assert!(message.starts_with("line 2")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let loader = JsonlDocumentLoader::new("/nonexistent/corpus.jsonl");
        assert!(matches!(
            loader.load().await,
            Err(GfError::Configuration { .. })
        ));
    }
}
