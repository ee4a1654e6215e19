use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gf_core::{Document, Metadata};
use gf_error::{GfError, Result};
use qdrant_client::{
    qdrant::{
        value::Kind, vectors_config::Config, with_payload_selector::SelectorOptions,
        CountPoints, CreateCollection, Distance, PointId, PointStruct, ScrollPoints, SearchPoints,
        UpsertPoints, Value, VectorParams, VectorsConfig, WithPayloadSelector,
    },
    Qdrant,
};
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::loader::DocumentLoader;
use crate::vector::{VectorHit, VectorIndex};

const SCROLL_PAGE_SIZE: u32 = 256;

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

/// 基于 Qdrant 的向量索引，payload 保存 doc_id / text / metadata
pub struct QdrantVectorIndex {
    client: Qdrant,
    collection_name: String,
    collection_ready: OnceCell<()>,
}

impl QdrantVectorIndex {
    pub fn connect(config: QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(key) = config.api_key {
            builder = builder.api_key(key);
        }
        let client = builder.build().map_err(|e| GfError::VectorStore {
            operation: "connect".to_string(),
            message: format!("Failed to connect to Qdrant: {}", e),
        })?;

        Ok(Self {
            client,
            collection_name: config.collection,
            collection_ready: OnceCell::new(),
        })
    }

    /// 文档 id 映射为稳定的点 id，重复写入即覆盖
    fn point_id(doc_id: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, doc_id.as_bytes()).to_string()
    }

    /// 确保 collection 存在，维度取自首批向量
    async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        self.collection_ready
            .get_or_try_init(|| async {
                let exists = self
                    .client
                    .collection_exists(&self.collection_name)
                    .await
                    .map_err(|e| GfError::VectorStore {
                        operation: "collection_exists".to_string(),
                        message: format!(
                            "Failed to check collection {}: {}",
                            self.collection_name, e
                        ),
                    })?;
                if !exists {
                    self.create_collection(vector_size).await?;
                }
                Ok::<(), GfError>(())
            })
            .await
            .map(|_| ())
    }

    async fn create_collection(&self, vector_size: usize) -> Result<()> {
        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: vector_size as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        let create_collection = CreateCollection {
            collection_name: self.collection_name.clone(),
            vectors_config: Some(vectors_config),
            ..Default::default()
        };

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| GfError::VectorStore {
                operation: "create_collection".to_string(),
                message: format!(
                    "Failed to create collection {}: {}",
                    self.collection_name, e
                ),
            })?;

        info!("Created Qdrant collection: {}", self.collection_name);
        Ok(())
    }

    fn payload_for(document: &Document) -> Result<HashMap<String, Value>> {
        let metadata = serde_json::to_string(&document.metadata)?;
        Ok(HashMap::from([
            ("doc_id".to_string(), string_value(&document.id)),
            ("text".to_string(), string_value(&document.text)),
            ("metadata".to_string(), string_value(&metadata)),
        ]))
    }
}

fn string_value(s: &str) -> Value {
    Value {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

fn payload_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        Some(Kind::IntegerValue(i)) => Some(i.to_string()),
        _ => None,
    }
}

/// 从 payload 还原文档；缺少 doc_id 时返回 None
fn document_from_payload(payload: &HashMap<String, Value>) -> Option<Document> {
    let id = payload_string(payload, "doc_id")?;
    let text = payload_string(payload, "text").unwrap_or_default();
    let metadata = payload_string(payload, "metadata")
        .and_then(|raw| serde_json::from_str::<Metadata>(&raw).ok())
        .unwrap_or_default();
    Some(Document { id, text, metadata })
}

fn with_payload() -> Option<WithPayloadSelector> {
    Some(WithPayloadSelector {
        selector_options: Some(SelectorOptions::Enable(true)),
    })
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    #[instrument(skip(self, vector))]
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let search_points = SearchPoints {
            collection_name: self.collection_name.clone(),
            vector: vector.to_vec(),
            limit: k as u64,
            with_payload: with_payload(),
            ..Default::default()
        };

        let search_result = self
            .client
            .search_points(search_points)
            .await
            .map_err(|e| GfError::VectorStore {
                operation: "search".to_string(),
                message: format!("Failed to search points: {}", e),
            })?;

        let mut hits = Vec::with_capacity(search_result.result.len());
        for scored_point in search_result.result {
            match document_from_payload(&scored_point.payload) {
                Some(document) => hits.push(VectorHit {
                    doc_id: document.id.clone(),
                    similarity: scored_point.score as f64,
                    document: Some(Arc::new(document)),
                }),
                None => warn!("Point without doc_id payload, skipping"),
            }
        }
        Ok(hits)
    }

    #[instrument(skip(self, documents, embeddings))]
    async fn upsert(&self, documents: &[Arc<Document>], embeddings: Vec<Vec<f32>>) -> Result<()> {
        if documents.len() != embeddings.len() {
            return Err(GfError::VectorStore {
                operation: "upsert".to_string(),
                message: format!(
                    "{} documents but {} embeddings",
                    documents.len(),
                    embeddings.len()
                ),
            });
        }
        let Some(dimension) = embeddings.first().map(Vec::len) else {
            return Ok(());
        };
        self.ensure_collection(dimension).await?;

        let mut points = Vec::with_capacity(documents.len());
        for (document, embedding) in documents.iter().zip(embeddings) {
            points.push(PointStruct {
                id: Some(PointId::from(Self::point_id(&document.id))),
                vectors: Some(embedding.into()),
                payload: Self::payload_for(document)?,
            });
        }

        let upsert_request = UpsertPoints {
            collection_name: self.collection_name.clone(),
            wait: Some(true),
            points,
            ..Default::default()
        };

        self.client
            .upsert_points(upsert_request)
            .await
            .map_err(|e| GfError::VectorStore {
                operation: "upsert_points".to_string(),
                message: format!("Failed to upsert points: {}", e),
            })?;

        info!(
            collection = %self.collection_name,
            points = documents.len(),
            "Upserted documents to Qdrant"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .client
            .count(CountPoints {
                collection_name: self.collection_name.clone(),
                exact: Some(true),
                ..Default::default()
            })
            .await?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    fn name(&self) -> &str {
        "qdrant"
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentLoader for QdrantVectorIndex {
    /// 分页滚动读取整个 collection
    async fn load(&self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let request = ScrollPoints {
                collection_name: self.collection_name.clone(),
                limit: Some(SCROLL_PAGE_SIZE),
                offset: offset.take(),
                with_payload: with_payload(),
                ..Default::default()
            };
            let page = self
                .client
                .scroll(request)
                .await
                .map_err(|e| GfError::VectorStore {
                    operation: "scroll".to_string(),
                    message: format!("Failed to scroll points: {}", e),
                })?;

            documents.extend(
                page.result
                    .iter()
                    .filter_map(|point| document_from_payload(&point.payload)),
            );

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        info!(
            collection = %self.collection_name,
            documents = documents.len(),
            "Loaded documents from Qdrant"
        );
        Ok(documents)
    }

    fn name(&self) -> &str {
        "qdrant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(
            QdrantVectorIndex::point_id("doc-1"),
            QdrantVectorIndex::point_id("doc-1")
        );
        assert_ne!(
            QdrantVectorIndex::point_id("doc-1"),
            QdrantVectorIndex::point_id("doc-2")
        );
    }

    #[test]
    fn test_payload_round_trip() {
        let document = Document::new("a", "solar panels reduce emissions")
            .with_metadata("source", "epa.gov")
            .with_metadata("year", 2023);
        let payload = QdrantVectorIndex::payload_for(&document).unwrap();
        assert_eq!(document_from_payload(&payload), Some(document));
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_existence_check_failure() {
        let index = QdrantVectorIndex::connect(QdrantConfig {
            url: "http://127.0.0.1:1".to_string(),
            collection: "greenfrog".to_string(),
            api_key: None,
        })
        .unwrap();
        let err = index
            .upsert(&[Arc::new(Document::new("a", "text"))], vec![vec![0.1, 0.2]])
            .await
            .unwrap_err();
        match err {
            GfError::VectorStore { operation, .. } => assert_eq!(operation, "collection_exists"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_payload_without_doc_id_is_skipped() {
        let payload = HashMap::from([("text".to_string(), string_value("orphan"))]);
        assert!(document_from_payload(&payload).is_none());
    }
}
