use std::sync::Arc;

use async_trait::async_trait;
use gf_core::Document;
use gf_error::{GfError, Result};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// 向量检索命中：文档 id 与相似度，存储端能返回正文时附带文档
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub doc_id: String,
    pub similarity: f64,
    pub document: Option<Arc<Document>>,
}

/// 向量索引协作者
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 最近邻检索，按相似度降序
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    /// 写入或覆盖文档向量
    async fn upsert(&self, documents: &[Arc<Document>], embeddings: Vec<Vec<f32>>) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// 计算余弦相似度，维度不同的向量视为不相关
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (x, y) in a.iter().zip(b) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a.sqrt() * norm_b.sqrt())
}

/// 内存中的向量条目
#[derive(Debug, Clone)]
struct MemoryEntry {
    document: Arc<Document>,
    embedding: Vec<f32>,
}

/// 基于内存的向量索引
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: Arc<RwLock<Vec<MemoryEntry>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 删除指定文档
    pub async fn remove(&self, doc_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let original_len = entries.len();
        entries.retain(|entry| entry.document.id != doc_id);
        original_len - entries.len()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    #[instrument(skip(self, vector))]
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let entries = self.entries.read().await;

        let mut scored: Vec<(f32, &MemoryEntry)> = entries
            .iter()
            .map(|entry| (cosine_similarity(vector, &entry.embedding), entry))
            .collect();

        // 按相似度排序并取 top-k
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.document.id.cmp(&b.1.document.id))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(similarity, entry)| VectorHit {
                doc_id: entry.document.id.clone(),
                similarity: similarity as f64,
                document: Some(entry.document.clone()),
            })
            .collect())
    }

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

        let mut entries = self.entries.write().await;
        for (document, embedding) in documents.iter().zip(embeddings) {
            match entries.iter_mut().find(|e| e.document.id == document.id) {
                Some(existing) => {
                    existing.document = document.clone();
                    existing.embedding = embedding;
                }
                None => entries.push(MemoryEntry {
                    document: document.clone(),
                    embedding,
                }),
            }
        }
        debug!(total = entries.len(), "内存向量索引已更新");
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> Arc<Document> {
        Arc::new(Document::new(id, format!("text of {id}")))
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_of_mismatched_dimensions_is_zero() {
        // 前两维完全相同，但维度不同
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.5]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0, 0.5], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_nearest_orders_by_similarity() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(
                &[doc("a"), doc("b"), doc("c")],
                vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
            )
            .await
            .unwrap();

        let hits = index.nearest(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "a");
        assert_eq!(hits[1].doc_id, "c");
        assert!(hits[0].document.is_some());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let index = MemoryVectorIndex::new();
        index.upsert(&[doc("a")], vec![vec![1.0, 0.0]]).await.unwrap();
        index.upsert(&[doc("a")], vec![vec![0.0, 1.0]]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.nearest(&[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(index.remove("a").await, 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_mismatched_lengths() {
        let index = MemoryVectorIndex::new();
        let err = index.upsert(&[doc("a")], vec![]).await.unwrap_err();
        assert!(matches!(err, GfError::VectorStore { .. }));
    }
}
