use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gf_core::{Document, RetrievalMethod, ScoredDocument};
use gf_error::{ErrorKind, GfError, Result};
use gf_llm::EmbedModel;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::lexical::{LexicalConfig, LexicalIndex, LexicalIndexStats};
use crate::vector::VectorIndex;

const EMBED_BATCH_SIZE: usize = 32;

/// 混合检索配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// RRF 平滑常数
    pub rrf_k: f64,
    /// 词汇检索列表权重
    pub lexical_weight: f64,
    /// 语义检索列表权重
    pub semantic_weight: f64,
    /// 各方法召回数 = top_k * multiplier
    pub candidate_multiplier: usize,
    /// 各方法召回上限
    pub max_candidates: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            lexical_weight: 1.0,
            semantic_weight: 1.0,
            candidate_multiplier: 2,
            max_candidates: 50,
        }
    }
}

impl HybridConfig {
    /// 每种方法的召回深度，不少于 top_k
    pub fn candidate_depth(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.candidate_multiplier)
            .min(self.max_candidates)
            .max(top_k)
    }
}

/// 单一方法的排序命中
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub document: Arc<Document>,
    pub score: f64,
}

/// RRF 融合：score = Σ weight / (rrf_k + rank)，rank 从 1 开始
///
/// 同分时依次比较：有语义分数、有词汇分数、文档 id 升序
pub fn reciprocal_rank_fusion(
    lexical: &[RankedHit],
    semantic: &[RankedHit],
    config: &HybridConfig,
) -> Vec<ScoredDocument> {
    let mut fused: HashMap<String, ScoredDocument> = HashMap::new();

    for (rank, hit) in lexical.iter().enumerate() {
        let entry = fused
            .entry(hit.document.id.clone())
            .or_insert_with(|| unscored(hit.document.clone()));
        if entry.lexical_score.is_some() {
            continue;
        }
        entry.lexical_score = Some(hit.score);
        entry.fused_score += config.lexical_weight / (config.rrf_k + (rank + 1) as f64);
    }

    for (rank, hit) in semantic.iter().enumerate() {
        let entry = fused
            .entry(hit.document.id.clone())
            .or_insert_with(|| unscored(hit.document.clone()));
        if entry.semantic_score.is_some() {
            continue;
        }
        entry.semantic_score = Some(hit.score);
        entry.fused_score += config.semantic_weight / (config.rrf_k + (rank + 1) as f64);
    }

    let mut results: Vec<ScoredDocument> = fused
        .into_values()
        .map(|mut doc| {
            doc.retrieval_method = match (doc.lexical_score, doc.semantic_score) {
                (Some(_), Some(_)) => RetrievalMethod::Hybrid,
                (None, Some(_)) => RetrievalMethod::Semantic,
                _ => RetrievalMethod::Lexical,
            };
            doc
        })
        .collect();

    results.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| b.semantic_score.is_some().cmp(&a.semantic_score.is_some()))
            .then_with(|| b.lexical_score.is_some().cmp(&a.lexical_score.is_some()))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    results
}

fn unscored(document: Arc<Document>) -> ScoredDocument {
    ScoredDocument {
        document,
        lexical_score: None,
        semantic_score: None,
        fused_score: 0.0,
        rerank_score: None,
        retrieval_method: RetrievalMethod::Hybrid,
    }
}

/// 检索结果及实际使用的方法
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub documents: Vec<ScoredDocument>,
    pub method: RetrievalMethod,
}

/// 一次加载得到的只读语料快照
#[derive(Debug)]
struct CorpusSnapshot {
    lexical: LexicalIndex,
    loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverStats {
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub lexical: LexicalIndexStats,
    pub vector_index: String,
    pub vector_count: Option<usize>,
}

/// 混合检索器：BM25 词汇检索 + 向量检索，RRF 融合
pub struct HybridRetriever {
    config: HybridConfig,
    lexical_config: LexicalConfig,
    embedder: Arc<dyn EmbedModel>,
    vector_index: Arc<dyn VectorIndex>,
    /// 读者克隆 Arc 后立即释放锁，重载时整体替换
    snapshot: RwLock<Option<Arc<CorpusSnapshot>>>,
}

impl HybridRetriever {
    pub fn new(
        config: HybridConfig,
        lexical_config: LexicalConfig,
        embedder: Arc<dyn EmbedModel>,
        vector_index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            lexical_config,
            embedder,
            vector_index,
            snapshot: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    async fn current_snapshot(&self) -> Option<Arc<CorpusSnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// 用新文档集重建词汇索引并原子替换，同 id 以后出现者为准
    pub async fn reload_documents(&self, documents: Vec<Document>) -> usize {
        let documents = dedupe_by_id(documents.into_iter().map(Arc::new));
        let lexical = LexicalIndex::build(&documents, self.lexical_config.clone());
        let count = lexical.len();
        let snapshot = Arc::new(CorpusSnapshot {
            lexical,
            loaded_at: Utc::now(),
        });

        *self.snapshot.write().await = Some(snapshot);
        info!(documents = count, "Corpus snapshot reloaded");
        count
    }

    /// 向量化写入向量索引，并合并进当前语料后重载
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn index_documents(&self, documents: Vec<Document>) -> Result<usize> {
        let documents = dedupe_by_id(documents.into_iter().map(Arc::new));

        for batch in documents.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embeddings = self.embedder.embed(&texts).await?;
            self.vector_index.upsert(batch, embeddings).await?;
        }

        let mut merged: Vec<Arc<Document>> = match self.current_snapshot().await {
            Some(snapshot) => snapshot.lexical.documents().cloned().collect(),
            None => Vec::new(),
        };
        merged.extend(documents);
        let merged = dedupe_by_id(merged);

        Ok(self
            .reload_documents(merged.iter().map(|d| d.as_ref().clone()).collect())
            .await)
    }

    /// 并发执行两路检索并融合；单路失败时降级，两路均失败才报错
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievalOutcome> {
        if top_k == 0 {
            return Ok(RetrievalOutcome {
                documents: vec![],
                method: RetrievalMethod::Hybrid,
            });
        }

        let depth = self.config.candidate_depth(top_k);
        let snapshot = self.current_snapshot().await;
        let (lexical, semantic) = tokio::join!(
            self.lexical_search(snapshot.as_deref(), query, depth),
            self.semantic_search(snapshot.as_deref(), query, depth),
        );

        let (lexical_hits, semantic_hits, method) = match (lexical, semantic) {
            (Ok(l), Ok(s)) => (l, s, RetrievalMethod::Hybrid),
            (Ok(l), Err(e)) => {
                warn!(kind = ?ErrorKind::RetrievalDegraded, error = %e, "Semantic search failed, using lexical only");
                (l, vec![], RetrievalMethod::Lexical)
            }
            (Err(e), Ok(s)) => {
                warn!(kind = ?ErrorKind::RetrievalDegraded, error = %e, "Lexical search failed, using semantic only");
                (vec![], s, RetrievalMethod::Semantic)
            }
            (Err(lexical), Err(semantic)) => {
                return Err(GfError::RetrievalUnavailable {
                    lexical: lexical.to_string(),
                    semantic: semantic.to_string(),
                })
            }
        };

        let mut documents = reciprocal_rank_fusion(&lexical_hits, &semantic_hits, &self.config);
        documents.truncate(top_k);

        debug!(
            lexical = lexical_hits.len(),
            semantic = semantic_hits.len(),
            results = documents.len(),
            method = method.as_str(),
            "Hybrid retrieval completed"
        );
        Ok(RetrievalOutcome { documents, method })
    }

    async fn lexical_search(
        &self,
        snapshot: Option<&CorpusSnapshot>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedHit>> {
        let snapshot = snapshot.ok_or_else(|| GfError::NotFound {
            resource: "lexical index".to_string(),
        })?;
        Ok(snapshot
            .lexical
            .search(query, limit)
            .into_iter()
            .map(|hit| RankedHit {
                document: hit.document,
                score: hit.score,
            })
            .collect())
    }

    async fn semantic_search(
        &self,
        snapshot: Option<&CorpusSnapshot>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedHit>> {
        let vector = self.embedder.embed_one(query).await?;
        let hits = self.vector_index.nearest(&vector, limit).await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                // 优先使用当前快照中的文档，保证两路返回同一对象
                let document = snapshot
                    .and_then(|s| s.lexical.get(&hit.doc_id).cloned())
                    .or(hit.document);
                match document {
                    Some(document) => Some(RankedHit {
                        document,
                        score: hit.similarity,
                    }),
                    None => {
                        debug!(doc_id = %hit.doc_id, "Vector hit without document, skipping");
                        None
                    }
                }
            })
            .collect())
    }

    /// 至少一路检索可用即视为健康
    pub async fn health(&self) -> bool {
        if self.current_snapshot().await.is_some() {
            return true;
        }
        self.vector_index.health_check().await.is_ok() && self.embedder.health_check().await.is_ok()
    }

    pub async fn stats(&self) -> RetrieverStats {
        let snapshot = self.current_snapshot().await;
        let vector_count = match self.vector_index.count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count vector index");
                None
            }
        };
        RetrieverStats {
            loaded: snapshot.is_some(),
            loaded_at: snapshot.as_ref().map(|s| s.loaded_at),
            lexical: snapshot
                .as_ref()
                .map(|s| s.lexical.stats())
                .unwrap_or_default(),
            vector_index: self.vector_index.name().to_string(),
            vector_count,
        }
    }
}

/// 按 id 去重，保留首次出现的位置、最后出现的内容
fn dedupe_by_id(documents: impl IntoIterator<Item = Arc<Document>>) -> Vec<Arc<Document>> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<Arc<Document>> = Vec::new();
    for doc in documents {
        match positions.get(&doc.id) {
            Some(&idx) => deduped[idx] = doc,
            None => {
                positions.insert(doc.id.clone(), deduped.len());
                deduped.push(doc);
            }
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{MemoryVectorIndex, VectorHit};
    use async_trait::async_trait;
    use gf_llm::HashingEmbedModel;

    struct FailingVectorIndex;

    #[async_trait]
    impl VectorIndex for FailingVectorIndex {
        async fn nearest(&self, _vector: &[f32], _k: usize) -> Result<Vec<VectorHit>> {
            Err(GfError::VectorStore {
                operation: "search".into(),
                message: "connection refused".into(),
            })
        }

        async fn upsert(&self, _docs: &[Arc<Document>], _embeddings: Vec<Vec<f32>>) -> Result<()> {
            Err(GfError::VectorStore {
                operation: "upsert".into(),
                message: "connection refused".into(),
            })
        }

        async fn count(&self) -> Result<usize> {
            Ok(0)
        }

        fn name(&self) -> &str {
            "failing"
        }

        async fn health_check(&self) -> Result<()> {
            Err(GfError::VectorStore {
                operation: "health".into(),
                message: "connection refused".into(),
            })
        }
    }

    fn hit(id: &str) -> RankedHit {
        RankedHit {
            document: Arc::new(Document::new(id, format!("text {id}"))),
            score: 1.0,
        }
    }

    fn retriever(vector: Arc<dyn VectorIndex>) -> HybridRetriever {
        HybridRetriever::new(
            HybridConfig::default(),
            LexicalConfig::default(),
            Arc::new(HashingEmbedModel::new(256)),
            vector,
        )
    }

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("a", "solar panels reduce emissions"),
            Document::new("b", "recycling programs cut waste"),
        ]
    }

    #[test]
    fn test_rrf_lexical_first_semantic_third() {
        let lexical = vec![hit("x"), hit("y")];
        let semantic = vec![hit("y"), hit("z"), hit("x")];
        let fused = reciprocal_rank_fusion(&lexical, &semantic, &HybridConfig::default());

        let x = fused.iter().find(|d| d.id() == "x").unwrap();
        assert!((x.fused_score - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-15);
        assert_eq!(x.retrieval_method, RetrievalMethod::Hybrid);
    }

    #[test]
    fn test_rrf_single_list_contributions() {
        let lexical = vec![hit("x"), hit("y")];
        let semantic = vec![hit("y"), hit("z"), hit("x")];
        let fused = reciprocal_rank_fusion(&lexical, &semantic, &HybridConfig::default());

        let y = fused.iter().find(|d| d.id() == "y").unwrap();
        assert!((y.fused_score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-15);
        let z = fused.iter().find(|d| d.id() == "z").unwrap();
        assert!((z.fused_score - 1.0 / 62.0).abs() < 1e-15);
        assert!(z.lexical_score.is_none());
        assert_eq!(z.retrieval_method, RetrievalMethod::Semantic);

        assert_eq!(
            fused.iter().map(|d| d.id()).collect::<Vec<_>>(),
            vec!["y", "x", "z"]
        );
    }

    #[test]
    fn test_rrf_custom_k_and_weights() {
        let config = HybridConfig {
            rrf_k: 10.0,
            lexical_weight: 0.5,
            semantic_weight: 2.0,
            ..Default::default()
        };
        let fused = reciprocal_rank_fusion(&[hit("p"), hit("q")], &[hit("q")], &config);
        let q = fused.iter().find(|d| d.id() == "q").unwrap();
        assert!((q.fused_score - (0.5 / 12.0 + 2.0 / 11.0)).abs() < 1e-15);
        let p = fused.iter().find(|d| d.id() == "p").unwrap();
        assert!((p.fused_score - 0.5 / 11.0).abs() < 1e-15);
    }

    #[test]
    fn test_rrf_tie_break() {
        // 同分：语义优先，其次词汇，最后按 id
        let fused = reciprocal_rank_fusion(
            &[hit("m"), hit("c")],
            &[hit("k"), hit("b")],
            &HybridConfig::default(),
        );
        assert_eq!(
            fused.iter().map(|d| d.id()).collect::<Vec<_>>(),
            vec!["k", "m", "b", "c"]
        );
    }

    #[test]
    fn test_candidate_depth() {
        let config = HybridConfig::default();
        assert_eq!(config.candidate_depth(5), 10);
        assert_eq!(config.candidate_depth(40), 50);
        assert_eq!(config.candidate_depth(1000), 1000);
    }

    #[tokio::test]
    async fn test_scenario_solar_query_returns_solar_document() {
        let retriever = retriever(Arc::new(MemoryVectorIndex::new()));
        retriever.index_documents(corpus()).await.unwrap();

        let outcome = retriever
            .retrieve("How does solar energy help the environment?", 1)
            .await
            .unwrap();
        assert_eq!(outcome.method, RetrievalMethod::Hybrid);
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.documents[0].id(), "a");
        assert!(outcome.documents[0].lexical_score.is_some());
        assert!(outcome.documents[0].semantic_score.is_some());
    }

    #[tokio::test]
    async fn test_degrades_to_lexical_when_vector_index_fails() {
        let retriever = retriever(Arc::new(FailingVectorIndex));
        retriever.reload_documents(corpus()).await;

        let outcome = retriever.retrieve("solar energy", 5).await.unwrap();
        assert_eq!(outcome.method, RetrievalMethod::Lexical);
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.documents[0].id(), "a");
        assert!(outcome.documents[0].semantic_score.is_none());
        assert_eq!(outcome.documents[0].retrieval_method, RetrievalMethod::Lexical);
    }

    #[tokio::test]
    async fn test_both_methods_failing_is_unavailable() {
        let retriever = retriever(Arc::new(FailingVectorIndex));
        let err = retriever.retrieve("solar", 3).await.unwrap_err();
        assert!(matches!(err, GfError::RetrievalUnavailable { .. }));
        assert!(!retriever.health().await);
    }

    #[tokio::test]
    async fn test_top_k_boundaries() {
        let retriever = retriever(Arc::new(MemoryVectorIndex::new()));
        let docs = (1..=5)
            .map(|i| Document::new(format!("d{i}"), format!("green energy note {i}")))
            .collect();
        retriever.index_documents(docs).await.unwrap();

        assert!(retriever.retrieve("green energy", 0).await.unwrap().documents.is_empty());
        let all = retriever.retrieve("green energy", 1000).await.unwrap();
        assert_eq!(all.documents.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_corpus_returns_empty_list() {
        let retriever = retriever(Arc::new(MemoryVectorIndex::new()));
        retriever.reload_documents(vec![]).await;
        let outcome = retriever.retrieve("anything at all", 5).await.unwrap();
        assert!(outcome.documents.is_empty());
        assert!(retriever.health().await);
    }

    #[tokio::test]
    async fn test_reload_dedupes_and_replaces() {
        let retriever = retriever(Arc::new(FailingVectorIndex));
        let count = retriever
            .reload_documents(vec![
                Document::new("a", "old solar text"),
                Document::new("b", "wind turbines"),
                Document::new("a", "new solar text"),
            ])
            .await;
        assert_eq!(count, 2);

        let outcome = retriever.retrieve("solar", 5).await.unwrap();
        assert_eq!(outcome.documents[0].document.text, "new solar text");

        retriever.reload_documents(vec![Document::new("c", "tidal power")]).await;
        assert!(retriever.retrieve("solar", 5).await.unwrap().documents.is_empty());
        assert_eq!(retriever.stats().await.lexical.total_documents, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reload_never_mixes_snapshots() {
        let retriever = Arc::new(retriever(Arc::new(FailingVectorIndex)));
        let generation = |prefix: &str| -> Vec<Document> {
            (0..20)
                .map(|i| Document::new(format!("{prefix}{i:02}"), format!("compost soil {i}")))
                .collect()
        };
        retriever.reload_documents(generation("a")).await;

        let writer = {
            let retriever = retriever.clone();
            let (a, b) = (generation("a"), generation("b"));
            tokio::spawn(async move {
                for round in 0..50 {
                    let docs = if round % 2 == 0 { b.clone() } else { a.clone() };
                    retriever.reload_documents(docs).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            let outcome = retriever.retrieve("compost soil", 20).await.unwrap();
            assert_eq!(outcome.documents.len(), 20);
            let first = &outcome.documents[0].id()[..1];
            assert!(outcome.documents.iter().all(|d| d.id().starts_with(first)));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
