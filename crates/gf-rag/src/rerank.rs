use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use gf_core::ScoredDocument;
use gf_error::{GfError, Result};
use gf_llm::EmbedModel;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::vector::cosine_similarity;

/// 重排器抽象接口
///
/// 输入与输出必须是同一组候选，只允许调整顺序和写入 `rerank_score`。
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: Vec<ScoredDocument>)
        -> Result<Vec<ScoredDocument>>;

    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// 按 rerank_score 降序稳定排序
fn sort_by_rerank_score(candidates: &mut [ScoredDocument]) {
    candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));
}

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// 基于关键词重叠的重排器
pub struct KeywordReranker {
    boost_factor: f64,
}

impl KeywordReranker {
    pub fn new(boost_factor: f64) -> Self {
        Self { boost_factor }
    }

    /// 查询词在文档中出现的比例
    fn overlap(query_terms: &HashSet<String>, text: &str) -> f64 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let doc_terms = terms(text);
        let matches = query_terms.iter().filter(|t| doc_terms.contains(*t)).count();
        matches as f64 / query_terms.len() as f64
    }
}

#[async_trait]
impl Reranker for KeywordReranker {
    #[instrument(skip(self, candidates))]
    async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<ScoredDocument>,
    ) -> Result<Vec<ScoredDocument>> {
        let query_terms = terms(query);
        for candidate in &mut candidates {
            let overlap = Self::overlap(&query_terms, &candidate.document.text);
            candidate.rerank_score = Some(candidate.score() * (1.0 + self.boost_factor * overlap));
        }
        sort_by_rerank_score(&mut candidates);

        debug!(results_count = candidates.len(), "Keyword reranking completed");
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// 基于分数的重排器：沿用融合分数
pub struct ScoreReranker;

#[async_trait]
impl Reranker for ScoreReranker {
    async fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<ScoredDocument>,
    ) -> Result<Vec<ScoredDocument>> {
        for candidate in &mut candidates {
            candidate.rerank_score = Some(candidate.score());
        }
        sort_by_rerank_score(&mut candidates);
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "score"
    }
}

/// 长度奖励重排器：越接近最优长度奖励越大
pub struct LengthReranker {
    optimal_length: usize,
    length_penalty_factor: f64,
}

impl LengthReranker {
    pub fn new(optimal_length: usize, length_penalty_factor: f64) -> Self {
        Self {
            optimal_length: optimal_length.max(1),
            length_penalty_factor,
        }
    }

    fn length_score(&self, text_length: usize) -> f64 {
        let deviation = (text_length as f64 - self.optimal_length as f64).abs();
        let normalized_deviation = deviation / self.optimal_length as f64;
        (-normalized_deviation * self.length_penalty_factor).exp()
    }
}

#[async_trait]
impl Reranker for LengthReranker {
    #[instrument(skip(self, candidates))]
    async fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<ScoredDocument>,
    ) -> Result<Vec<ScoredDocument>> {
        for candidate in &mut candidates {
            let bonus = self.length_score(candidate.document.text.chars().count());
            candidate.rerank_score = Some(candidate.score() * bonus);
        }
        sort_by_rerank_score(&mut candidates);

        debug!(
            results_count = candidates.len(),
            optimal_length = self.optimal_length,
            "Length reranking completed"
        );
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "length"
    }
}

/// 语义相似度重排器：查询与候选一次批量向量化
pub struct SemanticReranker {
    embed_model: Arc<dyn EmbedModel>,
    similarity_threshold: f64,
    boost_factor: f64,
}

impl SemanticReranker {
    pub fn new(embed_model: Arc<dyn EmbedModel>, similarity_threshold: f64, boost_factor: f64) -> Self {
        Self {
            embed_model,
            similarity_threshold,
            boost_factor,
        }
    }
}

#[async_trait]
impl Reranker for SemanticReranker {
    #[instrument(skip(self, candidates))]
    async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<ScoredDocument>,
    ) -> Result<Vec<ScoredDocument>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let mut texts = Vec::with_capacity(candidates.len() + 1);
        texts.push(query.to_string());
        texts.extend(candidates.iter().map(|c| c.document.text.clone()));
        let embeddings = self.embed_model.embed(&texts).await?;
        if embeddings.len() != texts.len() {
            return Err(GfError::EmbeddingService {
                provider: "rerank".to_string(),
                message: format!("expected {} embeddings, got {}", texts.len(), embeddings.len()),
                retry_after: None,
            });
        }

        let (query_embedding, doc_embeddings) = embeddings.split_at(1);
        for (candidate, embedding) in candidates.iter_mut().zip(doc_embeddings) {
            let similarity = cosine_similarity(&query_embedding[0], embedding) as f64;
            let base = candidate.score();
            candidate.rerank_score = Some(if similarity >= self.similarity_threshold {
                base * (1.0 + similarity * self.boost_factor)
            } else {
                base
            });
        }
        sort_by_rerank_score(&mut candidates);

        debug!(results_count = candidates.len(), "Semantic reranking completed");
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "semantic"
    }

    async fn health_check(&self) -> Result<()> {
        self.embed_model.health_check().await
    }
}

/// 组合重排器：依次串联，后一个以前一个的分数为基础
#[derive(Default)]
pub struct CompositeReranker {
    rerankers: Vec<Arc<dyn Reranker>>,
}

impl CompositeReranker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.rerankers.push(reranker);
        self
    }
}

#[async_trait]
impl Reranker for CompositeReranker {
    #[instrument(skip(self, candidates))]
    async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<ScoredDocument>,
    ) -> Result<Vec<ScoredDocument>> {
        for reranker in &self.rerankers {
            candidates = reranker.rerank(query, candidates).await?;
        }
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "composite"
    }

    async fn health_check(&self) -> Result<()> {
        let mut errors = Vec::new();
        for reranker in &self.rerankers {
            if let Err(e) = reranker.health_check().await {
                errors.push(format!("{}: {}", reranker.name(), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GfError::internal(format!(
                "composite reranker unhealthy ({})",
                errors.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankKind {
    Keyword,
    Score,
    Length,
    Semantic,
    Composite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub kind: RerankKind,
    pub boost_factor: f64,
    pub optimal_length: usize,
    pub length_penalty: f64,
    pub similarity_threshold: f64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            kind: RerankKind::Keyword,
            boost_factor: 0.2,
            optimal_length: 500,
            length_penalty: 0.1,
            similarity_threshold: 0.0,
        }
    }
}

/// 重排器工厂
pub struct RerankerFactory;

impl RerankerFactory {
    pub fn from_config(config: &RerankConfig, embed_model: Arc<dyn EmbedModel>) -> Arc<dyn Reranker> {
        match config.kind {
            RerankKind::Keyword => Arc::new(KeywordReranker::new(config.boost_factor)),
            RerankKind::Score => Arc::new(ScoreReranker),
            RerankKind::Length => Arc::new(LengthReranker::new(
                config.optimal_length,
                config.length_penalty,
            )),
            RerankKind::Semantic => Arc::new(SemanticReranker::new(
                embed_model,
                config.similarity_threshold,
                config.boost_factor,
            )),
            RerankKind::Composite => Arc::new(
                CompositeReranker::new()
                    .add_reranker(Arc::new(LengthReranker::new(
                        config.optimal_length,
                        config.length_penalty,
                    )))
                    .add_reranker(Arc::new(KeywordReranker::new(config.boost_factor))),
            ),
        }
    }
}

/// 管线中的重排阶段：关闭时原样返回，失败或改变候选集合时回退为原顺序
#[derive(Clone)]
pub struct RerankStage {
    reranker: Arc<dyn Reranker>,
}

impl RerankStage {
    pub fn new(reranker: Arc<dyn Reranker>) -> Self {
        Self { reranker }
    }

    pub fn name(&self) -> &str {
        self.reranker.name()
    }

    pub async fn apply(
        &self,
        query: &str,
        candidates: Vec<ScoredDocument>,
        enabled: bool,
    ) -> Vec<ScoredDocument> {
        if !enabled || candidates.is_empty() {
            return candidates;
        }

        match self.reranker.rerank(query, candidates.clone()).await {
            Ok(reranked) if same_candidates(&candidates, &reranked) => reranked,
            Ok(reranked) => {
                warn!(
                    reranker = self.reranker.name(),
                    before = candidates.len(),
                    after = reranked.len(),
                    "Reranker changed the candidate set, keeping fused order"
                );
                candidates
            }
            Err(e) => {
                warn!(
                    reranker = self.reranker.name(),
                    kind = ?e.kind(),
                    error = %e,
                    "Reranking failed, keeping fused order"
                );
                candidates
            }
        }
    }

    pub async fn health(&self) -> bool {
        self.reranker.health_check().await.is_ok()
    }
}

fn same_candidates(before: &[ScoredDocument], after: &[ScoredDocument]) -> bool {
    if before.len() != after.len() {
        return false;
    }
    let mut a: Vec<&str> = before.iter().map(|d| d.id()).collect();
    let mut b: Vec<&str> = after.iter().map(|d| d.id()).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
