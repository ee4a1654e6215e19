use std::sync::Arc;

use gf_core::{CacheEntry, ScoredDocument};
use gf_error::{ErrorKind, Result};
use gf_llm::EmbedModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::cache_backend::CacheBackend;
use crate::clock::{Clock, SystemClock};
use crate::vector::cosine_similarity;

/// 语义缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 命中所需的最小余弦相似度
    pub similarity_threshold: f64,
    pub ttl_seconds: u64,
    pub key_prefix: String,
    /// 缓存来源时保留的正文字符数
    pub source_text_chars: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            ttl_seconds: 3600,
            key_prefix: "gf:semantic_cache".to_string(),
            source_text_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub workspace: Option<String>,
    pub entries: usize,
    pub similarity_threshold: f64,
    pub ttl_seconds: u64,
}

/// 按查询向量相似度命中的回答缓存
///
/// 后端故障只影响命中率：查询失败视为未命中，写入失败只记录日志。
pub struct SemanticCache {
    backend: Arc<dyn CacheBackend>,
    embedder: Arc<dyn EmbedModel>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl SemanticCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        embedder: Arc<dyn EmbedModel>,
        config: CacheConfig,
    ) -> Self {
        Self::with_clock(backend, embedder, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn CacheBackend>,
        embedder: Arc<dyn EmbedModel>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            embedder,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn workspace_prefix(&self, workspace: &str) -> String {
        format!("{}:{}:", self.config.key_prefix, workspace)
    }

    /// `{prefix}:{workspace}:{sha256(embedding)}`
    pub fn key_for(&self, workspace: &str, embedding: &[f32]) -> String {
        let mut hasher = Sha256::new();
        for value in embedding {
            hasher.update(value.to_le_bytes());
        }
        format!("{}{:x}", self.workspace_prefix(workspace), hasher.finalize())
    }

    /// 查找相似度最高且未过期的条目，低于阈值或任何故障都返回 None
    #[instrument(skip(self, query_text), fields(query_len = query_text.len()))]
    pub async fn lookup(&self, workspace: &str, query_text: &str) -> Option<CacheEntry> {
        let embedding = match self.embedder.embed_one(query_text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Failed to embed query for cache lookup");
                return None;
            }
        };

        match self.find_nearest(workspace, &embedding).await {
            Ok(Some((entry, similarity))) => {
                debug!(similarity, workspace, "Semantic cache hit");
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(kind = ?e.kind(), error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// 读取 workspace 命名空间下的条目，只保留 workspace 字段完全一致的
    async fn workspace_entries(&self, workspace: &str) -> Result<Vec<(String, CacheEntry)>> {
        let keys = self
            .backend
            .keys_with_prefix(&self.workspace_prefix(workspace))
            .await?;
        let values = self.backend.get_many(&keys).await?;

        let mut entries = Vec::with_capacity(keys.len());
        for (key, raw) in keys.into_iter().zip(values) {
            let Some(raw) = raw else {
                continue;
            };
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) if entry.workspace == workspace => entries.push((key, entry)),
                Ok(_) => {}
                Err(e) => debug!(key = %key, error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(entries)
    }

    async fn find_nearest(
        &self,
        workspace: &str,
        embedding: &[f32],
    ) -> Result<Option<(CacheEntry, f64)>> {
        let now = self.clock.now();
        let mut best: Option<(CacheEntry, f64)> = None;
        for (_, entry) in self.workspace_entries(workspace).await? {
            if entry.is_expired_at(now) {
                continue;
            }
            let similarity = cosine_similarity(embedding, &entry.query_embedding) as f64;
            if similarity < self.config.similarity_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(_, s)| similarity > *s) {
                best = Some((entry, similarity));
            }
        }
        Ok(best)
    }

    /// 写入缓存；失败只记录日志
    #[instrument(skip_all, fields(workspace = workspace))]
    pub async fn store(
        &self,
        workspace: &str,
        query_text: &str,
        response_text: &str,
        sources: &[ScoredDocument],
        model: &str,
    ) {
        if let Err(e) = self
            .try_store(workspace, query_text, response_text, sources, model)
            .await
        {
            warn!(kind = ?e.kind(), error = %e, "Failed to write semantic cache entry");
        }
    }

    async fn try_store(
        &self,
        workspace: &str,
        query_text: &str,
        response_text: &str,
        sources: &[ScoredDocument],
        model: &str,
    ) -> Result<()> {
        let embedding = self.embedder.embed_one(query_text).await?;
        let key = self.key_for(workspace, &embedding);
        let entry = CacheEntry {
            workspace: workspace.to_string(),
            query_text: query_text.to_string(),
            query_embedding: embedding,
            response_text: response_text.to_string(),
            sources: sources
                .iter()
                .map(|s| s.summarize(self.config.source_text_chars))
                .collect(),
            model: model.to_string(),
            created_at: self.clock.now(),
            ttl_seconds: self.config.ttl_seconds,
        };

        let payload = serde_json::to_string(&entry)?;
        self.backend
            .set_ex(&key, payload, self.config.ttl_seconds)
            .await?;
        debug!(key = %key, "Semantic cache entry stored");
        Ok(())
    }

    /// 失效缓存：指定查询时按原文精确匹配，否则清空整个 workspace
    #[instrument(skip(self))]
    pub async fn invalidate(&self, workspace: &str, query_text: Option<&str>) -> Result<usize> {
        let targets: Vec<String> = self
            .workspace_entries(workspace)
            .await?
            .into_iter()
            .filter(|(_, entry)| query_text.map_or(true, |q| entry.query_text == q))
            .map(|(key, _)| key)
            .collect();

        let deleted = self.backend.delete(&targets).await?;
        info!(workspace, deleted, "Semantic cache invalidated");
        Ok(deleted)
    }

    pub async fn stats(&self, workspace: Option<&str>) -> Result<CacheStats> {
        let entries = match workspace {
            Some(ws) => self.workspace_entries(ws).await?.len(),
            None => self
                .backend
                .keys_with_prefix(&format!("{}:", self.config.key_prefix))
                .await?
                .len(),
        };
        Ok(CacheStats {
            backend: self.backend.name().to_string(),
            workspace: workspace.map(str::to_string),
            entries,
            similarity_threshold: self.config.similarity_threshold,
            ttl_seconds: self.config.ttl_seconds,
        })
    }

    pub async fn health(&self) -> bool {
        self.backend.ping().await.is_ok()
    }
}
