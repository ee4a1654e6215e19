use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use gf_core::{
    validate_workspace, CacheEntry, HealthReport, PipelineMetadata, PipelineResult, QueryRequest, ScoredDocument,
    StreamEvent, StreamMetrics,
};
use gf_error::{ErrorKind, GfError, Result};
use gf_llm::{ChatModel, GenerateOptions, TokenStream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStats, SemanticCache};
use crate::context::ContextConfig;
use crate::hybrid::{HybridRetriever, RetrieverStats};
use crate::rerank::RerankStage;

/// 流式查询的事件流
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// 管线默认行为，单次请求可覆盖 use_cache / use_rerank / timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub use_cache: bool,
    pub use_rerank: bool,
    pub generation_timeout_secs: u64,
    /// 低于该融合分数的来源不进入上下文
    pub min_relevance: f64,
    #[serde(flatten)]
    pub context: ContextConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            use_rerank: true,
            generation_timeout_secs: 60,
            min_relevance: 0.0,
            context: ContextConfig::default(),
        }
    }
}

/// 单次请求解析后的执行参数，只随调用传递
#[derive(Debug, Clone)]
struct RequestPlan {
    use_cache: bool,
    use_rerank: bool,
    model: String,
    timeout: Duration,
    deadline: Instant,
}

struct Prepared {
    sources: Vec<ScoredDocument>,
    prompt: String,
    metadata: PipelineMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub cache: Option<CacheStats>,
    pub retriever: RetrieverStats,
    pub reranker: String,
    pub default_model: String,
    pub use_cache: bool,
    pub use_rerank: bool,
    pub generation_timeout_secs: u64,
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// 查询编排：缓存检查 → 检索 → 重排 → 构建上下文 → 生成 → 写缓存
#[derive(Clone)]
pub struct RagPipeline {
    cache: Option<Arc<SemanticCache>>,
    retriever: Arc<HybridRetriever>,
    rerank: RerankStage,
    chat: Arc<dyn ChatModel>,
    config: Arc<PipelineConfig>,
}

impl RagPipeline {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        rerank: RerankStage,
        chat: Arc<dyn ChatModel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cache: None,
            retriever,
            rerank,
            chat,
            config: Arc::new(config),
        }
    }

    pub fn with_cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.retriever
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn plan(&self, request: &QueryRequest, deadline: Option<Instant>) -> RequestPlan {
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.config.generation_timeout_secs));
        RequestPlan {
            use_cache: request.use_cache.unwrap_or(self.config.use_cache) && self.cache.is_some(),
            use_rerank: request.use_rerank.unwrap_or(self.config.use_rerank),
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.chat.default_model().to_string()),
            timeout,
            deadline: deadline.unwrap_or_else(|| Instant::now() + timeout),
        }
    }

    fn base_metadata(&self, request: &QueryRequest, plan: &RequestPlan) -> PipelineMetadata {
        PipelineMetadata {
            model: plan.model.clone(),
            workspace: request.workspace.clone(),
            use_cache: plan.use_cache,
            use_rerank: plan.use_rerank,
            ..Default::default()
        }
    }

    fn generate_options(&self, request: &QueryRequest, plan: &RequestPlan) -> GenerateOptions {
        GenerateOptions {
            model: Some(plan.model.clone()),
            system: Some(self.config.context.system_prompt.clone()),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            timeout: Some(plan.deadline.saturating_duration_since(Instant::now())),
        }
    }

    fn timeout_error(plan: &RequestPlan) -> GfError {
        GfError::GenerationTimeout {
            model: plan.model.clone(),
            timeout_ms: plan.timeout.as_millis() as u64,
        }
    }

    /// 使用默认截止时间执行查询
    pub async fn query(&self, request: QueryRequest) -> Result<PipelineResult> {
        self.run(request, None).await
    }

    /// 在给定截止时间前完成生成，否则返回 GenerationTimeout
    pub async fn query_with_deadline(
        &self,
        request: QueryRequest,
        deadline: Instant,
    ) -> Result<PipelineResult> {
        self.run(request, Some(deadline)).await
    }

    #[instrument(skip(self, request), fields(workspace = %request.workspace, top_k = request.top_k))]
    async fn run(&self, request: QueryRequest, deadline: Option<Instant>) -> Result<PipelineResult> {
        let started = Instant::now();
        request.validate()?;
        let plan = self.plan(&request, deadline);
        let mut metadata = self.base_metadata(&request, &plan);

        if let Some((entry, cache_time)) = self.check_cache(&request, &plan).await {
            return Ok(cached_result(entry, metadata, cache_time, started));
        }
        if plan.use_cache {
            metadata.cache_time_ms = Some(ms(started.elapsed()));
        }

        let prepared = timeout_at(plan.deadline, self.prepare(&request, &plan, metadata))
            .await
            .map_err(|_| Self::timeout_error(&plan))??;
        let mut metadata = prepared.metadata;

        let generation_started = Instant::now();
        let opts = self.generate_options(&request, &plan);
        let generation = timeout_at(plan.deadline, self.chat.generate(&prepared.prompt, &opts))
            .await
            .map_err(|_| Self::timeout_error(&plan))??;
        metadata.generation_time_ms = ms(generation_started.elapsed());
        metadata.model = generation.model.clone();
        metadata.prompt_tokens = generation.prompt_tokens;
        metadata.completion_tokens = generation.completion_tokens;

        if plan.use_cache {
            if let Some(cache) = &self.cache {
                store_before(
                    plan.deadline,
                    cache,
                    &request,
                    &generation.text,
                    &prepared.sources,
                    &generation.model,
                )
                .await;
            }
        }

        metadata.total_time_ms = ms(started.elapsed());
        info!(
            total_ms = metadata.total_time_ms,
            sources = metadata.source_count,
            no_context = metadata.no_context_found,
            "RAG query completed"
        );

        Ok(PipelineResult {
            response_text: generation.text,
            sources: prepared.sources,
            metadata,
            timestamp: Utc::now(),
        })
    }

    async fn check_cache(
        &self,
        request: &QueryRequest,
        plan: &RequestPlan,
    ) -> Option<(CacheEntry, Duration)> {
        if !plan.use_cache {
            return None;
        }
        let cache = self.cache.as_ref()?;
        let started = Instant::now();
        let lookup = cache.lookup(&request.workspace, &request.text);
        let entry = match timeout_at(plan.deadline, lookup).await {
            Ok(entry) => entry?,
            Err(_) => {
                warn!(kind = ?ErrorKind::CacheUnavailable, "Cache lookup hit the request deadline, treating as miss");
                return None;
            }
        };
        debug!(workspace = %request.workspace, "Serving answer from semantic cache");
        Some((entry, started.elapsed()))
    }

    /// 检索、重排、按相关度过滤并构建提示词
    async fn prepare(
        &self,
        request: &QueryRequest,
        plan: &RequestPlan,
        mut metadata: PipelineMetadata,
    ) -> Result<Prepared> {
        let retrieval_started = Instant::now();
        let fetch = if plan.use_rerank {
            request.top_k * 2
        } else {
            request.top_k
        };
        let outcome = self.retriever.retrieve(&request.text, fetch).await?;
        metadata.retrieval_time_ms = ms(retrieval_started.elapsed());
        metadata.retrieval_method = Some(outcome.method);

        let rerank_started = Instant::now();
        let mut sources = self
            .rerank
            .apply(&request.text, outcome.documents, plan.use_rerank)
            .await;
        metadata.rerank_time_ms = ms(rerank_started.elapsed());

        sources.truncate(request.top_k);
        sources.retain(|s| s.fused_score >= self.config.min_relevance);

        let context = self.config.context.build_context(&sources);
        metadata.context_length = context.chars().count();
        metadata.source_count = sources.len();
        metadata.no_context_found = sources.is_empty();
        if metadata.no_context_found {
            info!(workspace = %request.workspace, "No relevant context found, generating without sources");
        }

        Ok(Prepared {
            prompt: self.config.context.build_prompt(&request.text, &context),
            sources,
            metadata,
        })
    }

    /// 流式查询：准备阶段的错误直接返回，生成阶段的错误作为流中的 Err 项
    #[instrument(skip(self, request), fields(workspace = %request.workspace, top_k = request.top_k))]
    pub async fn query_stream(&self, request: QueryRequest) -> Result<EventStream> {
        let started = Instant::now();
        request.validate()?;
        let plan = self.plan(&request, None);
        let mut metadata = self.base_metadata(&request, &plan);

        if let Some((entry, cache_time)) = self.check_cache(&request, &plan).await {
            let result = cached_result(entry, metadata, cache_time, started);
            let mut metrics = StreamMetrics::default();
            metrics.observe(&result.response_text, started.elapsed());
            let events = vec![
                Ok(StreamEvent::Token {
                    token: result.response_text,
                    metrics: metrics.clone(),
                }),
                Ok(StreamEvent::Done {
                    metrics,
                    metadata: result.metadata,
                    sources: result.sources,
                }),
            ];
            return Ok(stream::iter(events).boxed());
        }
        if plan.use_cache {
            metadata.cache_time_ms = Some(ms(started.elapsed()));
        }

        let prepared = timeout_at(plan.deadline, self.prepare(&request, &plan, metadata))
            .await
            .map_err(|_| Self::timeout_error(&plan))??;
        let opts = self.generate_options(&request, &plan);
        let tokens = timeout_at(plan.deadline, self.chat.generate_stream(&prepared.prompt, &opts))
            .await
            .map_err(|_| Self::timeout_error(&plan))??;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cache = if plan.use_cache { self.cache.clone() } else { None };
        tokio::spawn(forward_tokens(tokens, tx, cache, request, plan, prepared, started));

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// 管理操作：失效缓存，未启用缓存时返回 0
    pub async fn invalidate_cache(&self, workspace: &str, query: Option<&str>) -> Result<usize> {
        validate_workspace(workspace)?;
        match &self.cache {
            Some(cache) => cache.invalidate(workspace, query).await,
            None => Ok(0),
        }
    }

    /// 各依赖独立检查；未启用缓存视为健康
    pub async fn health(&self) -> HealthReport {
        let cache = async {
            match &self.cache {
                Some(cache) => cache.health().await,
                None => true,
            }
        };
        let llm = async {
            match self.chat.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(kind = ?e.kind(), error = %e, "LLM health check failed");
                    false
                }
            }
        };
        let (cache, retriever, reranker, llm) =
            tokio::join!(cache, self.retriever.health(), self.rerank.health(), llm);
        HealthReport::new(cache, retriever, reranker, llm)
    }

    pub async fn stats(&self) -> PipelineStats {
        let cache = match &self.cache {
            Some(cache) => match cache.stats(None).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(kind = ?e.kind(), error = %e, "Failed to read cache stats");
                    None
                }
            },
            None => None,
        };
        PipelineStats {
            cache,
            retriever: self.retriever.stats().await,
            reranker: self.rerank.name().to_string(),
            default_model: self.chat.default_model().to_string(),
            use_cache: self.config.use_cache,
            use_rerank: self.config.use_rerank,
            generation_timeout_secs: self.config.generation_timeout_secs,
        }
    }
}

fn cached_result(
    entry: CacheEntry,
    mut metadata: PipelineMetadata,
    cache_time: Duration,
    started: Instant,
) -> PipelineResult {
    metadata.cached = true;
    metadata.cache_time_ms = Some(ms(cache_time));
    metadata.model = entry.model;
    metadata.source_count = entry.sources.len();
    metadata.total_time_ms = ms(started.elapsed());
    PipelineResult {
        response_text: entry.response_text,
        sources: entry.sources,
        metadata,
        timestamp: Utc::now(),
    }
}

/// 写缓存同样受请求截止时间约束，超时只记录日志
async fn store_before(
    deadline: Instant,
    cache: &SemanticCache,
    request: &QueryRequest,
    response: &str,
    sources: &[ScoredDocument],
    model: &str,
) {
    let store = cache.store(&request.workspace, &request.text, response, sources, model);
    if timeout_at(deadline, store).await.is_err() {
        warn!(kind = ?ErrorKind::CacheUnavailable, workspace = %request.workspace, "Cache write hit the request deadline, skipped");
    }
}

/// 把 LLM token 转发给消费者；消费者断开时丢弃上游流且不写缓存
async fn forward_tokens(
    mut tokens: TokenStream,
    tx: mpsc::Sender<Result<StreamEvent>>,
    cache: Option<Arc<SemanticCache>>,
    request: QueryRequest,
    plan: RequestPlan,
    prepared: Prepared,
    started: Instant,
) {
    let generation_started = Instant::now();
    let mut metrics = StreamMetrics::default();
    let mut response = String::new();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                info!(tokens = metrics.token_count, "Stream consumer disconnected, cancelling generation");
                return;
            }
            next = timeout_at(plan.deadline, tokens.next()) => next,
        };

        let token = match next {
            Ok(Some(Ok(token))) => token,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(kind = ?e.kind(), error = %e, "Generation stream failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
            Err(_) => {
                let _ = tx.send(Err(RagPipeline::timeout_error(&plan))).await;
                return;
            }
        };

        metrics.observe(&token, generation_started.elapsed());
        response.push_str(&token);
        let event = StreamEvent::Token {
            token,
            metrics: metrics.clone(),
        };
        if tx.send(Ok(event)).await.is_err() {
            info!("Stream consumer disconnected, cancelling generation");
            return;
        }
    }
    drop(tokens);

    let mut metadata = prepared.metadata;
    metadata.generation_time_ms = ms(generation_started.elapsed());
    metadata.completion_tokens = Some(metrics.token_count as u32);

    if let Some(cache) = cache.filter(|_| !tx.is_closed()) {
        store_before(
            plan.deadline,
            &cache,
            &request,
            &response,
            &prepared.sources,
            &plan.model,
        )
        .await;
    }

    metrics.update_elapsed(generation_started.elapsed());
    metadata.total_time_ms = ms(started.elapsed());
    let done = StreamEvent::Done {
        metrics,
        metadata,
        sources: prepared.sources,
    };
    if tx.send(Ok(done)).await.is_err() {
        debug!("Stream consumer left before completion event");
    }
}
