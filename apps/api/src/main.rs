use axum::{routing::get, Json, Router};

mod chat_routes;
mod config;

use dotenv::dotenv;
use gf_llm::make_providers;
use gf_rag::{
    CacheBackend, DocumentLoader, HybridRetriever, JsonlDocumentLoader, MemoryCacheBackend,
    MemoryVectorIndex, QdrantConfig, QdrantVectorIndex, RagPipeline, RedisCacheBackend,
    RerankStage, RerankerFactory, SemanticCache, VectorIndex,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{load_config, AppConfig, CacheBackendKind, VectorStoreCfg};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RagPipeline>,
}

impl AppState {
    pub fn new(pipeline: RagPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();
    let cfg = load_config()?;

    let pipeline = build_pipeline(&cfg).await?;
    let app = build_router(AppState::new(pipeline));

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, "gf-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v2/chat", chat_routes::create_chat_routes())
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status":"ok"}))
}

/// 启动时组装管线：提供商 → 向量索引 → 检索器 → 重排 → 缓存
async fn build_pipeline(cfg: &AppConfig) -> anyhow::Result<RagPipeline> {
    let providers = make_providers(cfg.chat_provider_config()?, cfg.embed_provider_config()?)?;
    info!(
        provider = providers.chat.provider(),
        model = providers.chat.default_model(),
        "chat provider ready"
    );

    let (vector_index, qdrant): (Arc<dyn VectorIndex>, Option<Arc<QdrantVectorIndex>>) =
        match &cfg.vector_store {
            VectorStoreCfg::Memory => {
                let index: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::new());
                (index, None)
            }
            VectorStoreCfg::Qdrant {
                url,
                collection,
                api_key_env,
            } => {
                let index = Arc::new(QdrantVectorIndex::connect(QdrantConfig {
                    url: url.clone(),
                    collection: collection.clone(),
                    api_key: api_key_env.as_deref().and_then(|k| std::env::var(k).ok()),
                })?);
                info!(%url, %collection, "qdrant vector store");
                let dyn_index: Arc<dyn VectorIndex> = index.clone();
                (dyn_index, Some(index))
            }
        };

    let retriever = Arc::new(HybridRetriever::new(
        cfg.retrieval.hybrid.clone(),
        cfg.retrieval.lexical(),
        providers.embed.clone(),
        vector_index,
    ));

    match (&cfg.corpus.path, qdrant) {
        (Some(path), _) => {
            let documents = JsonlDocumentLoader::new(path).load().await?;
            let count = retriever.index_documents(documents).await?;
            info!(%path, documents = count, "corpus indexed");
        }
        (None, Some(qdrant)) => {
            let documents = qdrant.load().await?;
            let count = retriever.reload_documents(documents).await;
            info!(
                loader = DocumentLoader::name(qdrant.as_ref()),
                documents = count,
                "corpus loaded"
            );
        }
        (None, None) => {
            warn!("no corpus configured, starting with an empty knowledge base");
            retriever.reload_documents(Vec::new()).await;
        }
    }

    let reranker = RerankerFactory::from_config(&cfg.rerank, providers.embed.clone());
    let mut pipeline = RagPipeline::new(
        retriever,
        RerankStage::new(reranker),
        providers.chat,
        cfg.pipeline.clone(),
    );

    let backend: Option<Arc<dyn CacheBackend>> = match cfg.cache.backend {
        CacheBackendKind::Redis => {
            let redis: Arc<dyn CacheBackend> =
                Arc::new(RedisCacheBackend::new(&cfg.cache.redis_url)?);
            Some(redis)
        }
        CacheBackendKind::Memory => {
            let memory: Arc<dyn CacheBackend> = Arc::new(MemoryCacheBackend::new());
            Some(memory)
        }
        CacheBackendKind::Disabled => None,
    };
    if let Some(backend) = backend {
        info!(backend = backend.name(), "semantic cache enabled");
        pipeline = pipeline.with_cache(Arc::new(SemanticCache::new(
            backend,
            providers.embed,
            cfg.cache.semantic.clone(),
        )));
    }

    Ok(pipeline)
}
