pub mod cache;
pub mod cache_backend;
pub mod clock;
pub mod context;
pub mod hybrid;
pub mod lexical;
pub mod loader;
pub mod pipeline;
pub mod qdrant;
pub mod rerank;
pub mod vector;

pub use cache::{CacheConfig, CacheStats, SemanticCache};
pub use cache_backend::{CacheBackend, MemoryCacheBackend, RedisCacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::ContextConfig;
pub use hybrid::{
    reciprocal_rank_fusion, HybridConfig, HybridRetriever, RankedHit, RetrievalOutcome,
    RetrieverStats,
};
pub use lexical::{LexicalConfig, LexicalIndex, LexicalIndexStats};
pub use loader::{DocumentLoader, JsonlDocumentLoader};
pub use pipeline::{EventStream, PipelineConfig, PipelineStats, RagPipeline};
pub use qdrant::{QdrantConfig, QdrantVectorIndex};
pub use rerank::{
    CompositeReranker, KeywordReranker, LengthReranker, RerankConfig, RerankKind, RerankStage,
    Reranker, RerankerFactory, ScoreReranker, SemanticReranker,
};
pub use vector::{cosine_similarity, MemoryVectorIndex, VectorHit, VectorIndex};

// 重新导出核心类型
pub use gf_core::{Document, PipelineResult, QueryRequest, ScoredDocument, StreamEvent};
pub use gf_error::{GfError, Result};
