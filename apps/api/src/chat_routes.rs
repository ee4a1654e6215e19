use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use gf_core::{PipelineResult, QueryRequest, StreamEvent};
use gf_error::{ErrorMetadataBuilder, GfError, Result};
use gf_rag::{EventStream, PipelineStats};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub workspace: String,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub deleted_count: usize,
}

/// 对话接口，挂载在 /api/v2/chat 下
pub fn create_chat_routes() -> Router<AppState> {
    Router::new()
        .route("/query", post(query))
        .route("/stream", post(query_stream))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/cache/invalidate", post(invalidate_cache))
}

fn log_failure(operation: &str, workspace: &str, err: GfError) -> GfError {
    let metadata = ErrorMetadataBuilder::new("chat_api")
        .operation(operation)
        .workspace(workspace)
        .build(&err);
    err.log(&metadata);
    err
}

async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<PipelineResult>> {
    let workspace = req.workspace.clone();
    let result = state
        .pipeline
        .query(req)
        .await
        .map_err(|e| log_failure("query", &workspace, e))?;
    Ok(Json(result))
}

/// SSE：token 事件逐个推送，done 事件收尾，出错时发送 error 事件并结束
async fn query_stream(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let workspace = req.workspace.clone();
    let events = state
        .pipeline
        .query_stream(req)
        .await
        .map_err(|e| log_failure("query_stream", &workspace, e))?;
    Ok(Sse::new(to_sse(events)).keep_alive(KeepAlive::default()))
}

fn to_sse(events: EventStream) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    events
        .scan(false, |failed, item| {
            if *failed {
                return futures::future::ready(None);
            }
            let event = match item {
                Ok(event) => sse_event(&event),
                Err(e) => {
                    *failed = true;
                    warn!(kind = ?e.kind(), error = %e, "stream generation failed");
                    error_event(&e)
                }
            };
            futures::future::ready(Some(Ok(event)))
        })
}

fn sse_event(event: &StreamEvent) -> Event {
    let name = match event {
        StreamEvent::Token { .. } => "token",
        StreamEvent::Done { .. } => "done",
    };
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => error_event(&GfError::from(e)),
    }
}

fn error_event(err: &GfError) -> Event {
    let data = serde_json::to_string(&err.to_payload())
        .unwrap_or_else(|_| err.user_message());
    Event::default().event("error").data(data)
}

/// 不健康时返回 503
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.pipeline.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.pipeline.stats().await)
}

async fn invalidate_cache(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    let deleted_count = state
        .pipeline
        .invalidate_cache(&req.workspace, req.query.as_deref())
        .await
        .map_err(|e| log_failure("invalidate_cache", &req.workspace, e))?;
    Ok(Json(InvalidateResponse { deleted_count }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use futures::stream;
    use gf_core::Document;
    use gf_llm::{ChatModel, GenerateOptions, Generation, HashingEmbedModel, TokenStream};
    use gf_rag::{
        CacheConfig, HybridConfig, HybridRetriever, KeywordReranker, LexicalConfig,
        MemoryCacheBackend, MemoryVectorIndex, PipelineConfig, RagPipeline, RerankStage,
        SemanticCache,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    struct EchoChat;

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<Generation> {
            Ok(Generation {
                text: "Composting turns food scraps into soil.".to_string(),
                model: "echo".to_string(),
                prompt_tokens: Some(12),
                completion_tokens: Some(7),
            })
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<TokenStream> {
            let tokens = vec![Ok("Compost".to_string()), Ok("ing".to_string())];
            Ok(stream::iter(tokens).boxed())
        }

        fn provider(&self) -> &str {
            "echo"
        }

        fn default_model(&self) -> &str {
            "echo"
        }
    }

    async fn test_app() -> Router {
        let embed = Arc::new(HashingEmbedModel::new(64));
        let retriever = Arc::new(HybridRetriever::new(
            HybridConfig::default(),
            LexicalConfig::default(),
            embed.clone(),
            Arc::new(MemoryVectorIndex::new()),
        ));
        retriever
            .index_documents(vec![
                Document::new("c1", "Composting turns food scraps into nutrient rich soil"),
                Document::new("s1", "Solar panels convert sunlight into electricity"),
            ])
            .await
            .unwrap();
        let cache = Arc::new(SemanticCache::new(
            Arc::new(MemoryCacheBackend::new()),
            embed,
            CacheConfig::default(),
        ));
        let pipeline = RagPipeline::new(
            retriever,
            RerankStage::new(Arc::new(KeywordReranker::new(0.2))),
            Arc::new(EchoChat),
            PipelineConfig::default(),
        )
        .with_cache(cache);
        crate::build_router(AppState::new(pipeline))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_query_then_cached() {
        let app = test_app().await;
        let body = serde_json::json!({ "text": "How does composting work?" });

        let first = app
            .clone()
            .oneshot(post_json("/api/v2/chat/query", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_json(first).await;
        assert_eq!(first["metadata"]["cached"], false);
        assert_eq!(first["sources"][0]["document"]["id"], "c1");

        let second = app
            .oneshot(post_json("/api/v2/chat/query", body))
            .await
            .unwrap();
        let second = body_json(second).await;
        assert_eq!(second["metadata"]["cached"], true);
        assert_eq!(second["response_text"], first["response_text"]);
    }

    #[tokio::test]
    async fn test_validation_error_is_bad_request() {
        let app = test_app().await;
        let response = app
            .oneshot(post_json(
                "/api/v2/chat/query",
                serde_json::json!({ "text": "compost", "top_k": 0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_stream_emits_tokens_then_done() {
        let app = test_app().await;
        let response = app
            .oneshot(post_json(
                "/api/v2/chat/stream",
                serde_json::json!({ "text": "composting", "use_cache": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        let names: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(names, vec!["token", "token", "done"]);
    }

    #[tokio::test]
    async fn test_invalidate_and_health() {
        let app = test_app().await;
        app.clone()
            .oneshot(post_json(
                "/api/v2/chat/query",
                serde_json::json!({ "text": "How does composting work?" }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v2/chat/cache/invalidate",
                serde_json::json!({ "workspace": "greenfrog" }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["deleted_count"], 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v2/chat/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
    }
}
