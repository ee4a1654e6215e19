use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::lines::response_lines;
use crate::{
    embedding_error, generation_error, ChatModel, EmbedModel, GenerateOptions, Generation,
    GfError, Result, TokenStream, DEFAULT_EMBED_TIMEOUT,
};

const PROVIDER: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String, // e.g. http://localhost:11434
    pub model: String,    // e.g. phi3:mini
    pub embedding_model: Option<String>,
    /// 非流式请求的默认超时
    pub timeout: Option<Duration>,
}

/// Ollama 本地推理服务客户端
#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    cfg: OllamaConfig,
    embed_timeout: Duration,
}

impl OllamaClient {
    pub fn new(cfg: OllamaConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GfError::Configuration {
                key: "ollama.http_client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            cfg,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
        })
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn request_body<'a>(
        &'a self,
        prompt: &'a str,
        opts: &'a GenerateOptions,
        stream: bool,
    ) -> OllamaGenerateReq<'a> {
        OllamaGenerateReq {
            model: opts.model.as_deref().unwrap_or(&self.cfg.model),
            prompt,
            system: opts.system.as_deref(),
            stream,
            options: OllamaOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens,
            },
        }
    }

    async fn error_from_status(resp: reqwest::Response) -> GfError {
        let status = resp.status();
        let txt = resp.text().await.unwrap_or_default();
        GfError::GenerationUnavailable {
            provider: PROVIDER.to_string(),
            message: format!("status={} body={}", status, txt),
        }
    }
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaGenerateReq<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaGenerateResp {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct OllamaEmbedReq<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResp {
    embedding: Vec<f32>,
}

#[async_trait]
impl ChatModel for OllamaClient {
    #[instrument(skip(self, prompt, opts))]
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<Generation> {
        let body = self.request_body(prompt, opts, false);
        let model = body.model.to_string();
        let timeout = opts.timeout.or(self.cfg.timeout);

        let mut req = self.http.post(self.url("/api/generate")).json(&body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| generation_error(PROVIDER, &model, timeout, e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_status(resp).await);
        }

        let data: OllamaGenerateResp = resp
            .json()
            .await
            .map_err(|e| generation_error(PROVIDER, &model, timeout, e))?;
        debug!(
            model = %model,
            prompt_tokens = ?data.prompt_eval_count,
            completion_tokens = ?data.eval_count,
            "Ollama generation completed"
        );
        Ok(Generation {
            text: data.response,
            model: data.model.unwrap_or(model),
            prompt_tokens: data.prompt_eval_count,
            completion_tokens: data.eval_count,
        })
    }

    #[instrument(skip(self, prompt, opts))]
    async fn generate_stream(&self, prompt: &str, opts: &GenerateOptions) -> Result<TokenStream> {
        let body = self.request_body(prompt, opts, true);
        let model = body.model.to_string();

        // 流式请求不设整体超时，由调用方的截止时间控制
        let resp = self
            .http
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| generation_error(PROVIDER, &model, None, e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_status(resp).await);
        }

        let tokens = response_lines(PROVIDER, resp).filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            match serde_json::from_str::<OllamaStreamChunk>(&line) {
                Ok(chunk) => match chunk.error {
                    Some(message) => Some(Err(GfError::GenerationUnavailable {
                        provider: PROVIDER.to_string(),
                        message,
                    })),
                    None if chunk.response.is_empty() => None,
                    None => Some(Ok(chunk.response)),
                },
                Err(e) => Some(Err(GfError::from(e))),
            }
        });
        Ok(tokens.boxed())
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.cfg.model
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| generation_error(PROVIDER, &self.cfg.model, None, e))?;
        if !resp.status().is_success() {
            return Err(Self::error_from_status(resp).await);
        }
        Ok(())
    }
}

#[async_trait]
impl EmbedModel for OllamaClient {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .as_deref()
            .ok_or_else(|| GfError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;

        // /api/embeddings 每次只接受一条文本
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let resp = self
                .http
                .post(self.url("/api/embeddings"))
                .timeout(self.embed_timeout)
                .json(&OllamaEmbedReq {
                    model,
                    prompt: text,
                })
                .send()
                .await
                .map_err(|e| embedding_error(PROVIDER, e.to_string()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let txt = resp.text().await.unwrap_or_default();
                return Err(embedding_error(
                    PROVIDER,
                    format!("status={} body={}", status, txt),
                ));
            }

            let data: OllamaEmbedResp = resp
                .json()
                .await
                .map_err(|e| embedding_error(PROVIDER, e.to_string()))?;
            out.push(data.embedding);
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| embedding_error(PROVIDER, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(embedding_error(
                PROVIDER,
                format!("status={}", resp.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> OllamaClient {
        OllamaClient::new(OllamaConfig {
            base_url,
            model: "phi3:mini".to_string(),
            embedding_model: Some("nomic-embed-text:latest".to_string()),
            timeout: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_parses_response_and_token_counts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "phi3:mini",
                "stream": false,
                "options": {"num_predict": 64}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "phi3:mini",
                "response": "Composting turns scraps into soil.",
                "done": true,
                "prompt_eval_count": 42,
                "eval_count": 7
            })))
            .mount(&server)
            .await;

        let opts = GenerateOptions {
            max_tokens: 64,
            ..Default::default()
        };
        let generation = client(server.uri()).generate("prompt", &opts).await.unwrap();
        assert_eq!(generation.text, "Composting turns scraps into soil.");
        assert_eq!(generation.prompt_tokens, Some(42));
        assert_eq!(generation.completion_tokens, Some(7));
    }

    #[tokio::test]
    async fn test_generate_stream_reads_ndjson() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"response\":\"Solar \",\"done\":false}\n",
            "{\"response\":\"power\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n"
        );
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let stream = client(server.uri())
            .generate_stream("prompt", &GenerateOptions::default())
            .await
            .unwrap();
        let tokens: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(tokens, vec!["Solar ".to_string(), "power".to_string()]);
    }

    #[tokio::test]
    async fn test_server_error_is_generation_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .generate("prompt", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GfError::GenerationUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_slow_response_is_generation_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"response": "late"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let opts = GenerateOptions {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let err = client(server.uri())
            .generate("prompt", &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, GfError::GenerationTimeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_embed_calls_once_per_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embedding": [0.25, 0.5, 0.25]})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let vectors = client(server.uri())
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.25, 0.5, 0.25]);
    }

    #[tokio::test]
    async fn test_slow_embedding_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embedding": [0.25]}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let err = client(server.uri())
            .with_embed_timeout(Duration::from_millis(100))
            .embed(&["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GfError::EmbeddingService { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let err = client("http://127.0.0.1:9".to_string())
            .generate("prompt", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GfError::GenerationUnavailable { .. }));
    }
}
