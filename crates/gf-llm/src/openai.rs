use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::lines::response_lines;
use crate::{
    embedding_error, generation_error, ChatModel, EmbedModel, GenerateOptions, Generation,
    GfError, Result, TokenStream, DEFAULT_EMBED_TIMEOUT,
};

const PROVIDER: &str = "openai_compat";

// ========== OpenAI-compatible (covers OpenAI, vLLM, LM Studio, Ollama /v1) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o-mini
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
    embed_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn chat_body(&self, prompt: &str, opts: &GenerateOptions, stream: bool) -> OaiChatReq {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &opts.system {
            messages.push(OaiChatReqMsg {
                role: "system".into(),
                content: system.clone(),
            });
        }
        messages.push(OaiChatReqMsg {
            role: "user".into(),
            content: prompt.to_string(),
        });
        OaiChatReq {
            model: opts
                .model
                .clone()
                .unwrap_or_else(|| self.cfg.chat_model.clone()),
            messages,
            temperature: Some(opts.temperature),
            max_tokens: Some(opts.max_tokens),
            stream,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OaiChatResp {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OaiChatRespChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize)]
struct OaiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiStreamChoice {
    delta: OaiStreamDelta,
}

#[derive(Deserialize)]
struct OaiStreamChunk {
    #[serde(default)]
    choices: Vec<OaiStreamChoice>,
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, prompt, opts))]
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<Generation> {
        let body = self.chat_body(prompt, opts, false);
        let model = body.model.clone();

        let mut req = self
            .http
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.cfg.api_key)
            .json(&body);
        if let Some(t) = opts.timeout {
            req = req.timeout(t);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| generation_error(PROVIDER, &model, opts.timeout, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(GfError::GenerationUnavailable {
                provider: PROVIDER.to_string(),
                message: format!("status={} body={}", status, txt),
            });
        }

        let data: OaiChatResp = resp
            .json()
            .await
            .map_err(|e| generation_error(PROVIDER, &model, opts.timeout, e))?;
        let content = data
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let (prompt_tokens, completion_tokens) = data
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));
        Ok(Generation {
            text: content,
            model: data.model.unwrap_or(model),
            prompt_tokens,
            completion_tokens,
        })
    }

    #[instrument(skip(self, prompt, opts))]
    async fn generate_stream(&self, prompt: &str, opts: &GenerateOptions) -> Result<TokenStream> {
        let body = self.chat_body(prompt, opts, true);
        let resp = self
            .http
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| generation_error(PROVIDER, &body.model, None, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(GfError::GenerationUnavailable {
                provider: PROVIDER.to_string(),
                message: format!("status={} body={}", status, txt),
            });
        }

        // SSE: 只处理 `data:` 行，`[DONE]` 为结束标记
        let tokens = response_lines(PROVIDER, resp)
            .take_while(|line| {
                let done = matches!(line, Ok(l) if l.trim_start_matches("data:").trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|line| async move {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => return Some(Err(e)),
                };
                let payload = match line.strip_prefix("data:") {
                    Some(payload) => payload.trim(),
                    None => return None,
                };
                match serde_json::from_str::<OaiStreamChunk>(payload) {
                    Ok(chunk) => chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(GfError::from(e))),
                }
            });
        Ok(tokens.boxed())
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.cfg.chat_model
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| GfError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(self.url("/embeddings"))
            .timeout(self.embed_timeout)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
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

        let data: OaiEmbedResp = resp
            .json()
            .await
            .map_err(|e| embedding_error(PROVIDER, e.to_string()))?;
        if data.data.len() != texts.len() {
            return Err(embedding_error(
                PROVIDER,
                format!("expected {} embeddings, got {}", texts.len(), data.data.len()),
            ));
        }
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> OpenAiCompatClient {
        OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key: "test-key".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: Some("text-embedding-3-small".to_string()),
        })
    }

    #[tokio::test]
    async fn test_generate_reads_first_choice_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {"role": "assistant", "content": "Recycle more."}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })))
            .mount(&server)
            .await;

        let generation = client(server.uri())
            .generate("prompt", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(generation.text, "Recycle more.");
        assert_eq!(generation.prompt_tokens, Some(12));
        assert_eq!(generation.completion_tokens, Some(3));
    }

    #[tokio::test]
    async fn test_generate_stream_reads_sse_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Cut \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"waste\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let tokens: Vec<String> = client(server.uri())
            .generate_stream("prompt", &GenerateOptions::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens, vec!["Cut ".to_string(), "waste".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_embedding_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": [{"embedding": [0.1]}]}))
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
    async fn test_embed_rejects_short_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2]}]
            })))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GfError::EmbeddingService { .. }));
    }
}
