//! OpenAI-compatible chat completions client
//!
//! Works against any service exposing `POST {base_url}/chat/completions`:
//! hosted APIs, proxies and local engines alike.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::sse::{chat_events, collect_completion, sse_data_stream};
use super::traits::{
    BackendError, BackendResult, CompletionRequest, CompletionResponse, InferenceBackend, Message,
};
use crate::config::ServiceConfig;
use crate::runner::rate_limiter::RateLimiter;

/// Client for one OpenAI-compatible service
pub struct OpenAICompatClient {
    service: String,
    api_key: String,
    base_url: String,
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    default_model: String,
    extra_headers: BTreeMap<String, String>,
}

impl OpenAICompatClient {
    pub fn new(
        service: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: Client::new(),
            rate_limiter: Arc::new(RateLimiter::new(60, 1_000_000)),
            default_model: model.into(),
            extra_headers: BTreeMap::new(),
        }
    }

    /// Build from a `[services.<name>]` entry
    pub fn from_service(name: &str, config: &ServiceConfig) -> BackendResult<Self> {
        let api_key = config
            .resolve_api_key(name)
            .map_err(|e| BackendError::Config(e.to_string()))?;

        let mut client = Self::new(name, &config.base_url, api_key, &config.model_name)
            .with_rate_limits(config.rpm, config.tpm)
            .with_headers(config.extra_headers.clone());
        if let Some(timeout_ms) = config.timeout_ms {
            client = client.with_http_timeout(Duration::from_millis(timeout_ms))?;
        }
        Ok(client)
    }

    /// Set custom rate limits
    pub fn with_rate_limits(mut self, rpm: u32, tpm: u32) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(rpm, tpm));
        self
    }

    /// Set default model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.extra_headers = headers;
        self
    }

    /// Per-request transport timeout
    pub fn with_http_timeout(mut self, timeout: Duration) -> BackendResult<Self> {
        self.http_client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, request: &CompletionRequest) -> ChatRequest {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        // o-series and gpt-5 models take max_completion_tokens and reject a custom temperature
        let is_reasoning = ["o1", "o3", "o4"].iter().any(|p| model.starts_with(p));
        let uses_completion_tokens = is_reasoning || model.starts_with("gpt-5");

        ChatRequest {
            max_tokens: if uses_completion_tokens { None } else { request.max_tokens },
            max_completion_tokens: if uses_completion_tokens { request.max_tokens } else { None },
            temperature: if is_reasoning { None } else { request.temperature },
            top_p: request.top_p,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions { include_usage: true }),
            messages: request.messages.clone(),
            model,
            extra: request.extra_params.clone(),
        }
    }

    async fn error_for_status(&self, response: reqwest::Response) -> BackendError {
        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60)
                * 1000;

            // 429 covers both throttling and an exhausted quota; only the former is worth retrying
            let body = response.text().await.unwrap_or_default();
            if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
                let error_type = error.error.error_type.as_deref().unwrap_or("");
                if error_type == "insufficient_quota"
                    || error.error.message.contains("exceeded your current quota")
                {
                    return BackendError::Config(format!(
                        "{} quota exceeded: {}",
                        self.service, error.error.message
                    ));
                }
                tracing::debug!("Rate limited (type={}): {}", error_type, error.error.message);
            }

            return BackendError::RateLimited {
                retry_after_ms: retry_after,
            };
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(error) => error.error.message,
            Err(_) => format!("HTTP {}: {}", status.as_u16(), body),
        };

        if status == 401 || status == 403 {
            return BackendError::Config(format!(
                "{} auth error ({}): {}",
                self.service,
                status.as_u16(),
                message
            ));
        }

        BackendError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

#[async_trait]
impl InferenceBackend for OpenAICompatClient {
    fn name(&self) -> &str {
        &self.service
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, request: &CompletionRequest) -> BackendResult<CompletionResponse> {
        self.rate_limiter.acquire().await;

        let start = Instant::now();
        let body = self.build_body(request);
        let model = body.model.clone();

        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.json(&body).send().await?;
        if !response.status().is_success() {
            return Err(self.error_for_status(response).await);
        }

        if request.stream {
            let streamed = collect_completion(chat_events(sse_data_stream(response))).await?;
            let latency_ms = start.elapsed().as_millis() as u64;
            self.rate_limiter
                .record_tokens(streamed.input_tokens + streamed.output_tokens)
                .await;
            tracing::debug!(
                "{} streamed {} chars in {}ms",
                self.service,
                streamed.content.len(),
                latency_ms
            );
            return Ok(CompletionResponse {
                content: streamed.content,
                model: streamed.model.unwrap_or(model),
                input_tokens: streamed.input_tokens,
                output_tokens: streamed.output_tokens,
                finish_reason: streamed.finish_reason.unwrap_or_else(|| "unknown".to_string()),
                latency_ms,
            });
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (input_tokens, output_tokens) = api_response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        self.rate_limiter.record_tokens(input_tokens + output_tokens).await;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse("No choices in response".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: if api_response.model.is_empty() { model } else { api_response.model },
            input_tokens,
            output_tokens,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "unknown".to_string()),
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(model: &str) -> OpenAICompatClient {
        OpenAICompatClient::new("local", "http://localhost:8000/v1/", "EMPTY", model)
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(client("m").base_url(), "http://localhost:8000/v1");
    }

    #[test]
    fn test_body_merges_extra_params() {
        let mut extra = Map::new();
        extra.insert("stop".to_string(), serde_json::json!(["</answer>"]));
        let request = CompletionRequest::new(vec![Message::user("q")])
            .with_temperature(Some(0.7))
            .with_max_tokens(Some(512))
            .with_extra_params(extra);

        let body = serde_json::to_value(client("qwen2.5-7b").build_body(&request)).unwrap();
        assert_eq!(body["model"], "qwen2.5-7b");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["stop"][0], "</answer>");
        assert!(body.get("stream").is_none());
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn test_reasoning_models_use_completion_tokens() {
        let request = CompletionRequest::new(vec![Message::user("q")])
            .with_temperature(Some(0.7))
            .with_max_tokens(Some(100))
            .with_stream(true);
        let body = serde_json::to_value(client("o3-mini").build_body(&request)).unwrap();
        assert_eq!(body["max_completion_tokens"], 100);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_tool_turn_fields_pass_through() {
        let mut extra = Map::new();
        extra.insert("tool_call_id".to_string(), serde_json::json!("call_1"));
        let request = CompletionRequest::new(vec![Message::new("tool", "3 items").with_extra(extra)]);
        let body = serde_json::to_value(client("m").build_body(&request)).unwrap();
        assert_eq!(body["messages"][0]["tool_call_id"], "call_1");
    }
}
