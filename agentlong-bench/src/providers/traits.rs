//! Inference backend trait and shared request/response types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    /// Extra wire fields carried through untouched (`tool_calls`, `tool_call_id`, `name`)
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            extra: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }
}

/// Request for a completion from an inference backend
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Ask for server-sent events and accumulate the fragments
    pub stream: bool,
    /// Merged into the request body as-is
    pub extra_params: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temp: Option<f32>) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_extra_params(mut self, extra: Map<String, Value>) -> Self {
        self.extra_params = extra;
        self
    }
}

/// Response from an inference backend
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: String,
    pub latency_ms: u64,
}

/// Error types for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// Whether retrying the same request can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(e) => !(e.is_builder() || e.is_decode() || e.is_redirect()),
            BackendError::Api { status, .. } => {
                *status >= 500 || *status == 408 || *status == 409 || *status == 429
            }
            BackendError::RateLimited { .. }
            | BackendError::Timeout { .. }
            | BackendError::Stream(_) => true,
            BackendError::Parse(_) | BackendError::Config(_) => false,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A model that turns a message list into text
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Service name (e.g. the `[services.<name>]` key)
    fn name(&self) -> &str;

    /// Model used when the request names none
    fn default_model(&self) -> &str;

    /// Send a completion request
    async fn complete(&self, request: &CompletionRequest) -> BackendResult<CompletionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_extra_fields_flatten() {
        let json = serde_json::json!({
            "role": "tool",
            "content": "found 3 items",
            "tool_call_id": "call_7"
        });
        let msg: Message = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(msg.extra.get("tool_call_id").and_then(Value::as_str), Some("call_7"));
        assert_eq!(serde_json::to_value(&msg).unwrap(), json);

        let plain = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(plain, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::RateLimited { retry_after_ms: 10 }.is_transient());
        assert!(BackendError::Timeout { timeout_ms: 10 }.is_transient());
        assert!(BackendError::Api { status: 503, message: String::new() }.is_transient());
        assert!(BackendError::Api { status: 429, message: String::new() }.is_transient());
        assert!(!BackendError::Api { status: 400, message: String::new() }.is_transient());
        assert!(!BackendError::Config("no key".into()).is_transient());
        assert!(!BackendError::Parse("bad json".into()).is_transient());
    }

    #[test]
    fn test_request_builder() {
        let req = CompletionRequest::new(vec![Message::user("q")])
            .with_model("m")
            .with_temperature(Some(0.7))
            .with_stream(true);
        assert_eq!(req.model.as_deref(), Some("m"));
        assert_eq!(req.temperature, Some(0.7));
        assert!(req.stream);
        assert_eq!(req.max_tokens, None);
    }
}
