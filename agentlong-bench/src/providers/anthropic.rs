//! Anthropic Messages API client
//!
//! Chat histories arrive in OpenAI shape; tool calls and tool results are
//! rewritten into `tool_use` / `tool_result` content blocks on the way out.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::traits::{
    BackendError, BackendResult, CompletionRequest, CompletionResponse, InferenceBackend, Message,
};
use crate::config::ServiceConfig;
use crate::runner::rate_limiter::RateLimiter;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Client for one Anthropic-style service
pub struct AnthropicClient {
    service: String,
    api_key: String,
    base_url: String,
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    default_model: String,
    extra_headers: BTreeMap<String, String>,
}

impl AnthropicClient {
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
            rate_limiter: Arc::new(RateLimiter::new(60, 100_000)),
            default_model: model.into(),
            extra_headers: BTreeMap::new(),
        }
    }

    /// Build from a `[services.<name>]` entry with `api_style = "anthropic"`
    pub fn from_service(name: &str, config: &ServiceConfig) -> BackendResult<Self> {
        let api_key = config
            .resolve_api_key(name)
            .map_err(|e| BackendError::Config(e.to_string()))?;

        let mut client = Self::new(name, &config.base_url, api_key, &config.model_name)
            .with_rate_limits(config.rpm, config.tpm)
            .with_headers(config.extra_headers.clone());
        if let Some(timeout_ms) = config.timeout_ms {
            client.http_client = Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()?;
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

    /// Extra request headers such as `anthropic-beta`
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.extra_headers = headers;
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> AnthropicRequest {
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        AnthropicRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: to_anthropic_messages(&request.messages),
            system: (!system.is_empty()).then_some(system),
            temperature: request.temperature,
            top_p: request.top_p,
            extra: request.extra_params.clone(),
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize, PartialEq)]
struct AnthropicMessage {
    role: String,
    content: Vec<Value>,
}

/// Convert OpenAI-shaped turns into Anthropic content blocks
///
/// Tool results become user turns; consecutive turns of the same role are
/// merged so roles alternate.
fn to_anthropic_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for message in messages.iter().filter(|m| m.role != "system") {
        let (role, blocks) = match message.role.as_str() {
            "tool" | "function" => {
                let tool_use_id = message
                    .extra
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                (
                    "user",
                    vec![json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": message.content,
                    })],
                )
            }
            "assistant" => {
                let mut blocks = text_block(&message.content);
                if let Some(calls) = message.extra.get("tool_calls").and_then(Value::as_array) {
                    blocks.extend(calls.iter().map(tool_use_block));
                }
                ("assistant", blocks)
            }
            _ => ("user", text_block(&message.content)),
        };

        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => out.push(AnthropicMessage {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }

    out
}

fn text_block(text: &str) -> Vec<Value> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "type": "text", "text": text })]
    }
}

fn tool_use_block(call: &Value) -> Value {
    let function = &call["function"];
    // Arguments travel as a JSON-encoded string in OpenAI histories
    let input = match &function["arguments"] {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| json!({ "raw": s })),
        Value::Null => json!({}),
        other => other.clone(),
    };
    json!({
        "type": "tool_use",
        "id": call["id"].as_str().unwrap_or_default(),
        "name": function["name"].as_str().unwrap_or_default(),
        "input": input,
    })
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicError {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl InferenceBackend for AnthropicClient {
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

        let mut builder = self
            .http_client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.json(&body).send().await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60)
                * 1000;
            return Err(BackendError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status.as_u16(), text));
            if status == 401 || status == 403 {
                return Err(BackendError::Config(format!(
                    "{} auth error ({}): {}",
                    self.service,
                    status.as_u16(),
                    message
                )));
            }
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        self.rate_limiter
            .record_tokens(api_response.usage.input_tokens + api_response.usage.output_tokens)
            .await;

        let content = api_response
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            content,
            model: api_response.model,
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
            finish_reason: api_response.stop_reason.unwrap_or_else(|| "unknown".to_string()),
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call_turn() -> Message {
        let mut extra = Map::new();
        extra.insert(
            "tool_calls".to_string(),
            json!([{
                "id": "call_7",
                "type": "function",
                "function": {"name": "compare", "arguments": "{\"guess\": \"Item_3\"}"}
            }]),
        );
        Message::new("assistant", "").with_extra(extra)
    }

    fn tool_result_turn() -> Message {
        let mut extra = Map::new();
        extra.insert("tool_call_id".to_string(), json!("call_7"));
        Message::new("tool", "[\"Item_3\", \"Item_9\"]").with_extra(extra)
    }

    #[test]
    fn test_system_is_lifted_out() {
        let client = AnthropicClient::new("claude", "https://api.anthropic.com/v1/", "k", "claude-x");
        let request = CompletionRequest::new(vec![
            Message::system("rules"),
            Message::user("question"),
        ]);
        let body = serde_json::to_value(client.build_body(&request)).unwrap();
        assert_eq!(body["system"], "rules");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(client.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn test_tool_turns_become_blocks() {
        let messages = to_anthropic_messages(&[
            Message::user("Is it Item_3?"),
            tool_call_turn(),
            tool_result_turn(),
            Message::user("Which round?"),
        ]);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content[0]["type"], "tool_use");
        assert_eq!(messages[1].content[0]["input"]["guess"], "Item_3");

        // tool result and the following question share one user turn
        assert_eq!(messages[2].role, "user");
        assert_eq!(messages[2].content[0]["type"], "tool_result");
        assert_eq!(messages[2].content[0]["tool_use_id"], "call_7");
        assert_eq!(messages[2].content[1]["text"], "Which round?");
    }

    #[test]
    fn test_unparseable_arguments_kept_raw() {
        let call = json!({"id": "c", "function": {"name": "f", "arguments": "not json"}});
        assert_eq!(tool_use_block(&call)["input"]["raw"], "not json");
    }
}
