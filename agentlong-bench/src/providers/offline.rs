//! Local vLLM engine driven through its OpenAI-compatible server
//!
//! The engine runs as a child process (`vllm serve <model>`); requests go
//! through [`OpenAICompatClient`] once `/health` answers. Tool-call turns are
//! rewritten to the older function-message form that most chat templates
//! expect.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use super::openai::OpenAICompatClient;
use super::traits::{BackendResult, CompletionRequest, CompletionResponse, InferenceBackend, Message};
use crate::config::OfflineSettings;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Error type for launching the local engine
#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine exited during startup ({0})")]
    Exited(std::process::ExitStatus),

    #[error("Engine not healthy after {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine options given per run
#[derive(Debug, Clone)]
pub struct VllmOptions {
    pub model: String,
    pub tokenizer: Option<String>,
    pub tensor_parallel_size: u32,
    pub pipeline_parallel_size: u32,
    pub dtype: String,
    pub gpu_memory_utilization: f32,
    pub trust_remote_code: bool,
}

impl VllmOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tokenizer: None,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            dtype: "auto".to_string(),
            gpu_memory_utilization: 0.9,
            trust_remote_code: false,
        }
    }
}

/// Command-line arguments for `vllm serve`
pub fn serve_args(options: &VllmOptions, settings: &OfflineSettings) -> Vec<String> {
    let mut args = vec![
        "serve".to_string(),
        options.model.clone(),
        "--host".to_string(),
        settings.host.clone(),
        "--port".to_string(),
        settings.port.to_string(),
        "--tensor-parallel-size".to_string(),
        options.tensor_parallel_size.to_string(),
        "--pipeline-parallel-size".to_string(),
        options.pipeline_parallel_size.to_string(),
        "--dtype".to_string(),
        options.dtype.clone(),
        "--gpu-memory-utilization".to_string(),
        options.gpu_memory_utilization.to_string(),
    ];

    if let Some(tokenizer) = &options.tokenizer {
        args.push("--tokenizer".to_string());
        args.push(tokenizer.clone());
    }
    if let Some(len) = settings.max_model_len {
        args.push("--max-model-len".to_string());
        args.push(len.to_string());
    }
    if let Some(tokens) = settings.max_num_batched_tokens {
        args.push("--max-num-batched-tokens".to_string());
        args.push(tokens.to_string());
    }
    if settings.enable_chunked_prefill {
        args.push("--enable-chunked-prefill".to_string());
    }
    if settings.enforce_eager {
        args.push("--enforce-eager".to_string());
    }
    if options.trust_remote_code {
        args.push("--trust-remote-code".to_string());
    }
    args.extend(settings.extra_args.iter().cloned());
    args
}

/// A running engine process, killed on drop
pub struct VllmServer {
    child: Child,
    base_url: String,
    model: String,
}

impl VllmServer {
    /// Spawn the engine and wait until it reports healthy
    pub async fn launch(
        options: &VllmOptions,
        settings: &OfflineSettings,
    ) -> Result<Self, OfflineError> {
        let args = serve_args(options, settings);
        tracing::info!("Starting {} {}", settings.command, args.join(" "));

        let child = Command::new(&settings.command)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OfflineError::Spawn {
                command: settings.command.clone(),
                source,
            })?;

        let mut server = Self {
            child,
            base_url: format!("http://{}:{}", settings.host, settings.port),
            model: options.model.clone(),
        };
        server
            .wait_ready(Duration::from_millis(settings.startup_timeout_ms))
            .await?;
        tracing::info!("Engine ready at {}", server.base_url);
        Ok(server)
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), OfflineError> {
        let http = reqwest::Client::new();
        let health_url = format!("{}/health", self.base_url);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(OfflineError::Exited(status));
            }
            match http.get(&health_url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => tracing::debug!("Health check returned {}", response.status()),
                Err(e) => tracing::debug!("Engine not up yet: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OfflineError::StartupTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Backend talking to this server
    pub fn backend(&self) -> OfflineBackend {
        OfflineBackend::new(OpenAICompatClient::new(
            "offline",
            format!("{}/v1", self.base_url),
            "EMPTY",
            &self.model,
        ))
    }

    /// Stop the engine and wait for it to exit
    pub async fn shutdown(mut self) -> Result<(), OfflineError> {
        tracing::info!("Stopping engine");
        self.child.kill().await?;
        Ok(())
    }
}

/// OpenAI-compatible client with function-message rewriting
pub struct OfflineBackend {
    inner: OpenAICompatClient,
}

impl OfflineBackend {
    pub fn new(inner: OpenAICompatClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl InferenceBackend for OfflineBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn complete(&self, request: &CompletionRequest) -> BackendResult<CompletionResponse> {
        let mut request = request.clone();
        request.messages = to_function_messages(&request.messages);
        self.inner.complete(&request).await
    }
}

/// Rewrite `tool_calls` / `tool` turns into `function_call` / `function` turns
///
/// Only the first call of an assistant turn is kept; tool replies are named
/// after the most recent call.
pub fn to_function_messages(messages: &[Message]) -> Vec<Message> {
    let mut last_function: Option<String> = None;

    messages
        .iter()
        .map(|message| match message.role.as_str() {
            "assistant" => {
                let mut extra = message.extra.clone();
                let first_call = extra
                    .remove("tool_calls")
                    .and_then(|calls| calls.get(0).cloned());
                if let Some(call) = first_call {
                    let function = &call["function"];
                    last_function = function["name"].as_str().map(str::to_string);
                    extra.insert(
                        "function_call".to_string(),
                        json!({
                            "name": function["name"],
                            "arguments": function["arguments"],
                        }),
                    );
                }
                Message::new("assistant", message.content.clone()).with_extra(extra)
            }
            "tool" => {
                let mut extra = Map::new();
                extra.insert(
                    "name".to_string(),
                    last_function.clone().map(Value::String).unwrap_or(Value::Null),
                );
                Message::new("function", message.content.clone()).with_extra(extra)
            }
            _ => message.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_args_follow_settings() {
        let mut options = VllmOptions::new("Qwen/Qwen2.5-7B-Instruct");
        options.tensor_parallel_size = 4;
        options.trust_remote_code = true;
        let mut settings = OfflineSettings::default();
        settings.extra_args = vec!["--seed".to_string(), "7".to_string()];

        let args = serve_args(&options, &settings);
        assert_eq!(&args[..2], &["serve", "Qwen/Qwen2.5-7B-Instruct"]);
        let joined = args.join(" ");
        assert!(joined.contains("--tensor-parallel-size 4"));
        assert!(joined.contains("--max-model-len 1300000"));
        assert!(joined.contains("--max-num-batched-tokens 131072"));
        assert!(joined.contains("--enable-chunked-prefill"));
        assert!(joined.contains("--enforce-eager"));
        assert!(joined.contains("--trust-remote-code"));
        assert!(joined.ends_with("--seed 7"));
        assert!(!joined.contains("--tokenizer"));
    }

    #[test]
    fn test_optional_flags_omitted() {
        let options = VllmOptions::new("m");
        let settings = OfflineSettings {
            max_model_len: None,
            enable_chunked_prefill: false,
            enforce_eager: false,
            ..OfflineSettings::default()
        };
        let joined = serve_args(&options, &settings).join(" ");
        assert!(!joined.contains("--max-model-len"));
        assert!(!joined.contains("--enforce-eager"));
        assert!(!joined.contains("--trust-remote-code"));
    }

    #[test]
    fn test_tool_turns_become_function_turns() {
        let mut call = Map::new();
        call.insert(
            "tool_calls".to_string(),
            json!([
                {"id": "a", "function": {"name": "compare", "arguments": "{\"guess\":\"Item_3\"}"}},
                {"id": "b", "function": {"name": "ignored", "arguments": "{}"}}
            ]),
        );
        let mut result = Map::new();
        result.insert("tool_call_id".to_string(), json!("a"));

        let rewritten = to_function_messages(&[
            Message::system("rules"),
            Message::new("assistant", "").with_extra(call),
            Message::new("tool", "[\"Item_3\"]").with_extra(result),
        ]);

        assert_eq!(rewritten[0], Message::system("rules"));
        assert_eq!(rewritten[1].extra["function_call"]["name"], "compare");
        assert!(!rewritten[1].extra.contains_key("tool_calls"));
        assert_eq!(rewritten[2].role, "function");
        assert_eq!(rewritten[2].extra["name"], "compare");
        assert!(!rewritten[2].extra.contains_key("tool_call_id"));
    }

    #[test]
    fn test_tool_reply_without_call_has_null_name() {
        let rewritten = to_function_messages(&[Message::new("tool", "x")]);
        assert_eq!(rewritten[0].extra["name"], Value::Null);
    }
}
