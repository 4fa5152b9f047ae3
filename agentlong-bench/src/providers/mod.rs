//! Inference backends

pub mod anthropic;
pub mod offline;
pub mod openai;
pub mod sse;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use offline::{OfflineBackend, OfflineError, VllmOptions, VllmServer};
pub use openai::OpenAICompatClient;
pub use traits::{
    BackendError, BackendResult, CompletionRequest, CompletionResponse, InferenceBackend, Message,
};

use crate::config::{ApiStyle, ServiceConfig};
use std::sync::Arc;

/// Create the backend for a configured service
pub fn create_backend(
    name: &str,
    config: &ServiceConfig,
) -> BackendResult<Arc<dyn InferenceBackend>> {
    tracing::debug!(
        "Creating {:?} backend '{}' for {} ({})",
        config.api_style,
        name,
        config.model_name,
        config.base_url
    );
    let backend: Arc<dyn InferenceBackend> = match config.api_style {
        ApiStyle::OpenAI => Arc::new(OpenAICompatClient::from_service(name, config)?),
        ApiStyle::Anthropic => Arc::new(AnthropicClient::from_service(name, config)?),
    };
    Ok(backend)
}
