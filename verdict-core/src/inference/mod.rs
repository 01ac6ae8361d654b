//! The generative-text service boundary.
//!
//! Every orchestrator call goes through an [`InferenceGateway`]. Concrete
//! gateways only move text; [`GuardedGateway`] layers the caller's timeout
//! and echo detection over any of them.

pub mod http;
pub mod json_repair;
pub mod mock;

pub use http::HttpGateway;
pub use json_repair::{PARSED_AS_TEXT, extract_json, is_parsed_as_text};
pub use mock::ScriptedGateway;

use crate::error::InferenceError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A successful response from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub content: String,
    /// Provider-side identifier for the exchange, when one is returned.
    pub handle: Option<String>,
}

impl InferenceResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            handle: None,
        }
    }
}

/// Sends a prompt and receives the response text.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    /// `label` names the call site in logs and errors.
    async fn call(
        &self,
        prompt: &str,
        timeout: Duration,
        label: &str,
    ) -> Result<InferenceResponse, InferenceError>;
}

/// Whether `response` starts with the same `prefix_chars` characters as `prompt`.
///
/// A blank response is never an echo.
pub fn is_echo(prompt: &str, response: &str, prefix_chars: usize) -> bool {
    let response = response.trim_start();
    if response.is_empty() || prefix_chars == 0 {
        return false;
    }
    let prompt = prompt.trim_start();
    prompt.chars().take(prefix_chars).eq(response.chars().take(prefix_chars))
}

/// Applies the per-call timeout and rejects echoed prompts.
pub struct GuardedGateway {
    inner: Arc<dyn InferenceGateway>,
    echo_prefix_chars: usize,
}

impl GuardedGateway {
    pub fn new(inner: Arc<dyn InferenceGateway>, echo_prefix_chars: usize) -> Self {
        Self {
            inner,
            echo_prefix_chars,
        }
    }
}

#[async_trait]
impl InferenceGateway for GuardedGateway {
    async fn call(
        &self,
        prompt: &str,
        timeout: Duration,
        label: &str,
    ) -> Result<InferenceResponse, InferenceError> {
        debug!(label, prompt_chars = prompt.len(), "Inference call");
        let response = tokio::time::timeout(timeout, self.inner.call(prompt, timeout, label))
            .await
            .map_err(|_| InferenceError::Timeout {
                label: label.to_string(),
                timeout_secs: timeout.as_secs(),
            })??;

        if is_echo(prompt, &response.content, self.echo_prefix_chars) {
            warn!(label, "Response echoes the prompt; treating as stale");
            return Err(InferenceError::Echo {
                label: label.to_string(),
            });
        }
        Ok(response)
    }
}
