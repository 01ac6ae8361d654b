//! OpenAI-compatible chat completions gateway.

use super::{InferenceGateway, InferenceResponse};
use crate::config::InferenceConfig;
use crate::error::{ConfigError, InferenceError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Talks to any endpoint that follows the chat completions API format.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl HttpGateway {
    /// Build a gateway, reading the API key from `config.api_key_env`.
    ///
    /// Local endpoints (localhost, 127.0.0.1) do not need a key.
    pub fn new(config: &InferenceConfig) -> Result<Self, ConfigError> {
        let is_local =
            config.base_url.contains("localhost") || config.base_url.contains("127.0.0.1");
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .or_else(|| is_local.then(|| "local".to_string()))
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: config.api_key_env.clone(),
            })?;
        Ok(Self::new_with_key(config, api_key))
    }

    pub fn new_with_key(config: &InferenceConfig, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> InferenceError {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
            .unwrap_or_else(|| body.chars().take(200).collect());
        InferenceError::Request {
            message: format!("HTTP {}: {}", status.as_u16(), detail),
        }
    }

    fn parse_response(json: &Value) -> Result<InferenceResponse, InferenceError> {
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| InferenceError::ResponseParse {
                message: "response has no choices[0].message.content".to_string(),
            })?;
        Ok(InferenceResponse {
            content: content.to_string(),
            handle: json.get("id").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[async_trait]
impl InferenceGateway for HttpGateway {
    async fn call(
        &self,
        prompt: &str,
        timeout: Duration,
        label: &str,
    ) -> Result<InferenceResponse, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "stream": false,
        });

        debug!(url = %url, model = %self.model, label, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        label: label.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                } else {
                    InferenceError::Request {
                        message: format!("Request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| InferenceError::Request {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| InferenceError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;

        Self::parse_response(&json)
    }
}
