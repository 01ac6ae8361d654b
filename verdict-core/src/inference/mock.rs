//! Scripted gateway for tests and dry runs.

use super::{InferenceGateway, InferenceResponse};
use crate::error::InferenceError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

type Responder = Box<dyn Fn(&str, &str) -> Result<String, InferenceError> + Send + Sync>;

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub label: String,
    pub prompt: String,
}

/// Replays canned responses and records every prompt it receives.
///
/// Queued responses are consumed first. Once the queue is empty the
/// responder (if any) answers, then the default response. With none of
/// these configured a call fails with `InferenceError::Request`.
#[derive(Default)]
pub struct ScriptedGateway {
    queue: Mutex<VecDeque<Result<String, String>>>,
    responder: Option<Responder>,
    default_response: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn with_response(self, content: impl Into<String>) -> Self {
        self.push_response(content);
        self
    }

    /// Queue a failing call.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(message.into()));
        }
        self
    }

    /// Answer calls by label and prompt once the queue is drained.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&str, &str) -> Result<String, InferenceError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Response returned when nothing else applies.
    pub fn with_default(mut self, content: impl Into<String>) -> Self {
        self.default_response = Some(content.into());
        self
    }

    pub fn push_response(&self, content: impl Into<String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Ok(content.into()));
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls made with the given label.
    pub fn call_count(&self, label: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|call| call.label == label).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl InferenceGateway for ScriptedGateway {
    async fn call(
        &self,
        prompt: &str,
        _timeout: Duration,
        label: &str,
    ) -> Result<InferenceResponse, InferenceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                label: label.to_string(),
                prompt: prompt.to_string(),
            });
        }

        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        let content = match queued {
            Some(Ok(content)) => content,
            Some(Err(message)) => return Err(InferenceError::Request { message }),
            None => match (&self.responder, &self.default_response) {
                (Some(responder), _) => responder(label, prompt)?,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(InferenceError::Request {
                        message: format!("no scripted response for '{label}'"),
                    });
                }
            },
        };
        Ok(InferenceResponse {
            content,
            handle: Some(format!("scripted-{}", self.calls().len())),
        })
    }
}
