//! Process-wide single-flight job queue.
//!
//! Plan creation and plan execution both hold the external inference
//! service for minutes at a time and misbehave when overlapped. Every such
//! job goes through one [`SerializationQueue`], constructed at start-up and
//! shared by handle. Subscribers receive [`PositionUpdate`]s whenever the
//! queue changes.

pub mod serialization;

pub use serialization::{JobTicket, SerializationQueue};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    NotFound,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// Broadcast to subscribers after every queue mutation.
///
/// Position 0 is the job being processed; waiting jobs are numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub request_id: Uuid,
    pub position: usize,
    pub total: usize,
    pub status: JobStatus,
}

/// Answer to `poll(job_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPoll {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobPoll {
    pub fn not_found() -> Self {
        Self {
            status: JobStatus::NotFound,
            position: None,
            result: None,
            error: None,
        }
    }
}
