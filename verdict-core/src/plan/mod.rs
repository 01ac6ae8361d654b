//! Chunked execution plans and their per-chunk results.

pub mod store;

pub use store::ExecutionPlanStore;

use crate::search::CaseId;
use crate::strategy::{StrategyDescriptor, StrategyType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Planned => "planned",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A persisted, chunked execution unit for one research query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub user_query: String,
    pub strategy: StrategyDescriptor,
    pub total_cases: usize,
    pub total_chunks: usize,
    pub chunk_size: usize,
    /// Candidate ids in rank order, batched.
    pub chunks: Vec<Vec<CaseId>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub status: PlanStatus,
    #[serde(default)]
    pub strategies_used: Vec<StrategyType>,
    #[serde(default)]
    pub strategy_breakdown: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_email: Option<String>,
    /// Candidate count before the first case-limit truncation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_total_cases: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Plan {
    /// All candidate ids in rank order.
    pub fn flattened_ids(&self) -> Vec<CaseId> {
        self.chunks.iter().flatten().copied().collect()
    }
}

/// Slice ranked ids into contiguous batches of `chunk_size`; the last may be short.
pub fn chunk_ids(ids: &[CaseId], chunk_size: usize) -> Vec<Vec<CaseId>> {
    ids.chunks(chunk_size.max(1)).map(<[CaseId]>::to_vec).collect()
}

/// Outcome of analyzing one chunk. Its presence marks the chunk as done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub plan_id: Uuid,
    pub chunk_index: usize,
    /// The structured extraction returned by the model (or a `parsed_as_text` wrapper).
    pub extraction: Value,
    /// Case ids this chunk's analysis actually drew on.
    pub referenced_case_ids: Vec<CaseId>,
    /// Rows sent to the model.
    pub case_count: usize,
    pub created_at: DateTime<Utc>,
}

/// How far execution of a plan has progressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub missing_chunks: Vec<usize>,
}

impl PlanProgress {
    /// Completed fraction in `[0, 1]`; an empty plan counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            1.0
        } else {
            self.completed_chunks as f64 / self.total_chunks as f64
        }
    }
}
