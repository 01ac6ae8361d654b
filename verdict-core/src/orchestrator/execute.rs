//! Phase 2: analyze each chunk of a plan, checkpointing as it goes.

use super::report::case_id_of;
use super::{Orchestrator, prompts};
use crate::error::Result;
use crate::inference::{extract_json, is_parsed_as_text};
use crate::plan::{ChunkResult, Plan};
use crate::search::{CaseId, CaseRow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one pass over a plan's chunks did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub plan_id: Uuid,
    /// Chunks analyzed in this pass.
    pub executed: usize,
    /// Chunks skipped because a checkpoint already existed.
    pub skipped: usize,
    /// Chunk indices that failed and remain unresolved.
    pub failed: Vec<usize>,
}

/// Serialize rows one JSON object per line within `budget` characters.
///
/// Rows that do not fit are left out. A first row larger than the whole
/// budget is cut to fit so a chunk never goes out empty. Returns the payload
/// and the ids of the rows it contains.
pub fn serialize_rows(rows: &[CaseRow], budget: usize) -> (String, Vec<CaseId>) {
    let mut payload = String::new();
    let mut used = 0usize;
    let mut sent = Vec::new();
    for row in rows {
        let Ok(line) = serde_json::to_string(row) else {
            continue;
        };
        let len = line.chars().count();
        let separator = usize::from(!payload.is_empty());
        if used + separator + len <= budget {
            if separator == 1 {
                payload.push('\n');
            }
            payload.push_str(&line);
            used += separator + len;
            sent.push(row.id);
        } else if sent.is_empty() {
            payload = line.chars().take(budget).collect();
            used = budget;
            sent.push(row.id);
        } else {
            break;
        }
    }
    (payload, sent)
}

/// Ids the extraction claims to reference.
fn claimed_ids(extraction: &Value) -> Vec<CaseId> {
    extraction
        .get("referenced_case_ids")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(case_id_of).collect())
        .unwrap_or_default()
}

/// Restrict the extraction's claimed ids to the ids actually sent.
///
/// If the extraction claims nothing usable (or is plain text), every sent id counts.
pub fn referenced_ids(extraction: &Value, sent: &[CaseId]) -> Vec<CaseId> {
    if is_parsed_as_text(extraction) {
        return sent.to_vec();
    }
    let claimed: HashSet<CaseId> = claimed_ids(extraction).into_iter().collect();
    if claimed.is_empty() {
        return sent.to_vec();
    }
    let kept: Vec<CaseId> = sent.iter().copied().filter(|id| claimed.contains(id)).collect();
    if kept.len() < claimed.len() {
        warn!(
            claimed = claimed.len(),
            kept = kept.len(),
            "Chunk referenced cases it was not given"
        );
    }
    kept
}

impl Orchestrator {
    async fn execute_chunk(&self, plan: &Plan, chunk_index: usize, ids: &[CaseId]) -> Result<ChunkResult> {
        let rows = self
            .engine
            .backend()
            .rows_for_ids(ids, &plan.strategy.selected_columns)
            .await?;
        let (payload, sent) = serialize_rows(&rows, self.config.inference.payload_budget());
        if sent.len() < ids.len() {
            debug!(
                plan_id = %plan.plan_id,
                chunk_index,
                requested = ids.len(),
                sent = sent.len(),
                "Chunk payload truncated"
            );
        }

        let prompt = prompts::chunk(&plan.user_query, chunk_index, plan.total_chunks, &payload);
        let response = self
            .gateway
            .call(&prompt, self.config.inference.call_timeout(), "chunk")
            .await?;
        let extraction = extract_json(&response.content);
        let result = ChunkResult {
            plan_id: plan.plan_id,
            chunk_index,
            referenced_case_ids: referenced_ids(&extraction, &sent),
            extraction,
            case_count: sent.len(),
            created_at: Utc::now(),
        };
        self.plans.save_chunk_result(&result)?;
        Ok(result)
    }

    /// Phase 2: run every chunk without a checkpoint, in index order.
    ///
    /// Chunk failures are logged and left for a later resume.
    pub async fn execute_plan(&self, plan_id: &Uuid) -> Result<ExecutionReport> {
        let plan = self.plans.load(plan_id)?;
        let mut report = ExecutionReport {
            plan_id: *plan_id,
            ..Default::default()
        };

        for (chunk_index, ids) in plan.chunks.iter().enumerate() {
            if self.plans.has_chunk_result(plan_id, chunk_index)? {
                report.skipped += 1;
                continue;
            }
            match self.execute_chunk(&plan, chunk_index, ids).await {
                Ok(result) => {
                    info!(
                        plan_id = %plan_id,
                        chunk_index,
                        total_chunks = plan.total_chunks,
                        referenced = result.referenced_case_ids.len(),
                        "Chunk analyzed"
                    );
                    report.executed += 1;
                }
                Err(e) => {
                    warn!(plan_id = %plan_id, chunk_index, error = %e, "Chunk failed");
                    report.failed.push(chunk_index);
                }
            }
        }

        info!(
            plan_id = %plan_id,
            executed = report.executed,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Plan execution pass finished"
        );
        Ok(report)
    }
}
