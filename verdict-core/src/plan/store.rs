//! Plan persistence with an in-memory index in front of the blob store.
//!
//! Every write goes to the [`KeyValueStore`] first and then refreshes the
//! index. A plan document has a single logical writer at a time: nothing
//! here guards against a case-limit update racing an in-flight execution of
//! the same plan.

use super::{ChunkResult, Plan, PlanProgress, PlanStatus, chunk_ids};
use crate::error::PersistenceError;
use crate::persistence::{KeyValueStore, load_typed, save_typed};
use crate::search::CaseId;
use crate::strategy::StrategyDescriptor;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn plan_key(plan_id: &Uuid) -> String {
    format!("plans/{plan_id}")
}

fn chunk_key(plan_id: &Uuid, chunk_index: usize) -> String {
    format!("chunks/{plan_id}/{chunk_index}")
}

fn synthesis_key(plan_id: &Uuid) -> String {
    format!("syntheses/{plan_id}")
}

/// Builds, persists and mutates execution plans.
pub struct ExecutionPlanStore {
    store: Arc<dyn KeyValueStore>,
    index: RwLock<HashMap<Uuid, Plan>>,
}

impl ExecutionPlanStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Build a plan from ranked ids and persist it.
    pub fn create(
        &self,
        query: &str,
        strategy: StrategyDescriptor,
        total_cases: usize,
        ids: &[CaseId],
        chunk_size: usize,
        notification_email: Option<String>,
    ) -> Result<Plan, PersistenceError> {
        let chunk_size = chunk_size.max(1);
        let chunks = chunk_ids(ids, chunk_size);
        let plan = Plan {
            plan_id: Uuid::new_v4(),
            user_query: query.to_string(),
            strategies_used: strategy.strategies_used.clone(),
            strategy_breakdown: strategy.strategy_breakdown.clone(),
            strategy,
            total_cases,
            total_chunks: chunks.len(),
            chunk_size,
            chunks,
            created_at: Utc::now(),
            updated_at: None,
            status: PlanStatus::Planned,
            notification_email,
            original_total_cases: None,
            error: None,
        };
        self.save(&plan)?;
        info!(
            plan_id = %plan.plan_id,
            total_cases = plan.total_cases,
            total_chunks = plan.total_chunks,
            "Execution plan created"
        );
        Ok(plan)
    }

    /// Atomically persist a plan and refresh the index.
    pub fn save(&self, plan: &Plan) -> Result<(), PersistenceError> {
        save_typed(self.store.as_ref(), &plan_key(&plan.plan_id), plan)?;
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plan.plan_id, plan.clone());
        Ok(())
    }

    /// Load a plan; unknown ids are a `NotFound` error.
    pub fn load(&self, plan_id: &Uuid) -> Result<Plan, PersistenceError> {
        if let Some(plan) = self
            .index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plan_id)
        {
            return Ok(plan.clone());
        }
        let plan: Plan = load_typed(self.store.as_ref(), &plan_key(plan_id))?.ok_or_else(|| {
            PersistenceError::NotFound {
                kind: "plan".to_string(),
                id: plan_id.to_string(),
            }
        })?;
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    /// Every persisted plan, oldest first.
    pub fn list(&self) -> Result<Vec<Plan>, PersistenceError> {
        let mut plans = Vec::new();
        for key in self.store.list("plans/")? {
            match load_typed::<Plan>(self.store.as_ref(), &key) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable plan"),
            }
        }
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    /// Truncate a plan's candidate list to `max_cases` and re-chunk it.
    ///
    /// `max_cases` is clamped to `[1, original_total]`. Ids dropped by an
    /// earlier truncation are not restored. Chunk results whose chunk
    /// contents changed are deleted so a later run re-executes them.
    pub fn update_case_limit(&self, plan_id: &Uuid, max_cases: usize) -> Result<Plan, PersistenceError> {
        let mut plan = self.load(plan_id)?;
        let ids = plan.flattened_ids();
        let original_total = plan.original_total_cases.unwrap_or(ids.len());
        let limit = max_cases.clamp(1, original_total.max(1)).min(ids.len());

        let old_chunks = std::mem::take(&mut plan.chunks);
        plan.chunks = chunk_ids(&ids[..limit], plan.chunk_size);
        plan.total_chunks = plan.chunks.len();
        plan.total_cases = limit;
        if plan.original_total_cases.is_none() && limit < original_total {
            plan.original_total_cases = Some(original_total);
        }
        plan.updated_at = Some(Utc::now());

        for (index, old) in old_chunks.iter().enumerate() {
            if plan.chunks.get(index) != Some(old) && self.store.delete(&chunk_key(plan_id, index))? {
                debug!(plan_id = %plan_id, chunk_index = index, "Invalidated chunk result");
            }
        }

        self.save(&plan)?;
        info!(
            plan_id = %plan_id,
            max_cases,
            total_cases = plan.total_cases,
            total_chunks = plan.total_chunks,
            "Case limit updated"
        );
        Ok(plan)
    }

    /// Record a status change, with an optional error message.
    pub fn set_status(
        &self,
        plan_id: &Uuid,
        status: PlanStatus,
        error: Option<String>,
    ) -> Result<Plan, PersistenceError> {
        let mut plan = self.load(plan_id)?;
        plan.status = status;
        plan.error = error;
        plan.updated_at = Some(Utc::now());
        self.save(&plan)?;
        Ok(plan)
    }

    pub fn save_chunk_result(&self, result: &ChunkResult) -> Result<(), PersistenceError> {
        save_typed(
            self.store.as_ref(),
            &chunk_key(&result.plan_id, result.chunk_index),
            result,
        )
    }

    pub fn load_chunk_result(
        &self,
        plan_id: &Uuid,
        chunk_index: usize,
    ) -> Result<Option<ChunkResult>, PersistenceError> {
        load_typed(self.store.as_ref(), &chunk_key(plan_id, chunk_index))
    }

    /// Checkpoint marker: whether chunk `chunk_index` has been executed.
    pub fn has_chunk_result(&self, plan_id: &Uuid, chunk_index: usize) -> Result<bool, PersistenceError> {
        Ok(self.store.get(&chunk_key(plan_id, chunk_index))?.is_some())
    }

    /// All chunk results present for a plan, by chunk index.
    pub fn chunk_results(&self, plan_id: &Uuid) -> Result<Vec<ChunkResult>, PersistenceError> {
        let mut results = Vec::new();
        for key in self.store.list(&format!("chunks/{plan_id}/"))? {
            if let Some(result) = load_typed::<ChunkResult>(self.store.as_ref(), &key)? {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.chunk_index);
        Ok(results)
    }

    pub fn progress(&self, plan_id: &Uuid) -> Result<PlanProgress, PersistenceError> {
        let plan = self.load(plan_id)?;
        let mut missing = Vec::new();
        for index in 0..plan.total_chunks {
            if !self.has_chunk_result(plan_id, index)? {
                missing.push(index);
            }
        }
        Ok(PlanProgress {
            plan_id: plan.plan_id,
            status: plan.status,
            completed_chunks: plan.total_chunks - missing.len(),
            total_chunks: plan.total_chunks,
            missing_chunks: missing,
        })
    }

    pub fn save_synthesis(&self, plan_id: &Uuid, synthesis: &Value) -> Result<(), PersistenceError> {
        self.store.put(&synthesis_key(plan_id), synthesis)
    }

    pub fn load_synthesis(&self, plan_id: &Uuid) -> Result<Option<Value>, PersistenceError> {
        self.store.get(&synthesis_key(plan_id))
    }
}
