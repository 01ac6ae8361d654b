//! Drives queued tasks through planning and execution, one at a time.

use super::durable::DurableTaskQueue;
use super::task::{Task, TaskPlanSummary, TaskState, TaskUpdate};
use crate::error::{Result, TaskError};
use crate::orchestrator::{PlanOutcome, PlanningOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Plans and executes research queries on behalf of the executor.
#[async_trait]
pub trait PlanRunner: Send + Sync {
    async fn plan(&self, query: &str) -> Result<PlanningOutcome>;

    async fn execute(
        &self,
        plan_id: Uuid,
        notification_email: Option<String>,
    ) -> Result<PlanOutcome>;
}

/// Counts from one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

/// Sequential driver over a [`DurableTaskQueue`].
pub struct TaskExecutor {
    queue: Arc<DurableTaskQueue>,
    runner: Arc<dyn PlanRunner>,
}

impl TaskExecutor {
    pub fn new(queue: Arc<DurableTaskQueue>, runner: Arc<dyn PlanRunner>) -> Self {
        Self { queue, runner }
    }

    /// Plan every `pending` task, oldest first.
    pub async fn plan_pending(&self) -> Result<ExecutionSummary> {
        let pending = self.queue.list_in_state(&[TaskState::Pending])?;
        let mut summary = ExecutionSummary {
            total: pending.len(),
            ..Default::default()
        };

        for task in pending {
            self.queue
                .update_state(&task.id, TaskState::Planning, TaskUpdate::default())?;
            match self.runner.plan(&task.query).await {
                Ok(planned) => {
                    let plan = TaskPlanSummary {
                        plan_id: planned.plan_id,
                        total_cases: planned.total_cases,
                        total_chunks: planned.total_chunks,
                        eta_seconds: planned.eta_seconds,
                        strategies_used: planned.strategies_used,
                    };
                    self.queue
                        .update_state(&task.id, TaskState::Planned, TaskUpdate::with_plan(plan))?;
                    info!(task_id = %task.id, plan_id = %planned.plan_id, "Task planned");
                    summary.succeeded += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Task planning failed");
                    self.queue.update_state(
                        &task.id,
                        TaskState::Failed,
                        TaskUpdate::with_error(e.to_string()),
                    )?;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Execute every `approved` and `failed` task, oldest first.
    ///
    /// A failed task is retried in place. One task failing never stops the batch.
    pub async fn execute_queue(&self, notification_email: Option<&str>) -> Result<ExecutionSummary> {
        let runnable = self
            .queue
            .list_in_state(&[TaskState::Approved, TaskState::Failed])?;
        let mut summary = ExecutionSummary {
            total: runnable.len(),
            ..Default::default()
        };
        info!(tasks = summary.total, "Executing task queue");

        for task in runnable {
            if self.run_task(&task, notification_email).await? {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            total = summary.total,
            "Task queue execution finished"
        );
        Ok(summary)
    }

    /// Run one task. `Ok(false)` is a task-level failure; `Err` is a queue failure.
    async fn run_task(&self, task: &Task, notification_email: Option<&str>) -> Result<bool> {
        let Some(plan) = &task.plan else {
            let err = TaskError::MissingPlan {
                id: task.id.clone(),
            };
            warn!(task_id = %task.id, "Task has no plan; skipping");
            if task.state == TaskState::Approved {
                self.queue
                    .update_state(&task.id, TaskState::Executing, TaskUpdate::default())?;
                self.queue.update_state(
                    &task.id,
                    TaskState::Failed,
                    TaskUpdate::with_error(err.to_string()),
                )?;
            }
            return Ok(false);
        };

        if task.state == TaskState::Failed {
            self.queue.retry(&task.id)?;
        }
        self.queue
            .update_state(&task.id, TaskState::Executing, TaskUpdate::default())?;

        match self
            .runner
            .execute(plan.plan_id, notification_email.map(str::to_string))
            .await
        {
            Ok(outcome) => {
                self.queue.update_state(
                    &task.id,
                    TaskState::Completed,
                    TaskUpdate::with_result(outcome),
                )?;
                info!(task_id = %task.id, plan_id = %plan.plan_id, "Task completed");
                Ok(true)
            }
            Err(e) => {
                error!(task_id = %task.id, plan_id = %plan.plan_id, error = %e, "Task failed");
                self.queue.update_state(
                    &task.id,
                    TaskState::Failed,
                    TaskUpdate::with_error(e.to_string()),
                )?;
                Ok(false)
            }
        }
    }
}
