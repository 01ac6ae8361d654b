//! The research pipeline.
//!
//! ```text
//! Phase 0  decompose   query -> sub-research tasks
//! Phase 1  plan        query -> strategy -> ranked candidates -> Plan
//! Phase 2  execute     Plan chunks -> ChunkResult checkpoints
//! Phase 3  synthesize  ChunkResults -> plan synthesis + verified bibliography
//! Phase 4  report      completed tasks -> canonical Report
//! ```
//!
//! Plan creation and plan execution are submitted through the
//! [`SerializationQueue`] by the `*_queued` entry points, so at most one of
//! them talks to the inference service at any time.

pub mod decompose;
pub mod execute;
pub mod final_report;
pub mod planning;
pub mod prompts;
pub mod report;
pub mod synthesize;

pub use decompose::Decomposition;
pub use execute::ExecutionReport;
pub use final_report::FinalReport;
pub use planning::PlanningOutcome;
pub use report::{Bibliography, Chapter, CitedCase, Report, ReportMetadata, Section};

use crate::config::EngineConfig;
use crate::error::{InferenceError, Result};
use crate::inference::{GuardedGateway, InferenceGateway, InferenceResponse};
use crate::notify::{LogNotifier, Notifier};
use crate::persistence::KeyValueStore;
use crate::plan::ExecutionPlanStore;
use crate::queue::SerializationQueue;
use crate::search::{CaseId, SearchBackend};
use crate::strategy::StrategyEngine;
use crate::tasks::PlanRunner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// The result of executing and synthesizing one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub plan_id: Uuid,
    pub query: String,
    /// The synthesis object, with `bibliography` recomputed from chunk results.
    pub synthesis: Value,
    /// Union of every chunk's referenced case ids, in chunk order.
    pub bibliography: Vec<CaseId>,
    pub chunks_completed: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub missing_chunks: Vec<usize>,
    /// Case ids the synthesis cited that no chunk referenced.
    #[serde(default)]
    pub filtered_citations: usize,
}

/// Composes discovery, plans, the inference gateway and the serialization queue.
///
/// Cloning yields another handle to the same components.
#[derive(Clone)]
pub struct Orchestrator {
    gateway: Arc<dyn InferenceGateway>,
    engine: Arc<StrategyEngine>,
    plans: Arc<ExecutionPlanStore>,
    queue: SerializationQueue,
    notifier: Arc<dyn Notifier>,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    /// Wire an orchestrator. The gateway is wrapped in a [`GuardedGateway`].
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn InferenceGateway>,
        backend: Arc<dyn SearchBackend>,
        store: Arc<dyn KeyValueStore>,
        queue: SerializationQueue,
    ) -> Self {
        let guarded = GuardedGateway::new(gateway, config.inference.echo_prefix_chars);
        Self {
            gateway: Arc::new(guarded),
            engine: Arc::new(StrategyEngine::new(backend, &config.discovery)),
            plans: Arc::new(ExecutionPlanStore::new(store)),
            queue,
            notifier: Arc::new(LogNotifier),
            config: Arc::new(config),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn plans(&self) -> &ExecutionPlanStore {
        &self.plans
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }

    pub fn queue(&self) -> &SerializationQueue {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Call the gateway, retrying failed calls up to `attempts` times.
    pub(crate) async fn call_with_attempts(
        &self,
        label: &str,
        prompt: &str,
        timeout: Duration,
        attempts: u32,
    ) -> std::result::Result<InferenceResponse, InferenceError> {
        let attempts = attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.gateway.call(prompt, timeout, label).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(label, attempt, error = %e, "Inference call failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(InferenceError::AttemptsExhausted {
            phase: label.to_string(),
            attempts,
            last_error,
        })
    }

    /// Phase 1 through the serialization queue.
    pub async fn plan_queued(
        &self,
        query: &str,
        notification_email: Option<String>,
    ) -> Result<PlanningOutcome> {
        let this = self.clone();
        let owned = query.to_string();
        let (request_id, ticket) =
            self.queue
                .enqueue("plan", json!({ "query": query }), move || async move {
                    this.create_plan(&owned, notification_email).await
                })?;
        info!(request_id = %request_id, query, "Plan creation queued");
        ticket.wait().await
    }

    /// Phases 2 and 3 through the serialization queue.
    pub async fn execute_queued(
        &self,
        plan_id: Uuid,
        notification_email: Option<String>,
    ) -> Result<PlanOutcome> {
        let this = self.clone();
        let (request_id, ticket) = self.queue.enqueue(
            "execute",
            json!({ "plan_id": plan_id }),
            move || async move { this.execute(&plan_id, notification_email).await },
        )?;
        info!(request_id = %request_id, plan_id = %plan_id, "Plan execution queued");
        ticket.wait().await
    }

    /// Plan and execute a single query end to end.
    pub async fn research(
        &self,
        query: &str,
        notification_email: Option<String>,
    ) -> Result<PlanOutcome> {
        let planned = self.plan_queued(query, notification_email.clone()).await?;
        self.execute_queued(planned.plan_id, notification_email).await
    }
}

#[async_trait]
impl PlanRunner for Orchestrator {
    async fn plan(&self, query: &str) -> Result<PlanningOutcome> {
        self.plan_queued(query, None).await
    }

    async fn execute(
        &self,
        plan_id: Uuid,
        notification_email: Option<String>,
    ) -> Result<PlanOutcome> {
        self.execute_queued(plan_id, notification_email).await
    }
}
