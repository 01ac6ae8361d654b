//! # Verdict Core
//!
//! Core library for the Verdict research engine.
//! Turns a legal research question into candidate discovery strategies,
//! chunked and checkpointed execution plans, serialized inference calls and
//! a citation-safe final report.

pub mod config;
pub mod error;
pub mod inference;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod plan;
pub mod queue;
pub mod search;
pub mod strategy;
pub mod tasks;

// Re-export commonly used types at the crate root.
pub use config::{CooldownPolicy, EngineConfig, load_config};
pub use error::{Result, VerdictError};
pub use inference::{GuardedGateway, HttpGateway, InferenceGateway, ScriptedGateway};
pub use notify::{LogNotifier, Notification, Notifier, SmtpNotifier};
pub use orchestrator::{
    Decomposition, ExecutionReport, FinalReport, Orchestrator, PlanOutcome, PlanningOutcome,
    Report,
};
pub use persistence::{FileStore, InMemoryStore, KeyValueStore};
pub use plan::{ChunkResult, ExecutionPlanStore, Plan, PlanProgress, PlanStatus};
pub use queue::{JobPoll, JobStatus, JobTicket, PositionUpdate, SerializationQueue};
pub use search::{CaseId, CaseRecord, ScriptedSearchBackend, SearchBackend, SqliteSearchBackend};
pub use strategy::{MultiStrategyMode, StrategyDescriptor, StrategyEngine, StrategyType};
pub use tasks::{
    DurableTaskQueue, ExecutionSummary, NewTask, PlanRunner, Task, TaskExecutor, TaskState,
};
