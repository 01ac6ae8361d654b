//! Sub-research tasks and their state machine.

use crate::orchestrator::PlanOutcome;
use crate::strategy::StrategyType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle state of a task.
///
/// ```text
/// pending -> planning -> planned -> approved -> executing -> completed
///               |                      ^            |
///               v                      |            v
///             failed ------------------+--------- failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Planning,
    Planned,
    Approved,
    Executing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Planning => "planning",
            TaskState::Planned => "planned",
            TaskState::Approved => "approved",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Planning)
                | (Planning, Planned)
                | (Planning, Failed)
                | (Planned, Approved)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Failed, Approved)
        )
    }

    /// Transitions that snapshot the queue document.
    pub fn triggers_backup(&self) -> bool {
        matches!(self, TaskState::Planned | TaskState::Completed | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Research area of a task. Unknown values normalize to `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Jurisprudence,
    Legislation,
    Doctrine,
    Procedure,
    #[default]
    General,
}

impl TaskCategory {
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "jurisprudence" | "case_law" | "caselaw" => TaskCategory::Jurisprudence,
            "legislation" | "statute" | "law" => TaskCategory::Legislation,
            "doctrine" => TaskCategory::Doctrine,
            "procedure" | "procedural" => TaskCategory::Procedure,
            _ => TaskCategory::General,
        }
    }
}

/// Scheduling priority of a task. Unknown values normalize to `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl TaskPriority {
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" | "critical" | "urgent" => TaskPriority::High,
            "low" | "optional" => TaskPriority::Low,
            _ => TaskPriority::Medium,
        }
    }
}

/// Descriptive fields attached to a task by decomposition or the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub rationale: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What planning recorded about a task's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlanSummary {
    pub plan_id: Uuid,
    pub total_cases: usize,
    pub total_chunks: usize,
    pub eta_seconds: u64,
    #[serde(default)]
    pub strategies_used: Vec<StrategyType>,
}

/// One decomposed sub-research unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub user_metadata: TaskMetadata,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub plan: Option<TaskPlanSummary>,
    #[serde(default)]
    pub result: Option<PlanOutcome>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, query: impl Into<String>, metadata: TaskMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            query: query.into(),
            user_metadata: metadata,
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
            plan: None,
            result: None,
            error: None,
        }
    }
}

/// Fields written alongside a state change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub plan: Option<TaskPlanSummary>,
    pub result: Option<PlanOutcome>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn with_plan(plan: TaskPlanSummary) -> Self {
        Self {
            plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn with_result(result: PlanOutcome) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_transitions() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Planned));
        assert!(Planned.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Approved));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Approved));
        assert!(!Failed.can_transition_to(Executing));
        assert!(!Planned.can_transition_to(Executing));
    }

    #[test]
    fn test_backup_states() {
        assert!(TaskState::Planned.triggers_backup());
        assert!(TaskState::Failed.triggers_backup());
        assert!(!TaskState::Executing.triggers_backup());
    }

    #[test]
    fn test_normalization_defaults() {
        assert_eq!(TaskCategory::normalize("Case_Law"), TaskCategory::Jurisprudence);
        assert_eq!(TaskCategory::normalize("astrology"), TaskCategory::General);
        assert_eq!(TaskPriority::normalize("URGENT"), TaskPriority::High);
        assert_eq!(TaskPriority::normalize("whenever"), TaskPriority::Medium);
    }

    #[test]
    fn test_metadata_keeps_extra_fields() {
        let meta: TaskMetadata = serde_json::from_value(serde_json::json!({
            "title": "Furt",
            "category": "doctrine",
            "source": "decomposition"
        }))
        .unwrap();
        assert_eq!(meta.category, TaskCategory::Doctrine);
        assert_eq!(meta.priority, TaskPriority::Medium);
        assert_eq!(meta.extra.get("source"), Some(&Value::from("decomposition")));
    }
}
