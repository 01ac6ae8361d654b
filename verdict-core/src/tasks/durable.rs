//! Crash-safe task queue backed by one JSON document.
//!
//! Every mutation reads the whole document, applies the change and writes
//! it back atomically. Transitions into `planned`, `completed` and `failed`
//! also write a timestamped backup; the oldest backups beyond the retention
//! limit are pruned.

use super::task::{Task, TaskMetadata, TaskState, TaskUpdate};
use crate::error::{PersistenceError, Result, TaskError};
use crate::persistence::{KeyValueStore, load_typed, save_typed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUE_KEY: &str = "tasks/task_queue";
const BACKUP_PREFIX: &str = "tasks/task_queue.backup.";
const DOCUMENT_VERSION: &str = "1.0";

/// Provenance of the task list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata {
    #[serde(default)]
    pub original_query: Option<String>,
    #[serde(default)]
    pub decomposition_timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "rationale")]
    pub decomposition_rationale: Option<String>,
}

/// The persisted queue document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueDocument {
    pub version: String,
    #[serde(default)]
    pub queue_metadata: QueueMetadata,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Default for TaskQueueDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            queue_metadata: QueueMetadata::default(),
            tasks: Vec::new(),
        }
    }
}

/// A task as produced by decomposition, before it enters the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub id: Option<String>,
    pub query: String,
    pub metadata: TaskMetadata,
}

/// Durable queue of sub-research tasks.
pub struct DurableTaskQueue {
    store: Arc<dyn KeyValueStore>,
    max_backups: usize,
    write_lock: Mutex<()>,
}

impl DurableTaskQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, max_backups: usize) -> Self {
        Self {
            store,
            max_backups,
            write_lock: Mutex::new(()),
        }
    }

    /// The current document; an empty one if nothing has been written yet.
    pub fn load_document(&self) -> std::result::Result<TaskQueueDocument, PersistenceError> {
        Ok(load_typed(self.store.as_ref(), QUEUE_KEY)?.unwrap_or_default())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut TaskQueueDocument) -> Result<(T, bool)>,
    ) -> Result<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load_document()?;
        let (value, backup) = f(&mut doc)?;
        save_typed(self.store.as_ref(), QUEUE_KEY, &doc)?;
        if backup {
            self.write_backup(&doc)?;
        }
        Ok(value)
    }

    fn write_backup(&self, doc: &TaskQueueDocument) -> std::result::Result<(), PersistenceError> {
        let mut ts = Utc::now().timestamp_micros();
        while self.store.get(&format!("{BACKUP_PREFIX}{ts}"))?.is_some() {
            ts += 1;
        }
        save_typed(self.store.as_ref(), &format!("{BACKUP_PREFIX}{ts}"), doc)?;
        let backups = self.backups()?;
        if backups.len() > self.max_backups {
            for old in &backups[..backups.len() - self.max_backups] {
                self.store.delete(old)?;
                debug!(key = %old, "Pruned task queue backup");
            }
        }
        Ok(())
    }

    /// Backup keys, oldest first.
    pub fn backups(&self) -> std::result::Result<Vec<String>, PersistenceError> {
        let mut keys = self.store.list(BACKUP_PREFIX)?;
        keys.sort_by_key(|k| {
            k.strip_prefix(BACKUP_PREFIX)
                .and_then(|ts| ts.parse::<i64>().ok())
                .unwrap_or(0)
        });
        Ok(keys)
    }

    /// Replace the queue with a fresh decomposition.
    pub fn initialize(
        &self,
        original_query: &str,
        rationale: Option<String>,
        tasks: Vec<NewTask>,
    ) -> Result<Vec<Task>> {
        let created = self.mutate(|doc| {
            let had_tasks = !doc.tasks.is_empty();
            *doc = TaskQueueDocument {
                version: DOCUMENT_VERSION.to_string(),
                queue_metadata: QueueMetadata {
                    original_query: Some(original_query.to_string()),
                    decomposition_timestamp: Some(Utc::now()),
                    decomposition_rationale: rationale,
                },
                tasks: Vec::new(),
            };
            for new in tasks {
                let task = build_task(doc, new);
                doc.tasks.push(task);
            }
            Ok((doc.tasks.clone(), had_tasks))
        })?;
        info!(tasks = created.len(), "Task queue initialized");
        Ok(created)
    }

    /// Append a task in state `pending`.
    pub fn add(&self, query: &str, metadata: TaskMetadata) -> Result<Task> {
        let task = self.mutate(|doc| {
            let task = build_task(
                doc,
                NewTask {
                    id: None,
                    query: query.to_string(),
                    metadata,
                },
            );
            if doc.queue_metadata.original_query.is_none() {
                doc.queue_metadata.original_query = Some(query.to_string());
            }
            doc.tasks.push(task.clone());
            Ok((task, false))
        })?;
        info!(task_id = %task.id, "Task added");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.load_document()?
            .tasks
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskError::NotFound { id: id.to_string() }.into())
    }

    /// Tasks in creation order.
    pub fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = self.load_document()?.tasks;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    pub fn list_in_state(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| states.contains(&t.state))
            .collect())
    }

    /// Move a task to `state`, rejecting transitions the state machine forbids.
    pub fn update_state(&self, id: &str, state: TaskState, update: TaskUpdate) -> Result<Task> {
        let task = self.mutate(|doc| {
            let task = doc
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| TaskError::NotFound { id: id.to_string() })?;
            if !task.state.can_transition_to(state) {
                return Err(TaskError::InvalidTransition {
                    id: id.to_string(),
                    from: task.state.to_string(),
                    to: state.to_string(),
                }
                .into());
            }
            task.state = state;
            task.updated_at = Utc::now();
            if update.plan.is_some() {
                task.plan = update.plan;
            }
            if update.result.is_some() {
                task.result = update.result;
            }
            match state {
                TaskState::Failed => task.error = update.error,
                _ => {
                    if update.error.is_some() {
                        task.error = update.error;
                    } else if state == TaskState::Completed || state == TaskState::Approved {
                        task.error = None;
                    }
                }
            }
            Ok((task.clone(), state.triggers_backup()))
        })?;
        debug!(task_id = %id, state = %state, "Task state updated");
        Ok(task)
    }

    pub fn approve(&self, id: &str) -> Result<Task> {
        self.update_state(id, TaskState::Approved, TaskUpdate::default())
    }

    /// Approve every `planned` task. Returns how many were approved.
    pub fn approve_all_planned(&self) -> Result<usize> {
        let count = self.mutate(|doc| {
            let now = Utc::now();
            let mut count = 0;
            for task in doc.tasks.iter_mut().filter(|t| t.state == TaskState::Planned) {
                task.state = TaskState::Approved;
                task.updated_at = now;
                count += 1;
            }
            Ok((count, false))
        })?;
        info!(approved = count, "Approved planned tasks");
        Ok(count)
    }

    /// Re-enter a failed task (`failed -> approved`).
    pub fn retry(&self, id: &str) -> Result<Task> {
        let task = self.get(id)?;
        if task.state != TaskState::Failed {
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                from: task.state.to_string(),
                to: TaskState::Approved.to_string(),
            }
            .into());
        }
        self.update_state(id, TaskState::Approved, TaskUpdate::default())
    }

    pub fn remove(&self, id: &str) -> Result<Task> {
        let removed = self.mutate(|doc| {
            let index = doc
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| TaskError::NotFound { id: id.to_string() })?;
            Ok((doc.tasks.remove(index), false))
        })?;
        info!(task_id = %id, "Task removed");
        Ok(removed)
    }

    /// Drop every completed task. Returns how many were removed.
    pub fn clear_completed(&self) -> Result<usize> {
        self.mutate(|doc| {
            let before = doc.tasks.len();
            doc.tasks.retain(|t| t.state != TaskState::Completed);
            Ok((before - doc.tasks.len(), false))
        })
    }

    /// Refuse report synthesis until the queue is terminal and self-consistent.
    pub fn validate_for_report_generation(&self) -> Result<()> {
        let doc = self.load_document()?;
        let not_ready = |reason: &str| -> Result<()> {
            warn!(reason, "Task queue not ready for report generation");
            Err(TaskError::NotReady {
                reason: reason.to_string(),
            }
            .into())
        };
        if doc
            .queue_metadata
            .original_query
            .as_deref()
            .is_none_or(|q| q.trim().is_empty())
        {
            return not_ready("queue metadata has no original query");
        }
        if doc.tasks.is_empty() {
            return not_ready("task queue is empty");
        }
        if !doc.tasks.iter().any(|t| t.state == TaskState::Completed) {
            return not_ready("no task has completed");
        }
        if let Some(task) = doc
            .tasks
            .iter()
            .find(|t| matches!(t.state, TaskState::Pending | TaskState::Executing))
        {
            return not_ready(&format!("task {} is still {}", task.id, task.state));
        }
        Ok(())
    }
}

fn build_task(doc: &TaskQueueDocument, new: NewTask) -> Task {
    let base = new
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("task_{}", &Uuid::new_v4().simple().to_string()[..8]));
    let mut id = base.clone();
    let mut suffix = 2;
    while doc.tasks.iter().any(|t| t.id == id) {
        id = format!("{base}_{suffix}");
        suffix += 1;
    }
    Task::new(id, new.query, new.metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerdictError;
    use crate::persistence::{FileStore, InMemoryStore};
    use crate::tasks::task::TaskPlanSummary;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn queue() -> DurableTaskQueue {
        DurableTaskQueue::new(Arc::new(InMemoryStore::new()), 10)
    }

    fn new_task(id: &str, query: &str) -> NewTask {
        NewTask {
            id: Some(id.to_string()),
            query: query.to_string(),
            metadata: TaskMetadata::default(),
        }
    }

    fn summary() -> TaskPlanSummary {
        TaskPlanSummary {
            plan_id: Uuid::new_v4(),
            total_cases: 3,
            total_chunks: 1,
            eta_seconds: 120,
            strategies_used: vec![],
        }
    }

    fn drive_to(queue: &DurableTaskQueue, id: &str, target: TaskState) {
        use TaskState::*;
        let path = [Planning, Planned, Approved, Executing, Completed];
        for state in path {
            let update = if state == Planned {
                TaskUpdate::with_plan(summary())
            } else {
                TaskUpdate::default()
            };
            queue.update_state(id, state, update).unwrap();
            if state == target {
                return;
            }
        }
    }

    #[test]
    fn test_initialize_writes_metadata_and_dedups_ids() {
        let q = queue();
        let tasks = q
            .initialize(
                "furt calificat",
                Some("split by aggravating circumstance".into()),
                vec![new_task("t1", "a"), new_task("t1", "b"), new_task("", "c")],
            )
            .unwrap();
        assert_eq!(tasks[0].id, "t1");
        assert_eq!(tasks[1].id, "t1_2");
        assert!(tasks[2].id.starts_with("task_"));

        let doc = q.load_document().unwrap();
        assert_eq!(doc.version, "1.0");
        assert_eq!(
            doc.queue_metadata.original_query.as_deref(),
            Some("furt calificat")
        );
        assert!(tasks.iter().all(|t| t.state == TaskState::Pending));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let q = queue();
        q.initialize("q", None, vec![new_task("t1", "a")]).unwrap();
        let err = q
            .update_state("t1", TaskState::Completed, TaskUpdate::default())
            .unwrap_err();
        assert!(matches!(
            err,
            VerdictError::Task(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_full_lifecycle_and_retry() {
        let q = queue();
        q.initialize("q", None, vec![new_task("t1", "a")]).unwrap();
        drive_to(&q, "t1", TaskState::Executing);
        let failed = q
            .update_state("t1", TaskState::Failed, TaskUpdate::with_error("boom"))
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.plan.is_some());

        let retried = q.retry("t1").unwrap();
        assert_eq!(retried.state, TaskState::Approved);
        assert!(retried.error.is_none());
        assert!(q.retry("t1").is_err());
    }

    #[test]
    fn test_backups_written_and_pruned() {
        let q = DurableTaskQueue::new(Arc::new(InMemoryStore::new()), 3);
        q.initialize("q", None, vec![new_task("t1", "a"), new_task("t2", "b")])
            .unwrap();
        for id in ["t1", "t2"] {
            drive_to(&q, id, TaskState::Completed);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let backups = q.backups().unwrap();
        assert_eq!(backups.len(), 3);
        assert!(backups.iter().all(|k| k.starts_with(BACKUP_PREFIX)));
    }

    #[test]
    fn test_approve_all_and_clear_completed() {
        let q = queue();
        q.initialize("q", None, vec![new_task("t1", "a"), new_task("t2", "b")])
            .unwrap();
        drive_to(&q, "t1", TaskState::Planned);
        drive_to(&q, "t2", TaskState::Planned);
        assert_eq!(q.approve_all_planned().unwrap(), 2);
        assert_eq!(
            q.list_in_state(&[TaskState::Approved]).unwrap().len(),
            2
        );
        q.update_state("t1", TaskState::Executing, TaskUpdate::default())
            .unwrap();
        q.update_state("t1", TaskState::Completed, TaskUpdate::default())
            .unwrap();
        assert_eq!(q.clear_completed().unwrap(), 1);
        assert_eq!(q.list().unwrap().len(), 1);
        q.remove("t2").unwrap();
        assert!(q.get("t2").is_err());
    }

    #[test]
    fn test_validate_for_report_generation() {
        let q = queue();
        assert!(q.validate_for_report_generation().is_err());

        q.initialize("q", None, vec![new_task("t1", "a"), new_task("t2", "b")])
            .unwrap();
        assert!(q.validate_for_report_generation().is_err());

        drive_to(&q, "t1", TaskState::Completed);
        let err = q.validate_for_report_generation().unwrap_err();
        assert!(err.to_string().contains("t2 is still pending"));

        drive_to(&q, "t2", TaskState::Planned);
        q.validate_for_report_generation().unwrap();
    }

    #[test]
    fn test_document_survives_restart_and_accepts_legacy_rationale() {
        let dir = TempDir::new().unwrap();
        let q = DurableTaskQueue::new(Arc::new(FileStore::new(dir.path())), 10);
        q.initialize("q", Some("why".into()), vec![new_task("t1", "a")])
            .unwrap();
        let reopened = DurableTaskQueue::new(Arc::new(FileStore::new(dir.path())), 10);
        assert_eq!(reopened.get("t1").unwrap().query, "a");

        let legacy: QueueMetadata =
            serde_json::from_str(r#"{"original_query": "q", "rationale": "old"}"#).unwrap();
        assert_eq!(legacy.decomposition_rationale.as_deref(), Some("old"));
    }
}
