//! The FIFO queue and its single consumer.

use super::{JobPoll, JobStatus, PositionUpdate};
use crate::config::QueueConfig;
use crate::error::{QueueError, VerdictError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type JobOutcome = Result<Value, String>;
type RunFn = Box<dyn FnOnce() -> BoxFuture<'static, JobOutcome> + Send>;
type RejectFn = Box<dyn FnOnce(QueueError) + Send>;
type ResultSlot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, VerdictError>>>>>;

struct QueueItem {
    request_id: Uuid,
    label: String,
    run: RunFn,
    reject: RejectFn,
}

struct JobRecord {
    label: String,
    payload: Value,
    added_at: DateTime<Utc>,
    status: JobStatus,
    result: Option<Value>,
    error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    current: Option<Uuid>,
    records: HashMap<Uuid, JobRecord>,
    finished: VecDeque<Uuid>,
    watchers: HashMap<Uuid, watch::Sender<PositionUpdate>>,
    closed: bool,
}

impl QueueState {
    fn total(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    fn snapshot(&self) -> Vec<PositionUpdate> {
        let total = self.total();
        self.current
            .iter()
            .map(|&request_id| PositionUpdate {
                request_id,
                position: 0,
                total,
                status: JobStatus::Processing,
            })
            .chain(self.pending.iter().enumerate().map(|(i, item)| PositionUpdate {
                request_id: item.request_id,
                position: i + 1,
                total,
                status: JobStatus::Queued,
            }))
            .collect()
    }

    /// Recompute every live position and push it to that job's subscribers.
    fn broadcast(&self) {
        for update in self.snapshot() {
            if let Some(tx) = self.watchers.get(&update.request_id) {
                tx.send_replace(update);
            }
        }
    }

    fn finish(&mut self, request_id: Uuid, outcome: JobOutcome, retained: usize) {
        let (status, result, error) = match outcome {
            Ok(value) => (JobStatus::Completed, Some(value), None),
            Err(message) => (JobStatus::Failed, None, Some(message)),
        };
        if let Some(record) = self.records.get_mut(&request_id) {
            record.status = status;
            record.result = result;
            record.error = error;
        }
        self.finished.push_back(request_id);
        while self.finished.len() > retained {
            if let Some(old) = self.finished.pop_front() {
                self.records.remove(&old);
            }
        }
        if let Some(tx) = self.watchers.remove(&request_id) {
            tx.send_replace(PositionUpdate {
                request_id,
                position: 0,
                total: self.total(),
                status,
            });
        }
    }
}

struct Inner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Awaitable handle to a queued job's typed result.
#[derive(Debug)]
pub struct JobTicket<T> {
    request_id: Uuid,
    rx: oneshot::Receiver<Result<T, VerdictError>>,
}

impl<T> JobTicket<T> {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<T, VerdictError> {
        self.rx.await.map_err(|_| QueueError::Dropped {
            request_id: self.request_id,
        })?
    }
}

/// Single-consumer FIFO queue for resource-heavy jobs.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SerializationQueue {
    inner: Arc<Inner>,
}

impl SerializationQueue {
    /// Create a queue. No job runs until [`spawn_worker`](Self::spawn_worker) is called.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the consumer task.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { worker_loop(inner).await })
    }

    /// Queue a job, returning its id and a ticket for its result.
    pub fn enqueue<T, F, Fut>(
        &self,
        label: &str,
        payload: Value,
        job: F,
    ) -> Result<(Uuid, JobTicket<T>), QueueError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, VerdictError>> + Send + 'static,
    {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let slot: ResultSlot<T> = Arc::new(Mutex::new(Some(tx)));

        let run_slot = Arc::clone(&slot);
        let run: RunFn = Box::new(move || {
            async move {
                let outcome = job().await;
                let record = match &outcome {
                    Ok(value) => serde_json::to_value(value).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Some(tx) = take_sender(&run_slot) {
                    let _ = tx.send(outcome);
                }
                record
            }
            .boxed()
        });
        let reject: RejectFn = Box::new(move |err: QueueError| {
            if let Some(tx) = take_sender(&slot) {
                let _ = tx.send(Err(err.into()));
            }
        });

        {
            let mut state = self.inner.lock();
            if state.closed || self.inner.cancel.is_cancelled() {
                return Err(QueueError::ShutDown);
            }
            if state.pending.len() >= self.inner.config.max_backlog {
                warn!(label, max = self.inner.config.max_backlog, "Queue full, rejecting job");
                return Err(QueueError::QueueFull {
                    max: self.inner.config.max_backlog,
                });
            }
            let position = state.pending.len() + 1;
            let (watch_tx, _) = watch::channel(PositionUpdate {
                request_id,
                position,
                total: state.total() + 1,
                status: JobStatus::Queued,
            });
            state.watchers.insert(request_id, watch_tx);
            state.records.insert(
                request_id,
                JobRecord {
                    label: label.to_string(),
                    payload,
                    added_at: Utc::now(),
                    status: JobStatus::Queued,
                    result: None,
                    error: None,
                },
            );
            state.pending.push_back(QueueItem {
                request_id,
                label: label.to_string(),
                run,
                reject,
            });
            state.broadcast();
            info!(request_id = %request_id, label, position, "Job queued");
        }
        self.inner.notify.notify_one();

        Ok((request_id, JobTicket { request_id, rx }))
    }

    /// Fire-and-forget submission; the outcome is read back with [`poll`](Self::poll).
    pub fn submit<T, F, Fut>(&self, label: &str, payload: Value, job: F) -> Result<Uuid, QueueError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, VerdictError>> + Send + 'static,
    {
        self.enqueue(label, payload, job).map(|(request_id, _)| request_id)
    }

    /// Current state of a job, including its result once finished.
    pub fn poll(&self, request_id: &Uuid) -> JobPoll {
        let state = self.inner.lock();
        if state.current.as_ref() == Some(request_id) {
            return JobPoll {
                status: JobStatus::Processing,
                position: Some(0),
                result: None,
                error: None,
            };
        }
        if let Some(i) = state.pending.iter().position(|item| item.request_id == *request_id) {
            return JobPoll {
                status: JobStatus::Queued,
                position: Some(i + 1),
                result: None,
                error: None,
            };
        }
        match state.records.get(request_id) {
            Some(record) => JobPoll {
                status: record.status,
                position: None,
                result: record.result.clone(),
                error: record.error.clone(),
            },
            None => JobPoll::not_found(),
        }
    }

    /// Position updates for one job. `None` once the job has finished or is unknown.
    pub fn subscribe(&self, request_id: &Uuid) -> Option<watch::Receiver<PositionUpdate>> {
        self.inner.lock().watchers.get(request_id).map(|tx| tx.subscribe())
    }

    /// Positions of every live job, the running one first.
    pub fn snapshot(&self) -> Vec<PositionUpdate> {
        self.inner.lock().snapshot()
    }

    /// Label, payload and enqueue time of a job still in the registry.
    pub fn describe(&self, request_id: &Uuid) -> Option<(String, Value, DateTime<Utc>)> {
        self.inner
            .lock()
            .records
            .get(request_id)
            .map(|r| (r.label.clone(), r.payload.clone(), r.added_at))
    }

    /// Number of jobs waiting or running.
    pub fn len(&self) -> usize {
        self.inner.lock().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work and reject everything still waiting.
    ///
    /// The running job is allowed to finish; the worker exits afterwards.
    pub fn shutdown(&self) {
        let drained: Vec<QueueItem> = {
            let mut state = self.inner.lock();
            state.closed = true;
            let drained: Vec<QueueItem> = state.pending.drain(..).collect();
            let retained = self.inner.config.retained_records;
            for item in &drained {
                state.finish(item.request_id, Err(QueueError::ShutDown.to_string()), retained);
            }
            state.broadcast();
            drained
        };
        info!(rejected = drained.len(), "Serialization queue shutting down");
        for item in drained {
            (item.reject)(QueueError::ShutDown);
        }
        self.inner.cancel.cancel();
    }
}

fn take_sender<T>(slot: &ResultSlot<T>) -> Option<oneshot::Sender<Result<T, VerdictError>>> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

async fn worker_loop(inner: Arc<Inner>) {
    debug!("Serialization worker started");
    loop {
        let next = {
            let mut state = inner.lock();
            let item = state.pending.pop_front();
            if let Some(item) = &item {
                state.current = Some(item.request_id);
                if let Some(record) = state.records.get_mut(&item.request_id) {
                    record.status = JobStatus::Processing;
                }
                state.broadcast();
            }
            item
        };

        match next {
            Some(item) => process(&inner, item).await,
            None => {
                if inner.cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = inner.cancel.cancelled() => {}
                }
            }
        }
    }
    debug!("Serialization worker stopped");
}

async fn process(inner: &Inner, item: QueueItem) {
    let QueueItem {
        request_id,
        label,
        run,
        reject,
    } = item;
    let timeout = inner.config.job_timeout();
    info!(request_id = %request_id, label = %label, "Job started");

    let mut handle = tokio::spawn(run());
    let outcome = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => {
            warn!(request_id = %request_id, error = %join_error, "Job aborted");
            reject(QueueError::Dropped { request_id });
            Err(format!("job aborted: {join_error}"))
        }
        Err(_) => {
            // Dropping the job's future must also stop blocking work it awaited;
            // the SQLite backend interrupts its statement on drop.
            handle.abort();
            let err = QueueError::JobTimeout {
                request_id,
                timeout_secs: timeout.as_secs(),
            };
            warn!(request_id = %request_id, label = %label, "Job timed out");
            let message = err.to_string();
            reject(err);
            Err(message)
        }
    };

    match &outcome {
        Ok(_) => info!(request_id = %request_id, label = %label, "Job completed"),
        Err(e) => warn!(request_id = %request_id, label = %label, error = %e, "Job failed"),
    }

    let mut state = inner.lock();
    state.current = None;
    state.finish(request_id, outcome, inner.config.retained_records);
    state.broadcast();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(max_backlog: usize) -> QueueConfig {
        QueueConfig {
            max_backlog,
            job_timeout_secs: 5,
            retained_records: 8,
        }
    }

    #[tokio::test]
    async fn test_positions_assigned_in_submission_order() {
        let queue = SerializationQueue::new(config(10));
        let mut ids = Vec::new();
        for i in 0..4 {
            let (id, _) = queue
                .enqueue("job", Value::from(i), move || async move { Ok(i) })
                .unwrap();
            ids.push(id);
        }
        let positions: Vec<(Uuid, usize)> = queue
            .snapshot()
            .into_iter()
            .map(|u| (u.request_id, u.position))
            .collect();
        assert_eq!(
            positions,
            ids.iter().copied().zip(1..=4).collect::<Vec<_>>()
        );
        let rx = queue.subscribe(&ids[2]).unwrap();
        assert_eq!(rx.borrow().position, 3);
        assert_eq!(rx.borrow().total, 4);
    }

    #[tokio::test]
    async fn test_queue_full_rejected() {
        let queue = SerializationQueue::new(config(1));
        queue
            .enqueue("a", Value::Null, || async { Ok(()) })
            .unwrap();
        let err = queue
            .enqueue("b", Value::Null, || async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { max: 1 }));
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time_in_order() {
        let queue = SerializationQueue::new(config(10));
        let running = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tickets = Vec::new();
        for i in 0..5 {
            let running = running.clone();
            let order = order.clone();
            let (_, ticket) = queue
                .enqueue("job", Value::Null, move || async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().unwrap().push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i * 10)
                })
                .unwrap();
            tickets.push(ticket);
        }
        queue.spawn_worker();
        let mut results = Vec::new();
        for ticket in tickets {
            results.push(ticket.wait().await.unwrap());
        }
        assert_eq!(results, vec![0, 10, 20, 30, 40]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_positions_decrease_as_predecessors_finish() {
        let queue = SerializationQueue::new(config(10));
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        let (_, first) = queue
            .enqueue("blocker", Value::Null, move || async move {
                g.notified().await;
                Ok(())
            })
            .unwrap();
        let (last_id, last) = queue
            .enqueue("last", Value::Null, || async { Ok(()) })
            .unwrap();
        let mut rx = queue.subscribe(&last_id).unwrap();
        assert_eq!(rx.borrow().position, 2);

        queue.spawn_worker();
        rx.wait_for(|u| u.position == 1).await.unwrap();
        gate.notify_one();
        first.wait().await.unwrap();
        last.wait().await.unwrap();
        assert_eq!(queue.poll(&last_id).status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_queue_advances() {
        let queue = SerializationQueue::new(QueueConfig {
            job_timeout_secs: 1,
            ..config(10)
        });
        let (slow_id, slow) = queue
            .enqueue("slow", Value::Null, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();
        let (_, fast) = queue
            .enqueue("fast", Value::Null, || async { Ok("done") })
            .unwrap();
        queue.spawn_worker();

        let err = slow.wait().await.unwrap_err();
        assert!(matches!(
            err,
            VerdictError::Queue(QueueError::JobTimeout { timeout_secs: 1, .. })
        ));
        assert_eq!(fast.wait().await.unwrap(), "done");
        assert_eq!(queue.poll(&slow_id).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_timed_out_store_query_does_not_hold_the_next_job() {
        use crate::search::{SearchBackend, SqliteSearchBackend};

        let backend = Arc::new(SqliteSearchBackend::open_in_memory().unwrap());
        let queue = SerializationQueue::new(QueueConfig {
            job_timeout_secs: 1,
            ..config(10)
        });
        let slow_backend = Arc::clone(&backend);
        let (_, slow) = queue
            .enqueue("slow", Value::Null, move || async move {
                slow_backend
                    .run(
                        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                         SELECT COUNT(*) FROM (SELECT x FROM c LIMIT 4000000000)",
                        "SELECT id FROM cases",
                    )
                    .await?;
                Ok(())
            })
            .unwrap();
        let fast_backend = Arc::clone(&backend);
        let (_, fast) = queue
            .enqueue("fast", Value::Null, move || async move {
                let (count, _) = fast_backend
                    .run("SELECT COUNT(*) FROM cases", "SELECT id FROM cases")
                    .await?;
                Ok(count)
            })
            .unwrap();
        queue.spawn_worker();

        assert!(matches!(
            slow.wait().await.unwrap_err(),
            VerdictError::Queue(QueueError::JobTimeout { .. })
        ));
        let count = tokio::time::timeout(Duration::from_secs(10), fast.wait())
            .await
            .expect("fast job finished")
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_submit_and_poll_result() {
        let queue = SerializationQueue::new(config(10));
        let id = queue
            .submit("plan", serde_json::json!({"query": "furt"}), || async {
                Ok(serde_json::json!({"plan_id": "p1"}))
            })
            .unwrap();
        assert_eq!(queue.poll(&id).position, Some(1));
        assert_eq!(queue.describe(&id).unwrap().0, "plan");

        let mut rx = queue.subscribe(&id).unwrap();
        queue.spawn_worker();
        rx.wait_for(|u| u.status == JobStatus::Completed).await.ok();
        let polled = queue.poll(&id);
        assert_eq!(polled.status, JobStatus::Completed);
        assert_eq!(polled.result, Some(serde_json::json!({"plan_id": "p1"})));
        assert_eq!(queue.poll(&Uuid::new_v4()).status, JobStatus::NotFound);
    }

    #[tokio::test]
    async fn test_failed_job_reports_error() {
        let queue = SerializationQueue::new(config(10));
        let (id, ticket) = queue
            .enqueue::<(), _, _>("bad", Value::Null, || async {
                Err(QueueError::ShutDown.into())
            })
            .unwrap();
        queue.spawn_worker();
        assert!(ticket.wait().await.is_err());
        let polled = queue.poll(&id);
        assert_eq!(polled.status, JobStatus::Failed);
        assert!(polled.error.unwrap().contains("shutting down"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_new_work() {
        let queue = SerializationQueue::new(config(10));
        let (_, pending) = queue
            .enqueue("pending", Value::Null, || async { Ok(()) })
            .unwrap();
        let worker = queue.spawn_worker();
        queue.shutdown();
        let result = pending.wait().await;
        // The worker may have picked the job up before shutdown.
        if let Err(e) = result {
            assert!(matches!(e, VerdictError::Queue(QueueError::ShutDown)));
        }
        assert!(matches!(
            queue.enqueue("late", Value::Null, || async { Ok(()) }),
            Err(QueueError::ShutDown)
        ));
        worker.await.unwrap();
        assert!(queue.is_empty());
    }
}
