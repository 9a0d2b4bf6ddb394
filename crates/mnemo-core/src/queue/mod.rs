//! Task Queue
//!
//! Durable async job execution: every submission lands as a pending row in
//! the relational store before it is dispatched, and pending rows are
//! re-enqueued at boot. Tasks with the same lane key (the `end_user_id` for
//! write tasks) run strictly FIFO, one at a time; tasks across lanes run
//! concurrently up to the worker pool size. Lane routing lives in the
//! dispatcher, not in an in-process lock map, so ordering survives restarts
//! through the pending rows.

pub mod handlers;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::store::{RelationalStore, TaskRecord};

/// Task status strings persisted on the execution row
pub mod status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
}

/// Executes one task kind
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &TaskRecord) -> Result<serde_json::Value>;
}

enum DispatcherMessage {
    Submit(TaskRecord),
    LaneFinished(String),
    Shutdown,
}

/// Durable task queue with per-lane FIFO ordering
pub struct TaskQueue {
    relational: Arc<RelationalStore>,
    sender: mpsc::UnboundedSender<DispatcherMessage>,
}

impl TaskQueue {
    /// Start the queue with a bounded worker pool
    pub fn start(
        relational: Arc<RelationalStore>,
        handler: Arc<dyn TaskHandler>,
        max_workers: usize,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            relational: relational.clone(),
            sender: sender.clone(),
        });

        tokio::spawn(dispatcher_loop(
            relational,
            handler,
            max_workers.max(1),
            sender,
            receiver,
        ));

        queue
    }

    /// Persist and enqueue a task; returns the task id
    ///
    /// `lane` keys the FIFO ordering domain; an empty lane means the task has
    /// no ordering constraint.
    pub fn submit(
        &self,
        kind: &str,
        lane: &str,
        payload: serde_json::Value,
    ) -> Result<String> {
        let record = TaskRecord {
            task_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            lane: lane.to_string(),
            status: status::PENDING.to_string(),
            payload,
            result: None,
            error: None,
            elapsed_seconds: None,
        };
        self.relational.insert_task(&record)?;

        let task_id = record.task_id.clone();
        self.sender
            .send(DispatcherMessage::Submit(record))
            .map_err(|_| MemoryError::Init("task queue stopped".to_string()))?;
        Ok(task_id)
    }

    /// Re-enqueue tasks that were pending when the process last stopped
    pub fn recover_pending(&self) -> Result<usize> {
        let pending = self.relational.pending_tasks()?;
        let count = pending.len();
        for record in pending {
            self.sender
                .send(DispatcherMessage::Submit(record))
                .map_err(|_| MemoryError::Init("task queue stopped".to_string()))?;
        }
        if count > 0 {
            tracing::info!(count, "re-enqueued pending tasks");
        }
        Ok(count)
    }

    /// Current execution row for a task
    pub fn task_status(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.relational.get_task(task_id)
    }

    /// Stop accepting work; in-flight tasks finish
    pub fn shutdown(&self) {
        let _ = self.sender.send(DispatcherMessage::Shutdown);
    }
}

async fn dispatcher_loop(
    relational: Arc<RelationalStore>,
    handler: Arc<dyn TaskHandler>,
    max_workers: usize,
    sender: mpsc::UnboundedSender<DispatcherMessage>,
    mut receiver: mpsc::UnboundedReceiver<DispatcherMessage>,
) {
    let semaphore = Arc::new(Semaphore::new(max_workers));
    // Queued tasks per lane; a lane in `busy` has exactly one task in flight
    let mut lanes: HashMap<String, VecDeque<TaskRecord>> = HashMap::new();
    let mut busy: HashSet<String> = HashSet::new();
    let mut draining = false;

    while let Some(message) = receiver.recv().await {
        match message {
            DispatcherMessage::Submit(record) => {
                if draining {
                    continue;
                }
                if record.lane.is_empty() {
                    spawn_task(
                        record,
                        relational.clone(),
                        handler.clone(),
                        semaphore.clone(),
                        sender.clone(),
                        None,
                    );
                } else if busy.contains(&record.lane) {
                    lanes.entry(record.lane.clone()).or_default().push_back(record);
                } else {
                    busy.insert(record.lane.clone());
                    let lane = record.lane.clone();
                    spawn_task(
                        record,
                        relational.clone(),
                        handler.clone(),
                        semaphore.clone(),
                        sender.clone(),
                        Some(lane),
                    );
                }
            }
            DispatcherMessage::LaneFinished(lane) => {
                match lanes.get_mut(&lane).and_then(|q| q.pop_front()) {
                    Some(next) => {
                        spawn_task(
                            next,
                            relational.clone(),
                            handler.clone(),
                            semaphore.clone(),
                            sender.clone(),
                            Some(lane),
                        );
                    }
                    None => {
                        lanes.remove(&lane);
                        busy.remove(&lane);
                    }
                }
            }
            DispatcherMessage::Shutdown => {
                draining = true;
                if busy.is_empty() {
                    break;
                }
            }
        }
        if draining && busy.is_empty() {
            break;
        }
    }
}

fn spawn_task(
    record: TaskRecord,
    relational: Arc<RelationalStore>,
    handler: Arc<dyn TaskHandler>,
    semaphore: Arc<Semaphore>,
    sender: mpsc::UnboundedSender<DispatcherMessage>,
    lane: Option<String>,
) {
    tokio::spawn(async move {
        // Closed semaphore means shutdown; drop the task, it stays pending
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };

        let started = Instant::now();
        let _ = relational.update_task(&record.task_id, status::RUNNING, None, None, None);

        let outcome = handler.handle(&record).await;
        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok(result) => {
                tracing::info!(
                    task_id = %record.task_id,
                    kind = %record.kind,
                    elapsed,
                    "task succeeded"
                );
                let _ = relational.update_task(
                    &record.task_id,
                    status::SUCCESS,
                    Some(&result),
                    None,
                    Some(elapsed),
                );
            }
            Err(e) => {
                tracing::error!(
                    task_id = %record.task_id,
                    kind = %record.kind,
                    elapsed,
                    "task failed: {}",
                    e
                );
                let _ = relational.update_task(
                    &record.task_id,
                    status::FAILURE,
                    None,
                    Some(&e.to_string()),
                    Some(elapsed),
                );
            }
        }

        if let Some(lane) = lane {
            let _ = sender.send(DispatcherMessage::LaneFinished(lane));
        }
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records handled payloads and simulates slow work
    struct RecordingHandler {
        log: Mutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: &TaskRecord) -> Result<serde_json::Value> {
            tokio::time::sleep(self.delay).await;
            let label = task.payload["label"].as_str().unwrap_or("?").to_string();
            if label.starts_with("fail") {
                return Err(MemoryError::InvalidInput(label));
            }
            self.log.lock().unwrap().push(label.clone());
            Ok(serde_json::json!({"label": label}))
        }
    }

    async fn wait_for_status(queue: &TaskQueue, task_id: &str, wanted: &str) -> TaskRecord {
        for _ in 0..200 {
            if let Some(record) = queue.task_status(task_id).unwrap() {
                if record.status == wanted {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached status {wanted}");
    }

    #[tokio::test]
    async fn test_task_success_and_envelope() {
        let relational = Arc::new(RelationalStore::new(None).unwrap());
        let handler = Arc::new(RecordingHandler {
            log: Mutex::new(vec![]),
            delay: Duration::from_millis(1),
        });
        let queue = TaskQueue::start(relational, handler, 4);

        let task_id = queue
            .submit("ingest", "u1", serde_json::json!({"label": "a"}))
            .unwrap();
        let record = wait_for_status(&queue, &task_id, status::SUCCESS).await;
        assert_eq!(record.result.unwrap()["label"], "a");
        assert!(record.elapsed_seconds.unwrap() >= 0.0);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_task_failure_is_recorded() {
        let relational = Arc::new(RelationalStore::new(None).unwrap());
        let handler = Arc::new(RecordingHandler {
            log: Mutex::new(vec![]),
            delay: Duration::from_millis(1),
        });
        let queue = TaskQueue::start(relational, handler, 4);

        let task_id = queue
            .submit("ingest", "u1", serde_json::json!({"label": "fail-now"}))
            .unwrap();
        let record = wait_for_status(&queue, &task_id, status::FAILURE).await;
        assert!(record.error.unwrap().contains("fail-now"));
    }

    #[tokio::test]
    async fn test_same_lane_is_fifo() {
        let relational = Arc::new(RelationalStore::new(None).unwrap());
        let handler = Arc::new(RecordingHandler {
            log: Mutex::new(vec![]),
            delay: Duration::from_millis(20),
        });
        let queue = TaskQueue::start(relational, handler.clone(), 8);

        let mut last_id = String::new();
        for i in 0..5 {
            last_id = queue
                .submit("ingest", "u1", serde_json::json!({"label": format!("t{i}")}))
                .unwrap();
        }
        wait_for_status(&queue, &last_id, status::SUCCESS).await;

        let log = handler.log.lock().unwrap().clone();
        assert_eq!(log, vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[tokio::test]
    async fn test_cross_lane_tasks_run_concurrently() {
        let relational = Arc::new(RelationalStore::new(None).unwrap());
        let handler = Arc::new(RecordingHandler {
            log: Mutex::new(vec![]),
            delay: Duration::from_millis(50),
        });
        let queue = TaskQueue::start(relational, handler, 8);

        let started = Instant::now();
        let ids: Vec<String> = (0..4)
            .map(|i| {
                queue
                    .submit(
                        "ingest",
                        &format!("user-{i}"),
                        serde_json::json!({"label": format!("u{i}")}),
                    )
                    .unwrap()
            })
            .collect();
        for id in &ids {
            wait_for_status(&queue, id, status::SUCCESS).await;
        }
        // Four 50ms tasks across lanes finish far sooner than serial 200ms
        assert!(started.elapsed() < Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_recover_pending_replays_rows() {
        let relational = Arc::new(RelationalStore::new(None).unwrap());
        // A row left pending by a previous process
        relational
            .insert_task(&TaskRecord {
                task_id: "stale-1".to_string(),
                kind: "ingest".to_string(),
                lane: "u1".to_string(),
                status: status::PENDING.to_string(),
                payload: serde_json::json!({"label": "recovered"}),
                result: None,
                error: None,
                elapsed_seconds: None,
            })
            .unwrap();

        let handler = Arc::new(RecordingHandler {
            log: Mutex::new(vec![]),
            delay: Duration::from_millis(1),
        });
        let queue = TaskQueue::start(relational, handler, 2);
        assert_eq!(queue.recover_pending().unwrap(), 1);
        let record = wait_for_status(&queue, "stale-1", status::SUCCESS).await;
        assert_eq!(record.result.unwrap()["label"], "recovered");
    }
}
