//! # Analysis Queue and Worker Pool
//!
//! A named, bounded queue of analysis jobs consumed by a process-wide pool
//! of worker tasks. Each job executes to completion on a single worker;
//! there is no intra-task parallelism across pipeline stages.
//!
//! ## Cancellation:
//! Cancellation is cooperative. The queue keeps one flag per in-flight task;
//! the orchestrator checks it between pipeline stages and a cancel request
//! simply raises the flag (and, for still-PENDING tasks, the caller updates
//! the record directly so a cancelled task is never picked up).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One unit of work delivered to a worker.
#[derive(Debug, Clone, Copy)]
pub struct QueuedJob {
    pub task_id: Uuid,
    pub queue_id: Uuid,
}

/// Shared flag raised when a task is cancelled.
pub type CancellationFlag = Arc<AtomicBool>;

/// Named analysis queue handing jobs to the worker pool.
pub struct AnalysisQueue {
    name: String,
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    cancellations: Mutex<HashMap<Uuid, CancellationFlag>>,
}

impl AnalysisQueue {
    /// Create the queue and its receiving end.
    ///
    /// The receiver is handed to `spawn_workers`; the queue keeps only the
    /// sending side so `close` can shut the channel and drain the pool.
    pub fn new(name: &str, capacity: usize) -> (Arc<Self>, mpsc::Receiver<QueuedJob>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Arc::new(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            cancellations: Mutex::new(HashMap::new()),
        });
        (queue, receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accept a task onto the queue and assign its queue-system id.
    ///
    /// Assignment does not change the task's status; the caller records the
    /// returned id on the task record.
    pub async fn enqueue(&self, task_id: Uuid) -> anyhow::Result<Uuid> {
        let sender = {
            let guard = self.sender.lock().unwrap();
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Queue {} is shut down", self.name))?
        };

        let queue_id = Uuid::new_v4();
        // entry() preserves a flag raised by a cancel that won the race.
        self.cancellations
            .lock()
            .unwrap()
            .entry(task_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));

        sender
            .send(QueuedJob { task_id, queue_id })
            .await
            .map_err(|_| anyhow::anyhow!("Queue {} rejected the job", self.name))?;

        debug!(queue = %self.name, task_id = %task_id, queue_id = %queue_id, "Job enqueued");
        Ok(queue_id)
    }

    /// The cancellation flag for a task; created on demand so a cancel
    /// racing an enqueue still lands.
    pub fn cancellation_flag(&self, task_id: Uuid) -> CancellationFlag {
        let mut cancellations = self.cancellations.lock().unwrap();
        Arc::clone(
            cancellations
                .entry(task_id)
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Raise the cancellation flag for a task.
    pub fn cancel(&self, task_id: Uuid) {
        self.cancellation_flag(task_id).store(true, Ordering::SeqCst);
        info!(queue = %self.name, task_id = %task_id, "Cancellation requested");
    }

    /// Drop the flag after a task reaches a terminal state.
    pub fn forget(&self, task_id: Uuid) {
        self.cancellations.lock().unwrap().remove(&task_id);
    }

    /// Stop accepting new work. Workers drain the remaining jobs and exit
    /// when the channel is empty.
    pub fn close(&self) {
        let mut guard = self.sender.lock().unwrap();
        if guard.take().is_some() {
            info!(queue = %self.name, "Queue closed");
        }
    }
}

/// Spawn `concurrency` workers consuming the queue.
///
/// Returns the worker join handles so shutdown can await the drain. Each
/// worker pulls one job at a time off the shared receiver and runs it to
/// completion through the orchestrator.
pub fn spawn_workers(
    queue: Arc<AnalysisQueue>,
    receiver: mpsc::Receiver<QueuedJob>,
    orchestrator: Arc<crate::tasks::orchestrator::AnalysisOrchestrator>,
    concurrency: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    let mut handles = Vec::with_capacity(concurrency);

    for worker_index in 0..concurrency {
        let receiver = Arc::clone(&receiver);
        let queue = Arc::clone(&queue);
        let orchestrator = Arc::clone(&orchestrator);

        handles.push(tokio::spawn(async move {
            info!(worker = worker_index, queue = %queue.name(), "Analysis worker started");
            loop {
                let job = {
                    let mut receiver = receiver.lock().await;
                    receiver.recv().await
                };
                let Some(job) = job else {
                    break;
                };

                let cancel = queue.cancellation_flag(job.task_id);
                debug!(worker = worker_index, task_id = %job.task_id, "Worker picked up job");
                orchestrator.process(job, cancel).await;
                queue.forget(job.task_id);
            }
            info!(worker = worker_index, "Analysis worker stopped");
        }));
    }

    if concurrency == 0 {
        warn!("Worker pool started with zero concurrency, jobs will not run");
    }
    handles
}
