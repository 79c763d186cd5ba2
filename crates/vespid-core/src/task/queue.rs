//! The control-plane task queue.
//!
//! Multi-enqueuer, single-worker FIFO: task N+1's first phase never starts
//! before task N's terminal phase returns, so control-plane effects are
//! strictly serialized per queue. Completion is a oneshot posted exactly
//! once per task; a dequeued task always gets an outcome, cancelled or not.

use super::{Task, TaskContext};
use crate::error::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vespid_protocol::{Timestamp, UniqueId};

struct QueuedTask {
    task: Box<dyn Task>,
    ctx: TaskContext,
    done: oneshot::Sender<Result<()>>,
}

/// Caller-side handle for one enqueued task
pub struct TaskHandle {
    id: UniqueId,
    timestamp: Timestamp,
    done: oneshot::Receiver<Result<()>>,
}

impl TaskHandle {
    pub fn id(&self) -> UniqueId {
        self.id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Wait for the task's outcome. Single-shot: consumes the handle.
    pub async fn wait(self) -> Result<()> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::QueueClosed),
        }
    }
}

/// FIFO ingress for control-plane tasks
pub struct TaskQueue {
    tx: mpsc::Sender<QueuedTask>,
}

impl TaskQueue {
    /// Create the queue and spawn its worker
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(worker(rx));
        Self { tx }
    }

    /// Run `on_enqueue` (id assignment) and append the task. Returns the
    /// handle the caller waits on.
    pub async fn enqueue(
        &self,
        mut task: Box<dyn Task>,
        cancel: CancellationToken,
    ) -> Result<TaskHandle> {
        task.on_enqueue()?;
        let id = task.id();
        let timestamp = task.timestamp();

        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedTask {
            task,
            ctx: TaskContext::new(cancel),
            done: done_tx,
        };
        self.tx
            .send(queued)
            .await
            .map_err(|_| Error::QueueClosed)?;
        debug!(task_id = id, "task enqueued");

        Ok(TaskHandle {
            id,
            timestamp,
            done: done_rx,
        })
    }
}

async fn worker(mut rx: mpsc::Receiver<QueuedTask>) {
    while let Some(mut queued) = rx.recv().await {
        let id = queued.task.id();
        let outcome = run_phases(queued.task.as_mut(), &queued.ctx).await;
        if let Err(err) = &outcome {
            warn!(task_id = id, error = %err, "task failed");
        } else {
            debug!(task_id = id, "task finished");
        }
        // the caller may have dropped its handle; the outcome is then moot
        let _ = queued.done.send(outcome);
    }
}

async fn run_phases(task: &mut dyn Task, ctx: &TaskContext) -> Result<()> {
    task.pre_execute(ctx).await?;
    task.execute(ctx).await?;
    task.post_execute(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct RecordingTask {
        id: UniqueId,
        label: i64,
        log: Arc<parking_lot::Mutex<Vec<i64>>>,
        delay: Duration,
        fail_in: Option<&'static str>,
        post_ran: Arc<AtomicI64>,
    }

    impl RecordingTask {
        fn new(label: i64, log: Arc<parking_lot::Mutex<Vec<i64>>>) -> Self {
            Self {
                id: 0,
                label,
                log,
                delay: Duration::ZERO,
                fail_in: None,
                post_ran: Arc::new(AtomicI64::new(0)),
            }
        }
    }

    #[async_trait]
    impl Task for RecordingTask {
        fn id(&self) -> UniqueId {
            self.id
        }

        fn set_id(&mut self, id: UniqueId) {
            self.id = id;
        }

        fn timestamp(&self) -> Timestamp {
            0
        }

        fn on_enqueue(&mut self) -> Result<()> {
            self.set_id(super::super::random_task_id());
            Ok(())
        }

        async fn pre_execute(&mut self, _ctx: &TaskContext) -> Result<()> {
            if self.fail_in == Some("pre") {
                return Err(Error::Other("pre failed".to_string()));
            }
            Ok(())
        }

        async fn execute(&mut self, _ctx: &TaskContext) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_in == Some("execute") {
                return Err(Error::Other("execute failed".to_string()));
            }
            self.log.lock().push(self.label);
            Ok(())
        }

        async fn post_execute(&mut self, _ctx: &TaskContext) -> Result<()> {
            self.post_ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fifo_ordering() {
        let queue = TaskQueue::new(16);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let mut task = RecordingTask::new(i, log.clone());
            // earlier tasks run longer; order must still hold
            task.delay = Duration::from_millis((8 - i) as u64);
            handles.push(
                queue
                    .enqueue(Box::new(task), CancellationToken::new())
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failure_short_circuits_later_phases() {
        let queue = TaskQueue::new(4);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut task = RecordingTask::new(0, log.clone());
        task.fail_in = Some("execute");
        let post_ran = task.post_ran.clone();

        let handle = queue
            .enqueue(Box::new(task), CancellationToken::new())
            .await
            .unwrap();
        let err = handle.wait().await;
        assert!(err.is_err());
        assert_eq!(post_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_failure_skips_execute() {
        let queue = TaskQueue::new(4);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut task = RecordingTask::new(0, log.clone());
        task.fail_in = Some("pre");
        let handle = queue
            .enqueue(Box::new(task), CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.wait().await.is_err());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_task_still_executes() {
        let queue = TaskQueue::new(4);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        // RecordingTask does not check its context, so it completes; the
        // queue must not have discarded it
        let handle = queue
            .enqueue(Box::new(RecordingTask::new(1, log.clone())), cancel)
            .await
            .unwrap();
        handle.wait().await.unwrap();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_handle_reports_assigned_id() {
        let queue = TaskQueue::new(4);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handle = queue
            .enqueue(
                Box::new(RecordingTask::new(0, log)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(handle.id() > 0);
        handle.wait().await.unwrap();
    }
}
