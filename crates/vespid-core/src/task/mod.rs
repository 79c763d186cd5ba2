//! Control-plane tasks — split into submodules by request kind
//!
//! | Module | Responsibility |
//! |--------|---------------|
//! | `queue` | FIFO ingress, id assignment, single-worker phase driving |
//! | `add_query_channel` | Attach the query-shard service to a query channel |
//! | `watch_dm_channels` | Attach DML channels, load growing segments, excluded-segment bookkeeping |
//! | `watch_delta_channels` | Attach delta channels, replay deletes from the DML checkpoint |
//! | `load_segments` | Load sealed segments into the historical replica |
//! | `release_collection` | Tear a collection down across both replicas |
//! | `release_partitions` | Drop partitions from both replicas |

mod add_query_channel;
mod load_segments;
mod queue;
mod release_collection;
mod release_partitions;
mod watch_delta_channels;
mod watch_dm_channels;

pub use add_query_channel::AddQueryChannelTask;
pub use load_segments::LoadSegmentsTask;
pub use queue::{TaskHandle, TaskQueue};
pub use release_collection::ReleaseCollectionTask;
pub use release_partitions::ReleasePartitionsTask;
pub use watch_delta_channels::WatchDeltaChannelsTask;
pub use watch_dm_channels::WatchDmChannelsTask;

use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use vespid_protocol::{MsgBase, Timestamp, UniqueId};

/// Execution context handed to every task phase
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Fail fast when the request has been cancelled. Tasks call this
    /// before and between stages; the queue itself never discards a task.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Lifecycle contract shared by all six task variants.
///
/// The queue runs `pre_execute → execute → post_execute` on its single
/// worker; the first phase returning an error short-circuits the rest and
/// becomes the task's outcome.
#[async_trait]
pub trait Task: Send {
    fn id(&self) -> UniqueId;

    fn set_id(&mut self, id: UniqueId);

    /// The request's base timestamp, or 0 (with a warning) when the
    /// envelope is missing
    fn timestamp(&self) -> Timestamp;

    /// Runs at enqueue time on the caller: assigns the task id from the
    /// request's message id, or a random one when the envelope is missing
    fn on_enqueue(&mut self) -> Result<()>;

    async fn pre_execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()>;

    async fn post_execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Compensating actions collected while a task produces side effects.
///
/// On failure the task runs them in reverse, undoing partial work back to
/// its rollback boundary; on success they are dropped unrun.
pub(crate) struct Compensations {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl Compensations {
    pub(crate) fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    pub(crate) fn push<F: FnOnce() + Send + 'static>(&mut self, action: F) {
        self.actions.push(Box::new(action));
    }

    /// Undo recorded side effects, most recent first
    pub(crate) fn run(self) {
        for action in self.actions.into_iter().rev() {
            action();
        }
    }

    /// The task committed; nothing to undo
    pub(crate) fn discard(self) {}
}

/// Uniformly random nonzero 63-bit id for tasks without an envelope
pub(crate) fn random_task_id() -> UniqueId {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen::<i64>() & i64::MAX;
        if id != 0 {
            return id;
        }
    }
}

/// Task id for a request envelope: the coordinator's message id, or a
/// random one when the envelope is absent
pub(crate) fn id_from_base(base: Option<&MsgBase>) -> UniqueId {
    match base {
        Some(base) => base.msg_id,
        None => random_task_id(),
    }
}
