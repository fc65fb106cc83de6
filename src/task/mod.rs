//! The `Task` lifecycle contract and the single-consumer `TaskQueue` that
//! drives it (§4.1, §4.2, §9 Design Notes).
//!
//! Grounded on the teacher's `stream/src/task/mod.rs` for the idea of a
//! single shared context ([`NodeContext`], defined in `crate::lib`) handed
//! to every unit of work, and on `compute/src/rpc/service/stream_service.rs`
//! for the "receive request, call into the relevant manager, map the error"
//! shape each `PreExecute`/`Execute`/`PostExecute` phase follows. The FIFO
//! queue itself is new plumbing: a `tokio::sync::mpsc` channel feeding a
//! single background worker, with a per-task `tokio::sync::oneshot`
//! completion channel whose `Receiver` *is* `WaitToFinish` — consuming it by
//! value makes "posting more than once is a programming error" a type
//! error rather than a runtime one.

use std::time::Instant;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{QueryNodeError, Result};
use crate::model::{Timestamp, UniqueId};

pub mod add_query_channel;
pub mod load_segments;
pub mod release_collection;
pub mod release_partitions;
pub mod watch_delta_channels;
pub mod watch_dm_channels;

pub use add_query_channel::AddQueryChannelTask;
pub use load_segments::LoadSegmentsTask;
pub use release_collection::ReleaseCollectionTask;
pub use release_partitions::ReleasePartitionsTask;
pub use watch_delta_channels::WatchDeltaChannelsTask;
pub use watch_dm_channels::WatchDmChannelsTask;

pub type TaskId = UniqueId;

/// Carries a task's deadline and cancellation signal end to end (§5).
#[derive(Clone)]
pub struct TaskContext {
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
}

impl Default for TaskContext {
    fn default() -> Self {
        TaskContext {
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
            || self.deadline.is_some_and(|d| Instant::now() > d)
    }

    /// Tasks SHOULD check their context between stages (§5); long
    /// collaborator calls MUST honor it. Returns `Err(Cancelled)` so the
    /// caller's `?` folds it into the task's normal rollback path.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(QueryNodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Shared lifecycle every task variant implements (§4.2). `id`/`set_id`/
/// `base_msg_id`/`base_timestamp` back [`on_enqueue`] and [`timestamp`];
/// the three phases are driven by [`TaskQueue`]'s worker loop.
#[async_trait]
pub trait Task: Send {
    fn kind(&self) -> &'static str;
    fn id(&self) -> TaskId;
    fn set_id(&mut self, id: TaskId);

    /// `Base.MsgID` if the request carried one.
    fn base_msg_id(&self) -> Option<TaskId>;
    /// `Base.Timestamp` if the request carried one; `None` iff `Base` is
    /// nil (§8 Timestamp fallback).
    fn base_timestamp(&self) -> Option<Timestamp>;

    async fn pre_execute(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()>;

    async fn post_execute(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Returns `Base.Timestamp`, or 0 with a logged warning if `Base` is nil
/// (§4.2, §8 "Timestamp fallback").
pub fn timestamp(task: &dyn Task) -> Timestamp {
    match task.base_timestamp() {
        Some(ts) => ts,
        None => {
            warn!(kind = task.kind(), "request has no base timestamp, defaulting to 0");
            0
        }
    }
}

/// A uniformly random nonzero 63-bit integer, the full range rather than
/// the arbitrary `1e11` cap the source used (§9 Design Notes "Random IDs").
pub fn random_unique_id() -> TaskId {
    rand::thread_rng().gen_range(1..=TaskId::MAX)
}

/// Assigns the task's ID from `Base.MsgID` when present, otherwise a random
/// nonzero 63-bit integer (§4.1, §8 "ID assignment").
pub fn on_enqueue(task: &mut dyn Task) {
    let id = task.base_msg_id().unwrap_or_else(random_unique_id);
    task.set_id(id);
}

struct QueueItem {
    task: Box<dyn Task>,
    ctx: TaskContext,
    completion: oneshot::Sender<Result<()>>,
}

/// The result of [`TaskQueue::enqueue`]: the assigned task id plus a
/// single-shot handle on its outcome.
pub struct EnqueuedTask {
    id: TaskId,
    completion: oneshot::Receiver<Result<()>>,
}

impl EnqueuedTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Consumes the handle, waiting for the task's terminal outcome.
    /// Single-shot by construction: `self` is consumed, so calling this
    /// twice is a compile error, not the programming error the Go-derived
    /// spec warns about.
    pub async fn wait_to_finish(self) -> Result<()> {
        self.completion
            .await
            .unwrap_or_else(|_| Err(QueryNodeError::Internal("task queue worker dropped".into())))
    }
}

/// A bounded single-consumer FIFO of pending tasks (§4.1). `enqueue` never
/// blocks for long: it only runs `on_enqueue` and hands the task to the
/// background worker, which drives `PreExecute -> Execute -> PostExecute`
/// for one task at a time, in arrival order.
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<QueueItem>,
}

impl TaskQueue {
    /// Spawns the worker loop onto the ambient tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueueItem>();
        tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                let outcome = run_phases(item.task, &item.ctx).await;
                // A dropped receiver (caller stopped waiting) is not this
                // worker's problem; move on to the next task regardless.
                let _ = item.completion.send(outcome);
            }
        });
        TaskQueue { sender }
    }

    /// Enqueues `task`: assigns its id via [`on_enqueue`], then appends it
    /// to the FIFO. The task is executed exactly once, even if `ctx` is
    /// already cancelled (§4.1 "the queue itself does not discard").
    pub fn enqueue(&self, mut task: Box<dyn Task>, ctx: TaskContext) -> EnqueuedTask {
        on_enqueue(task.as_mut());
        let id = task.id();
        debug!(kind = task.kind(), id, "task enqueued");
        let (completion, rx) = oneshot::channel();
        // An unbounded sender only fails if the worker task panicked and
        // dropped the receiver; surface that as an immediate failure.
        if self
            .sender
            .send(QueueItem { task, ctx, completion })
            .is_err()
        {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(QueryNodeError::Internal("task queue worker is gone".into())));
            return EnqueuedTask { id, completion: rx };
        }
        EnqueuedTask { id, completion: rx }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_phases(mut task: Box<dyn Task>, ctx: &TaskContext) -> Result<()> {
    let kind = task.kind();
    let id = task.id();
    let result = async {
        task.pre_execute(ctx).await?;
        task.execute(ctx).await?;
        task.post_execute(ctx).await?;
        Ok(())
    }
    .await;
    match &result {
        Ok(()) => debug!(kind, id, "task completed"),
        Err(e) => error!(kind, id, error = %e, "task failed"),
    }
    result
}
