//! Worker pools.
//!
//! A pool owns a fixed number of workers, each holding at most one task.
//! The scheduler drives it from a single loop: it asks how many workers are
//! idle, dispatches at most that many leased tasks, and collects finished
//! attempts with [`WorkerPool::reconcile`].

mod process;
mod sandbox;

use async_trait::async_trait;

use texflow_core::{Result, Task};

pub use process::ProcessPool;
pub use sandbox::{DockerRuntime, LocalRuntime, SandboxPool, SandboxRuntime};

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The artifact was produced.
    Finished { pdf: Vec<u8> },
    /// The attempt failed and the task should be marked `failed`.
    Failed { error: String },
    /// The attempt was dropped; the task keeps its current status.
    Abandoned { reason: String },
}

/// A task whose attempt ended, with its outcome.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task: Task,
    pub outcome: Outcome,
}

/// Snapshot of pool queues, logged every scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Dispatched tasks not yet picked up by a worker.
    pub queued: usize,
    /// Tasks held by workers, queued ones included.
    pub busy: usize,
    /// Completions waiting to be reconciled.
    pub results: usize,
}

#[async_trait]
pub trait WorkerPool: Send {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Total number of workers.
    fn size(&self) -> usize;

    /// Workers able to accept a task right now.
    fn idle_count(&self) -> usize;

    fn stats(&self) -> PoolStats;

    /// Hand a leased task to an idle worker. Does not wait for the compile.
    async fn dispatch(&mut self, task: Task) -> Result<()>;

    /// Collect attempts that ended since the last call, freeing their workers.
    async fn reconcile(&mut self) -> Result<Vec<Completion>>;

    /// Stop all workers, returning any completions collected while stopping.
    async fn shutdown(&mut self) -> Result<Vec<Completion>>;
}
