//! Process strategy: a fixed set of workers pulling from a shared queue.
//!
//! Each worker runs its compiles as child processes with a hard timeout.
//! Tasks reach workers through one unbounded FIFO and completions come back
//! through another; the scheduler never shares mutable state with a worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use texflow_core::{Error, Result, Task, TimeoutPolicy};

use super::{Completion, Outcome, PoolStats, WorkerPool};
use crate::job::{CompileContext, CompileJob};

type TaskQueue = Arc<Mutex<mpsc::UnboundedReceiver<Task>>>;

/// Pool of in-process workers fed by message queues.
pub struct ProcessPool {
    task_tx: Option<mpsc::UnboundedSender<Task>>,
    result_rx: mpsc::UnboundedReceiver<Completion>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
    /// Dispatched and not yet reconciled.
    busy: usize,
    queued: Arc<AtomicUsize>,
    results: Arc<AtomicUsize>,
}

impl ProcessPool {
    /// Spawn `compiler_number` workers.
    pub fn start(ctx: CompileContext) -> Self {
        let size = ctx.config.worker_count();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let task_rx: TaskQueue = Arc::new(Mutex::new(task_rx));
        let queued = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(ctx);

        let workers = (0..size)
            .map(|index| {
                let worker = Worker {
                    name: format!("compiler-{}", index),
                    ctx: ctx.clone(),
                    tasks: task_rx.clone(),
                    results: result_tx.clone(),
                    queued: queued.clone(),
                    result_count: results.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            subsystem = "pool",
            component = "process",
            workers = size,
            timeout_secs = ctx.config.compile_timeout,
            "Process pool started"
        );

        Self {
            task_tx: Some(task_tx),
            result_rx,
            workers,
            size,
            busy: 0,
            queued,
            results,
        }
    }

    fn drain(&mut self, limit: usize) -> Vec<Completion> {
        let mut done = Vec::new();
        while done.len() < limit {
            match self.result_rx.try_recv() {
                Ok(completion) => {
                    self.results.fetch_sub(1, Ordering::Relaxed);
                    self.busy = self.busy.saturating_sub(1);
                    done.push(completion);
                }
                Err(_) => break,
            }
        }
        done
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    fn name(&self) -> &'static str {
        "process"
    }

    fn size(&self) -> usize {
        self.size
    }

    fn idle_count(&self) -> usize {
        if self.task_tx.is_none() {
            return 0;
        }
        self.size.saturating_sub(self.busy)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queued.load(Ordering::Relaxed),
            busy: self.busy,
            results: self.results.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(&mut self, task: Task) -> Result<()> {
        if self.idle_count() == 0 {
            return Err(Error::Internal("no idle compiler".into()));
        }
        let tx = self
            .task_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("process pool is shut down".into()))?;

        self.queued.fetch_add(1, Ordering::Relaxed);
        if tx.send(task).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Internal("all compilers have stopped".into()));
        }
        self.busy += 1;
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<Vec<Completion>> {
        // At most one result per worker slot per pass.
        Ok(self.drain(self.size))
    }

    async fn shutdown(&mut self) -> Result<Vec<Completion>> {
        // Closing the queue lets each worker finish its current attempt and exit.
        self.task_tx.take();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(subsystem = "pool", component = "process", error = ?e, "Compiler task panicked");
            }
        }
        let done = self.drain(usize::MAX);
        info!(
            subsystem = "pool",
            component = "process",
            completions = done.len(),
            "Process pool stopped"
        );
        Ok(done)
    }
}

struct Worker {
    name: String,
    ctx: Arc<CompileContext>,
    tasks: TaskQueue,
    results: mpsc::UnboundedSender<Completion>,
    queued: Arc<AtomicUsize>,
    result_count: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = self.tasks.lock().await.recv().await;
            let Some(task) = next else { break };
            self.queued.fetch_sub(1, Ordering::Relaxed);

            info!(
                subsystem = "pool",
                component = "process",
                worker = %self.name,
                task_id = %task.task_id,
                "Compiling task"
            );
            let outcome = run_attempt(&self.ctx, &task).await;

            self.result_count.fetch_add(1, Ordering::Relaxed);
            if self.results.send(Completion { task, outcome }).is_err() {
                self.result_count.fetch_sub(1, Ordering::Relaxed);
                break;
            }
        }
        debug!(subsystem = "pool", worker = %self.name, "Compiler stopped");
    }
}

/// Run one attempt to its outcome and clean up its scratch directory.
///
/// Scratch is always removed, except for failed attempts when
/// `keep_failed_scratch` is set.
async fn run_attempt(ctx: &CompileContext, task: &Task) -> Outcome {
    let job = ctx.job(task);
    let start = Instant::now();

    let outcome = match compile(ctx, &job, task).await {
        Ok(pdf) => Outcome::Finished { pdf },
        Err(e @ Error::CompileTimeout(_)) => match ctx.config.on_timeout {
            TimeoutPolicy::Abandon => {
                warn!(
                    subsystem = "compile",
                    task_id = %task.task_id,
                    error = %e,
                    "Compile timed out; task left compiling"
                );
                Outcome::Abandoned {
                    reason: e.to_string(),
                }
            }
            TimeoutPolicy::Fail => Outcome::Failed {
                error: e.to_string(),
            },
        },
        Err(e) => Outcome::Failed {
            error: e.to_string(),
        },
    };

    let keep = ctx.config.keep_failed_scratch && matches!(outcome, Outcome::Failed { .. });
    if keep {
        info!(
            subsystem = "compile",
            task_id = %task.task_id,
            scratch = %job.scratch().display(),
            "Keeping scratch of failed attempt"
        );
    } else {
        job.cleanup().await;
    }

    debug!(
        subsystem = "compile",
        task_id = %task.task_id,
        duration_ms = start.elapsed().as_millis() as u64,
        "Attempt ended"
    );
    outcome
}

async fn compile(ctx: &CompileContext, job: &CompileJob, task: &Task) -> Result<Vec<u8>> {
    job.prepare(ctx, task).await?;
    let output = ctx
        .command
        .run(job.source(), job.scratch(), ctx.config.compile_timeout())
        .await?;

    match job.read_artifact().await {
        Ok(pdf) => Ok(pdf),
        Err(e) => {
            debug!(
                subsystem = "compile",
                task_id = %task.task_id,
                status = %output.status,
                stderr = %stderr_tail(&output.stderr),
                "Compiler produced no artifact"
            );
            Err(e)
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}
