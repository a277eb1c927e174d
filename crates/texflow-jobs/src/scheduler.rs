//! The polling scheduler.
//!
//! Each pass scans the task collection, leases `new` tasks in scan order up
//! to the pool's idle capacity, hands them to the pool, then publishes the
//! attempts the pool reports as ended. Leasing is the `new -> compiling`
//! write and happens before dispatch; tasks beyond capacity stay `new` for a
//! later pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use texflow_core::{defaults, CompilerConfig, Error, Result, TaskStatus};
use texflow_db::Records;

use crate::pool::{Completion, WorkerPool};
use crate::publisher::{Published, ResultPublisher};

/// Error recorded on tasks reclaimed after `lease_timeout`.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Event emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Started,
    /// A task moved to `compiling` and was dispatched.
    TaskLeased { task_id: String },
    TaskFinished { task_id: String, pdf_id: String },
    TaskFailed { task_id: String, error: String },
    /// An attempt ended without changing the task.
    TaskAbandoned { task_id: String, reason: String },
    /// An orphaned `compiling` task was failed after its lease expired.
    TaskReclaimed { task_id: String },
    Stopped,
}

/// Counts for one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub idle: usize,
    pub leased: usize,
    pub finished: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub reclaimed: usize,
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<SchedulerEvent>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the scheduler to stop after its current pass.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait until the scheduler has stopped and its pool has shut down.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("scheduler task failed: {}", e)))
    }
}

/// Polls the store and drives a worker pool.
pub struct Scheduler<P: WorkerPool> {
    records: Records,
    pool: P,
    publisher: ResultPublisher,
    config: Arc<CompilerConfig>,
    /// Tasks this scheduler has dispatched and not yet seen end.
    in_flight: HashSet<String>,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl<P: WorkerPool + 'static> Scheduler<P> {
    pub fn new(records: Records, pool: P, config: Arc<CompilerConfig>) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_CHANNEL_CAPACITY);
        Self {
            publisher: ResultPublisher::new(records.clone()),
            records,
            pool,
            config,
            in_flight: HashSet::new(),
            event_tx,
        }
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Number of dispatched tasks whose attempts have not ended.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Start the poll loop and return a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip_all, fields(subsystem = "scheduler"))]
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            pool = self.pool.name(),
            workers = self.pool.size(),
            scan_interval_secs = self.config.db_scan_interval,
            "Scheduler started"
        );
        let _ = self.event_tx.send(SchedulerEvent::Started);

        loop {
            let wait = match self.run_pass().await {
                Ok(_) => self.config.scan_interval(),
                Err(e) => {
                    error!(error = %e, "Scheduler pass failed");
                    self.config.scan_error_backoff()
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = sleep(wait) => {}
            }
        }

        match self.pool.shutdown().await {
            Ok(completions) => {
                for completion in completions {
                    self.complete(completion).await;
                }
            }
            Err(e) => error!(error = %e, "Pool shutdown failed"),
        }
        if !self.in_flight.is_empty() {
            warn!(
                in_flight = self.in_flight.len(),
                "Stopped with tasks still compiling"
            );
        }

        let _ = self.event_tx.send(SchedulerEvent::Stopped);
        info!("Scheduler stopped");
    }

    /// Run one scheduling pass: lease and dispatch, reconcile, reclaim.
    pub async fn run_pass(&mut self) -> Result<PassSummary> {
        let start = Instant::now();
        let mut summary = PassSummary {
            idle: self.pool.idle_count(),
            ..Default::default()
        };

        let tasks = self.records.tasks.list_all().await?;
        let candidates: Vec<String> = tasks
            .into_iter()
            .filter(|task| task.status == TaskStatus::New)
            .map(|task| task.task_id)
            .collect();

        for task_id in candidates.iter().take(summary.idle) {
            let Some(task) = self.records.tasks.lease(task_id).await? else {
                continue;
            };
            self.in_flight.insert(task.task_id.clone());
            summary.leased += 1;
            let _ = self.event_tx.send(SchedulerEvent::TaskLeased {
                task_id: task.task_id.clone(),
            });

            if let Err(e) = self.pool.dispatch(task.clone()).await {
                error!(task_id = %task.task_id, error = %e, "Dispatch failed");
                self.in_flight.remove(&task.task_id);
                match self.publisher.publish_failure(&task, &e.to_string()).await {
                    Ok(()) => summary.failed += 1,
                    Err(e) => {
                        error!(subsystem = "scheduler", task_id = %task.task_id, error = %e, "Failed to publish result")
                    }
                }
            }
        }

        for completion in self.pool.reconcile().await? {
            match self.complete(completion).await {
                Some(Published::Finished { .. }) => summary.finished += 1,
                Some(Published::Failed { .. }) => summary.failed += 1,
                Some(Published::Abandoned { .. }) => summary.abandoned += 1,
                Some(Published::Stale) | None => {}
            }
        }

        summary.reclaimed = self.reclaim_expired().await?;

        let stats = self.pool.stats();
        debug!(
            subsystem = "scheduler",
            idle = summary.idle,
            pending = candidates.len().saturating_sub(summary.leased),
            leased = summary.leased,
            queued = stats.queued,
            busy = stats.busy,
            results = stats.results,
            duration_ms = start.elapsed().as_millis() as u64,
            "Scheduler pass complete"
        );
        Ok(summary)
    }

    /// Publish one ended attempt. Publishing errors are logged; the task
    /// keeps whatever status the store holds.
    async fn complete(&mut self, completion: Completion) -> Option<Published> {
        let task_id = completion.task.task_id.clone();
        self.in_flight.remove(&task_id);

        let published = match self.publisher.publish(&completion).await {
            Ok(published) => published,
            Err(e) => {
                error!(subsystem = "scheduler", task_id = %task_id, error = %e, "Failed to publish result");
                return None;
            }
        };

        let event = match &published {
            Published::Finished { pdf_id } => Some(SchedulerEvent::TaskFinished {
                task_id,
                pdf_id: pdf_id.clone(),
            }),
            Published::Failed { error } => Some(SchedulerEvent::TaskFailed {
                task_id,
                error: error.clone(),
            }),
            Published::Abandoned { reason } => Some(SchedulerEvent::TaskAbandoned {
                task_id,
                reason: reason.clone(),
            }),
            Published::Stale => None,
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
        Some(published)
    }

    /// Fail `compiling` tasks whose lease is older than `lease_timeout` and
    /// that no worker of this scheduler holds. Disabled without a timeout.
    async fn reclaim_expired(&mut self) -> Result<usize> {
        let Some(timeout) = self.config.lease_timeout() else {
            return Ok(0);
        };
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::Config(format!("lease_timeout out of range: {}", e)))?;
        let cutoff = chrono::Utc::now() - timeout;

        let mut reclaimed = 0;
        for task in self.records.tasks.leased_before(cutoff).await? {
            if self.in_flight.contains(&task.task_id) {
                continue;
            }
            match self
                .records
                .tasks
                .fail(&task.task_id, task.lease_id, LEASE_EXPIRED)
                .await
            {
                Ok(()) => {
                    warn!(subsystem = "scheduler", task_id = %task.task_id, "Reclaimed task with expired lease");
                    reclaimed += 1;
                    let _ = self.event_tx.send(SchedulerEvent::TaskReclaimed {
                        task_id: task.task_id,
                    });
                }
                Err(e) => {
                    debug!(subsystem = "scheduler", task_id = %task.task_id, error = %e, "Reclaim skipped")
                }
            }
        }
        Ok(reclaimed)
    }
}
