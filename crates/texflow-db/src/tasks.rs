//! Task records and their status transitions.
//!
//! Status writes happen in two places only: the scheduler's lease
//! (`new -> compiling`) and the result publisher (`compiling -> finished`
//! or `compiling -> failed`). Each transition re-reads the task first and
//! refuses to move it backwards. The read and the write are not atomic, so
//! two writers racing on the same task can still interleave; the lease
//! token lets the publisher detect a stale completion after the fact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use texflow_core::ids::lease_token;
use texflow_core::{DocumentStore, Error, Result, Task, TaskStatus};

use crate::repository::{patch, Repository};

/// Repository for compile tasks.
#[derive(Clone)]
pub struct TaskRecords {
    repo: Repository<Task>,
}

impl TaskRecords {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            repo: Repository::new(store),
        }
    }

    /// All valid tasks in store scan order.
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        self.repo.find_all().await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.repo.find(task_id).await
    }

    /// Store a new task. Status and result fields are reset to a fresh `new` task.
    pub async fn create(&self, mut task: Task) -> Result<Task> {
        task.task_id.clear();
        task.status = TaskStatus::New;
        task.pdf_id = None;
        task.error = None;
        task.lease_id = None;
        task.leased_at = None;
        self.repo.create(&mut task).await?;
        Ok(task)
    }

    /// Lease a `new` task: mark it `compiling` under a fresh lease token.
    ///
    /// Returns `None` when the task is no longer `new` or has been deleted.
    pub async fn lease(&self, task_id: &str) -> Result<Option<Task>> {
        let mut task = match self.repo.find(task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                debug!(subsystem = "store", task_id, "Task deleted before lease");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if task.status != TaskStatus::New {
            return Ok(None);
        }

        let lease_id = lease_token();
        let leased_at = Utc::now();
        let updated = self
            .repo
            .update(
                task_id,
                patch([
                    ("status", json!(TaskStatus::Compiling)),
                    ("lease_id", json!(lease_id)),
                    ("leased_at", json!(leased_at)),
                ]),
            )
            .await;
        match updated {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }

        debug!(subsystem = "store", task_id, %lease_id, "Task leased");
        task.status = TaskStatus::Compiling;
        task.lease_id = Some(lease_id);
        task.leased_at = Some(leased_at);
        Ok(Some(task))
    }

    /// Move a `compiling` task to `finished` with its artifact.
    pub async fn finish(&self, task_id: &str, lease_id: Option<Uuid>, pdf_id: &str) -> Result<()> {
        if pdf_id.is_empty() {
            return Err(Error::InvalidInput(format!(
                "finished task {} needs a pdf id",
                task_id
            )));
        }
        self.check_transition(task_id, lease_id, TaskStatus::Finished)
            .await?;
        self.repo
            .update(
                task_id,
                patch([
                    ("status", json!(TaskStatus::Finished)),
                    ("pdf_id", json!(pdf_id)),
                    ("error", JsonValue::Null),
                ]),
            )
            .await
    }

    /// Move a `compiling` task to `failed` with an error description.
    pub async fn fail(&self, task_id: &str, lease_id: Option<Uuid>, error: &str) -> Result<()> {
        self.check_transition(task_id, lease_id, TaskStatus::Failed)
            .await?;
        self.repo
            .update(
                task_id,
                patch([
                    ("status", json!(TaskStatus::Failed)),
                    ("error", json!(error)),
                    ("pdf_id", JsonValue::Null),
                ]),
            )
            .await
    }

    /// Client-initiated deletion.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.repo.delete(task_id).await
    }

    /// `compiling` tasks leased before `cutoff`.
    pub async fn leased_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| {
                t.status == TaskStatus::Compiling && t.leased_at.map_or(true, |at| at < cutoff)
            })
            .collect())
    }

    async fn check_transition(
        &self,
        task_id: &str,
        lease_id: Option<Uuid>,
        next: TaskStatus,
    ) -> Result<()> {
        let current = self.repo.find(task_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "task {} cannot move from {} to {}",
                task_id, current.status, next
            )));
        }
        if lease_id.is_some() && current.lease_id != lease_id {
            return Err(Error::InvalidInput(format!(
                "task {} lease changed; refusing stale {} write",
                task_id, next
            )));
        }
        Ok(())
    }
}
