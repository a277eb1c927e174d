//! Writes attempt outcomes back to the store.
//!
//! The success path is three sequential writes with no transaction: the
//! pdf record, the user's artifact list, then the task. A crash between
//! them can leave a pdf that no task points at.

use chrono::Utc;
use tracing::{info, warn};

use texflow_core::{Result, Task, TaskStatus};
use texflow_db::Records;

use crate::pool::{Completion, Outcome};

/// What publishing a completion did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Finished { pdf_id: String },
    Failed { error: String },
    /// Nothing was written; the task stays `compiling`.
    Abandoned { reason: String },
    /// The task was no longer held under this attempt's lease.
    Stale,
}

/// Persists compile results.
#[derive(Clone)]
pub struct ResultPublisher {
    records: Records,
}

impl ResultPublisher {
    pub fn new(records: Records) -> Self {
        Self { records }
    }

    /// Publish one completion.
    pub async fn publish(&self, completion: &Completion) -> Result<Published> {
        let task = &completion.task;
        let result = match &completion.outcome {
            Outcome::Finished { pdf } => Ok(pdf),
            Outcome::Failed { error } => Err(error.clone()),
            Outcome::Abandoned { reason } => {
                warn!(
                    subsystem = "publisher",
                    task_id = %task.task_id,
                    reason = %reason,
                    "Attempt abandoned; task left compiling"
                );
                return Ok(Published::Abandoned {
                    reason: reason.clone(),
                });
            }
        };

        if !self.holds_lease(task).await? {
            warn!(
                subsystem = "publisher",
                task_id = %task.task_id,
                "Discarding stale completion"
            );
            return Ok(Published::Stale);
        }

        let error = match result {
            Ok(pdf) => match self.publish_success(task, pdf).await {
                Ok(pdf_id) => return Ok(Published::Finished { pdf_id }),
                Err(e) => e.to_string(),
            },
            Err(error) => error,
        };
        self.publish_failure(task, &error).await?;
        Ok(Published::Failed { error })
    }

    /// Store the artifact, link it to the user and finish the task.
    pub async fn publish_success(&self, task: &Task, pdf: &[u8]) -> Result<String> {
        let record = self.records.pdfs.create(pdf, Utc::now()).await?;
        self.records
            .users
            .append_pdf(&task.user_id, &record.pdf_id)
            .await?;
        self.records
            .tasks
            .finish(&task.task_id, task.lease_id, &record.pdf_id)
            .await?;

        info!(
            subsystem = "publisher",
            task_id = %task.task_id,
            user_id = %task.user_id,
            pdf_id = %record.pdf_id,
            size_bytes = pdf.len(),
            "Task finished"
        );
        Ok(record.pdf_id)
    }

    /// Mark the task failed with `error`.
    pub async fn publish_failure(&self, task: &Task, error: &str) -> Result<()> {
        self.records
            .tasks
            .fail(&task.task_id, task.lease_id, error)
            .await?;
        warn!(
            subsystem = "publisher",
            task_id = %task.task_id,
            error = %error,
            "Task failed"
        );
        Ok(())
    }

    async fn holds_lease(&self, task: &Task) -> Result<bool> {
        let current = self.records.tasks.get(&task.task_id).await?;
        Ok(current.status == TaskStatus::Compiling && current.lease_id == task.lease_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn leased_task(records: &Records) -> Task {
        let user = records.users.create().await.unwrap();
        let task = records
            .tasks
            .create(Task::new(&user.user_id, "doc", "article", ""))
            .await
            .unwrap();
        records.tasks.lease(&task.task_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_appends_exactly_one_pdf() {
        let records = Records::in_memory();
        let task = leased_task(&records).await;
        records.users.append_pdf(&task.user_id, "older").await.unwrap();
        let publisher = ResultPublisher::new(records.clone());

        let published = publisher
            .publish(&Completion {
                task: task.clone(),
                outcome: Outcome::Finished {
                    pdf: b"%PDF".to_vec(),
                },
            })
            .await
            .unwrap();
        let Published::Finished { pdf_id } = published else {
            panic!("expected finished, got {:?}", published);
        };

        let user = records.users.get(&task.user_id).await.unwrap();
        assert_eq!(user.compiled_pdfs, vec!["older".to_string(), pdf_id.clone()]);

        let stored = records.tasks.get(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Finished);
        assert_eq!(stored.pdf_id.as_deref(), Some(pdf_id.as_str()));
        assert_eq!(
            records.pdfs.get(&pdf_id).await.unwrap().decode_data().unwrap(),
            b"%PDF"
        );
    }

    #[tokio::test]
    async fn test_failure_has_no_pdf() {
        let records = Records::in_memory();
        let task = leased_task(&records).await;
        let publisher = ResultPublisher::new(records.clone());

        publisher
            .publish(&Completion {
                task: task.clone(),
                outcome: Outcome::Failed {
                    error: "No pdf generated".into(),
                },
            })
            .await
            .unwrap();

        let stored = records.tasks.get(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.pdf_id.is_none());
        assert!(records
            .users
            .get(&task.user_id)
            .await
            .unwrap()
            .compiled_pdfs
            .is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_writes_nothing() {
        let records = Records::in_memory();
        let task = leased_task(&records).await;
        let publisher = ResultPublisher::new(records.clone());

        let published = publisher
            .publish(&Completion {
                task: task.clone(),
                outcome: Outcome::Abandoned {
                    reason: "timeout".into(),
                },
            })
            .await
            .unwrap();
        assert!(matches!(published, Published::Abandoned { .. }));
        let stored = records.tasks.get(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Compiling);
    }

    #[tokio::test]
    async fn test_stale_completion_discarded() {
        let records = Records::in_memory();
        let task = leased_task(&records).await;
        records
            .tasks
            .fail(&task.task_id, task.lease_id, "lease expired")
            .await
            .unwrap();
        let publisher = ResultPublisher::new(records.clone());

        let published = publisher
            .publish(&Completion {
                task: task.clone(),
                outcome: Outcome::Finished {
                    pdf: b"%PDF".to_vec(),
                },
            })
            .await
            .unwrap();
        assert_eq!(published, Published::Stale);

        let stored = records.tasks.get(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(records
            .users
            .get(&task.user_id)
            .await
            .unwrap()
            .compiled_pdfs
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_owner_fails_task() {
        let records = Records::in_memory();
        let task = leased_task(&records).await;
        records.users.delete(&task.user_id).await.unwrap();
        let publisher = ResultPublisher::new(records.clone());

        let published = publisher
            .publish(&Completion {
                task: task.clone(),
                outcome: Outcome::Finished {
                    pdf: b"%PDF".to_vec(),
                },
            })
            .await
            .unwrap();
        assert!(matches!(published, Published::Failed { .. }));
        let stored = records.tasks.get(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }
}
