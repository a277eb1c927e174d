//! User records.

use std::sync::Arc;

use serde_json::json;

use texflow_core::{DocumentStore, Result, User};

use crate::repository::{patch, Repository};

/// Repository for users and their compiled artifact lists.
#[derive(Clone)]
pub struct UserRecords {
    repo: Repository<User>,
}

impl UserRecords {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            repo: Repository::new(store),
        }
    }

    /// Create a user with an empty artifact list.
    pub async fn create(&self) -> Result<User> {
        let mut user = User::default();
        self.repo.create(&mut user).await?;
        Ok(user)
    }

    pub async fn get(&self, user_id: &str) -> Result<User> {
        self.repo.find(user_id).await
    }

    pub async fn exists(&self, user_id: &str) -> Result<bool> {
        self.repo.exists(user_id).await
    }

    /// Append an artifact id to the user's list and return the updated user.
    ///
    /// Read-modify-write: callers must not append for the same user
    /// concurrently.
    pub async fn append_pdf(&self, user_id: &str, pdf_id: &str) -> Result<User> {
        let mut user = self.repo.find(user_id).await?;
        user.compiled_pdfs.push(pdf_id.to_string());
        self.repo
            .update(user_id, patch([("compiled_pdfs", json!(user.compiled_pdfs))]))
            .await?;
        Ok(user)
    }

    pub async fn delete(&self, user_id: &str) -> Result<()> {
        self.repo.delete(user_id).await
    }
}
