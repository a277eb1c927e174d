//! Compiled artifact records.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use texflow_core::{DocumentStore, Pdf, Result};

use crate::repository::Repository;

/// Repository for compiled pdfs. Records are immutable once created.
#[derive(Clone)]
pub struct PdfRecords {
    repo: Repository<Pdf>,
}

impl PdfRecords {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            repo: Repository::new(store),
        }
    }

    /// Store a new artifact and return it with its id.
    pub async fn create(&self, bytes: &[u8], compiled_time: DateTime<Utc>) -> Result<Pdf> {
        let mut pdf = Pdf::new(bytes, compiled_time);
        self.repo.create(&mut pdf).await?;
        Ok(pdf)
    }

    pub async fn get(&self, pdf_id: &str) -> Result<Pdf> {
        self.repo.find(pdf_id).await
    }

    pub async fn delete(&self, pdf_id: &str) -> Result<()> {
        self.repo.delete(pdf_id).await
    }
}
