//! # texflow-db
//!
//! Document store layer for texflow.
//!
//! This crate provides:
//! - `MemoryStore`, an in-process store for tests and single-node development
//! - `PgDocumentStore`, a PostgreSQL JSONB-backed store
//! - Typed record repositories for tasks, users, pdfs and images
//!
//! ## Example
//!
//! ```rust,ignore
//! use texflow_db::{ConnectOptions, Records, Task};
//!
//! let records = Records::connect(
//!     "postgres://localhost/texflow",
//!     ConnectOptions::for_workers(4),
//! )
//! .await?;
//! let user = records.users.create().await?;
//! let task = records
//!     .tasks
//!     .create(Task::new(&user.user_id, "doc-1", "article", "Hello"))
//!     .await?;
//! ```

pub mod connect;
pub mod images;
pub mod memory;
pub mod pdfs;
pub mod postgres;
pub mod repository;
pub mod tasks;
pub mod users;

use std::sync::Arc;

// Re-export core types
pub use texflow_core::*;

pub use images::ImageRecords;
pub use memory::MemoryStore;
pub use pdfs::PdfRecords;
pub use connect::{connect, ConnectOptions};
pub use postgres::PgDocumentStore;
pub use repository::Repository;
pub use tasks::TaskRecords;
pub use users::UserRecords;

/// Explicitly constructed handle over one store, shared by the scheduler,
/// the worker pools and the result publisher.
#[derive(Clone)]
pub struct Records {
    /// The underlying document store.
    pub store: Arc<dyn DocumentStore>,
    /// Compile task records.
    pub tasks: TaskRecords,
    /// User records.
    pub users: UserRecords,
    /// Compiled artifact records.
    pub pdfs: PdfRecords,
    /// Uploaded image records.
    pub images: ImageRecords,
}

impl Records {
    /// Build repositories over an existing store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            tasks: TaskRecords::new(store.clone()),
            users: UserRecords::new(store.clone()),
            pdfs: PdfRecords::new(store.clone()),
            images: ImageRecords::new(store.clone()),
            store,
        }
    }

    /// Repositories over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Repositories over a PostgreSQL store.
    pub async fn connect(database_url: &str, options: ConnectOptions) -> Result<Self> {
        let pool = connect(database_url, options).await?;
        Ok(Self::new(Arc::new(PgDocumentStore::new(pool))))
    }
}
