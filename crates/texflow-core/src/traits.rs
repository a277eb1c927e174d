//! Core traits for texflow abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Collection, Document, StoredDocument};

// =============================================================================
// DOCUMENT STORE
// =============================================================================

/// Collection-oriented key-value document store with opaque string ids.
///
/// The store is the single source of truth for tasks, users, pdfs and
/// images. Implementations must serialize writes per document; no
/// higher-level transaction is assumed by callers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return every document in the collection in the store's natural order.
    async fn scan(&self, collection: Collection) -> Result<Vec<StoredDocument>>;

    /// Point lookup by id.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// Insert a document under a freshly generated id and return the id.
    async fn insert(&self, collection: Collection, document: Document) -> Result<String>;

    /// Insert a document under a caller-chosen id.
    ///
    /// Fails with `Error::InvalidInput` if the id is already taken.
    async fn insert_with_id(
        &self,
        collection: Collection,
        id: &str,
        document: Document,
    ) -> Result<()>;

    /// Shallow-merge `patch` into an existing document.
    ///
    /// Top-level keys whose value is `null` are removed from the document.
    /// Returns `false` when no document has this id.
    async fn update(&self, collection: Collection, id: &str, patch: Document) -> Result<bool>;

    /// Delete a document. Returns `false` when no document has this id.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;
}

/// Apply the [`DocumentStore::update`] merge rule to an in-memory document.
pub fn merge_patch(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}
