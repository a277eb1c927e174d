//! Generic typed access to one collection.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

use texflow_core::{Document, DocumentStore, Error, Record, Result};

/// Typed find/create/update/delete over the collection of `R`.
///
/// Documents are validated against `R`'s schema on the way out; the
/// repository never hands out a record it could not parse.
pub struct Repository<R: Record> {
    store: Arc<dyn DocumentStore>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for Repository<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> Repository<R> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    /// Every valid record in store order. Invalid documents are logged and skipped.
    pub async fn find_all(&self) -> Result<Vec<R>> {
        let documents = self.store.scan(R::COLLECTION).await?;
        let mut records = Vec::with_capacity(documents.len());
        for doc in documents {
            match R::from_document(doc.id, doc.body) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    subsystem = "store",
                    collection = %R::COLLECTION,
                    error = %e,
                    "Skipping invalid document"
                ),
            }
        }
        Ok(records)
    }

    /// Load a record, failing with `Error::NotFound` when absent.
    pub async fn find(&self, id: &str) -> Result<R> {
        self.find_optional(id).await?.ok_or_else(|| not_found::<R>(id))
    }

    pub async fn find_optional(&self, id: &str) -> Result<Option<R>> {
        if id.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no id provided for {} lookup",
                R::COLLECTION
            )));
        }
        match self.store.get(R::COLLECTION, id).await? {
            Some(document) => Ok(Some(R::from_document(id, document)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.store.get(R::COLLECTION, id).await?.is_some())
    }

    /// Insert under a generated id, which is attached to `record`.
    pub async fn create(&self, record: &mut R) -> Result<String> {
        if !record.id().is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} record already has id {}",
                R::COLLECTION,
                record.id()
            )));
        }
        let id = self.store.insert(R::COLLECTION, record.to_document()?).await?;
        record.set_id(id.clone());
        Ok(id)
    }

    /// Insert under the record's own id.
    pub async fn create_with_id(&self, record: &R) -> Result<()> {
        if record.id().is_empty() {
            return Err(Error::InvalidInput(format!(
                "no id provided for new {} record",
                R::COLLECTION
            )));
        }
        self.store
            .insert_with_id(R::COLLECTION, record.id(), record.to_document()?)
            .await
    }

    /// Apply a partial update (null values remove keys).
    pub async fn update(&self, id: &str, patch: Document) -> Result<()> {
        if self.store.update(R::COLLECTION, id, patch).await? {
            Ok(())
        } else {
            Err(not_found::<R>(id))
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.delete(R::COLLECTION, id).await? {
            Ok(())
        } else {
            Err(not_found::<R>(id))
        }
    }
}

fn not_found<R: Record>(id: &str) -> Error {
    Error::NotFound(format!("no {} document with id {}", R::COLLECTION, id))
}

/// Build a patch document from `(key, value)` pairs.
pub(crate) fn patch<I>(fields: I) -> Document
where
    I: IntoIterator<Item = (&'static str, serde_json::Value)>,
{
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
