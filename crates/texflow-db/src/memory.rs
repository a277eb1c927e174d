//! In-process document store.
//!
//! Holds every collection behind one `RwLock`, which serializes writes per
//! document trivially. Scan order is insertion order.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use texflow_core::ids::record_id;
use texflow_core::{
    merge_patch, Collection, Document, DocumentStore, Error, Result, StoredDocument,
};

/// Document store kept in memory; contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, Vec<StoredDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection.
    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn scan(&self, collection: Collection) -> Result<Vec<StoredDocument>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .map(|d| d.body.clone()))
    }

    async fn insert(&self, collection: Collection, document: Document) -> Result<String> {
        let id = record_id();
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .push(StoredDocument {
                id: id.clone(),
                body: document,
            });
        Ok(id)
    }

    async fn insert_with_id(
        &self,
        collection: Collection,
        id: &str,
        document: Document,
    ) -> Result<()> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection).or_default();
        if docs.iter().any(|d| d.id == id) {
            return Err(Error::InvalidInput(format!(
                "{} document with id {} already exists",
                collection, id
            )));
        }
        docs.push(StoredDocument {
            id: id.to_string(),
            body: document,
        });
        Ok(())
    }

    async fn update(&self, collection: Collection, id: &str, patch: Document) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(doc) = collections
            .get_mut(&collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
        else {
            return Ok(false);
        };
        merge_patch(&mut doc.body, patch);
        Ok(true)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        let before = docs.len();
        docs.retain(|d| d.id != id);
        Ok(docs.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_scan_preserves_insertion_order() {
        let store = MemoryStore::new();
        let a = store.insert(Collection::Tasks, doc(json!({"n": 1}))).await.unwrap();
        let b = store.insert(Collection::Tasks, doc(json!({"n": 2}))).await.unwrap();
        let c = store.insert(Collection::Tasks, doc(json!({"n": 3}))).await.unwrap();

        let ids: Vec<String> = store
            .scan(Collection::Tasks)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![a, b, c]);
        assert!(store.scan(Collection::Users).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_and_removes_nulls() {
        let store = MemoryStore::new();
        let id = store
            .insert(Collection::Tasks, doc(json!({"status": "new", "tmp": "/x"})))
            .await
            .unwrap();

        let updated = store
            .update(Collection::Tasks, &id, doc(json!({"status": "compiling", "tmp": null})))
            .await
            .unwrap();
        assert!(updated);

        let body = store.get(Collection::Tasks, &id).await.unwrap().unwrap();
        assert_eq!(body["status"], "compiling");
        assert!(!body.contains_key("tmp"));
    }

    #[tokio::test]
    async fn test_missing_documents() {
        let store = MemoryStore::new();
        assert!(store.get(Collection::Pdfs, "nope").await.unwrap().is_none());
        assert!(!store
            .update(Collection::Pdfs, "nope", Document::new())
            .await
            .unwrap());
        assert!(!store.delete(Collection::Pdfs, "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_with_id_rejects_duplicates() {
        let store = MemoryStore::new();
        store
            .insert_with_id(Collection::Images, "img1", Document::new())
            .await
            .unwrap();
        let dup = store
            .insert_with_id(Collection::Images, "img1", Document::new())
            .await;
        assert!(matches!(dup, Err(Error::InvalidInput(_))));
        assert_eq!(store.len(Collection::Images).await, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_document() {
        let store = MemoryStore::new();
        let id = store.insert(Collection::Users, Document::new()).await.unwrap();
        assert!(store.delete(Collection::Users, &id).await.unwrap());
        assert_eq!(store.len(Collection::Users).await, 0);
    }
}
