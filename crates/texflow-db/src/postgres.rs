//! PostgreSQL implementation of the document store.
//!
//! All collections share one `documents` table keyed by `(collection, id)`
//! with a JSONB body. `seq` gives the natural scan order.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use texflow_core::ids::record_id;
use texflow_core::{Collection, Document, DocumentStore, Error, Result, StoredDocument};

/// PostgreSQL JSONB-backed [`DocumentStore`].
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Pool<Postgres>,
}

impl PgDocumentStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("migration failed: {}", e)))?;
        Ok(())
    }

    fn into_document(collection: Collection, id: &str, body: JsonValue) -> Result<Document> {
        match body {
            JsonValue::Object(map) => Ok(map),
            other => Err(Error::Store(format!(
                "{} document {} has non-object body: {}",
                collection, id, other
            ))),
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn scan(&self, collection: Collection) -> Result<Vec<StoredDocument>> {
        let rows = sqlx::query("SELECT id, body FROM documents WHERE collection = $1 ORDER BY seq")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        debug!(
            subsystem = "store",
            component = "postgres",
            op = "scan",
            collection = %collection,
            result_count = rows.len(),
            "Scanned collection"
        );

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let body = Self::into_document(collection, &id, row.get("body"))?;
                Ok(StoredDocument { id, body })
            })
            .collect()
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let body: Option<JsonValue> =
            sqlx::query_scalar("SELECT body FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        body.map(|b| Self::into_document(collection, id, b))
            .transpose()
    }

    async fn insert(&self, collection: Collection, document: Document) -> Result<String> {
        let id = record_id();
        sqlx::query("INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3)")
            .bind(collection.as_str())
            .bind(&id)
            .bind(JsonValue::Object(document))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    async fn insert_with_id(
        &self,
        collection: Collection,
        id: &str,
        document: Document,
    ) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3)
             ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(JsonValue::Object(document))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidInput(format!(
                "{} document with id {} already exists",
                collection, id
            )));
        }
        Ok(())
    }

    async fn update(&self, collection: Collection, id: &str, patch: Document) -> Result<bool> {
        // Shallow merge, then drop every key the patch set to JSON null.
        let result = sqlx::query(
            "UPDATE documents
             SET body = (body || $3::jsonb)
                        - ARRAY(SELECT key FROM jsonb_each($3::jsonb) WHERE value = 'null'::jsonb),
                 updated_at = NOW()
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(JsonValue::Object(patch))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
