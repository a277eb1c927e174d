//! Record schemas stored in the document store.
//!
//! Every record kind has an explicit schema. Documents are validated when
//! they cross the store boundary: a document that does not deserialize into
//! its record type is rejected instead of being trusted.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

/// An untyped document as held by the store.
pub type Document = serde_json::Map<String, JsonValue>;

/// Substitution arguments (string keys to string or structured values).
pub type Arguments = serde_json::Map<String, JsonValue>;

// =============================================================================
// COLLECTIONS
// =============================================================================

/// Named collections in the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Tasks,
    Users,
    Pdfs,
    Images,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Users => "users",
            Collection::Pdfs => "pdfs",
            Collection::Images => "images",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document together with its store id, as returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub body: Document,
}

/// A typed record that lives in one collection.
///
/// The id is held by the store, not inside the document body, so record
/// types skip it during (de)serialization and receive it through
/// [`Record::from_document`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// Collection holding records of this kind.
    const COLLECTION: Collection;

    /// Record id (empty until stored).
    fn id(&self) -> &str;

    /// Attach the store id.
    fn set_id(&mut self, id: String);

    /// Serialize into a document body (without the id).
    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            JsonValue::Object(map) => Ok(map),
            other => Err(Error::Serialization(format!(
                "{} record serialized to non-object: {}",
                Self::COLLECTION,
                other
            ))),
        }
    }

    /// Validate a document body against the schema and attach its id.
    fn from_document(id: impl Into<String>, document: Document) -> Result<Self> {
        let id = id.into();
        let mut record: Self =
            serde_json::from_value(JsonValue::Object(document)).map_err(|e| {
                Error::Serialization(format!("invalid {} document {}: {}", Self::COLLECTION, id, e))
            })?;
        record.set_id(id);
        Ok(record)
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// Lifecycle state of a compile task.
///
/// Transitions only move forward: `new -> compiling -> {finished, failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    New,
    Compiling,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Compiling => "compiling",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::New, TaskStatus::Compiling)
                | (TaskStatus::Compiling, TaskStatus::Finished)
                | (TaskStatus::Compiling, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(TaskStatus::New),
            "compiling" => Ok(TaskStatus::Compiling),
            "finished" => Ok(TaskStatus::Finished),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown task status: {}", other))),
        }
    }
}

/// A compile request and its progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(skip)]
    pub task_id: String,
    pub user_id: String,
    #[serde(default)]
    pub document_id: String,
    pub template: String,
    /// Global substitution arguments.
    #[serde(default)]
    pub args: Arguments,
    /// Overlay arguments, applied after `args` and winning on collision.
    #[serde(default)]
    pub part_args: Arguments,
    #[serde(default)]
    pub body: String,
    /// Image references, each `<image_id>.<extension>`.
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Token written by the lease that moved the task to `compiling`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a `new` task as the API layer would.
    pub fn new(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        template: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: document_id.into(),
            template: template.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Arguments) -> Self {
        self.args = args;
        self
    }

    pub fn with_part_args(mut self, part_args: Arguments) -> Self {
        self.part_args = part_args;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Check the status/artifact invariants.
    pub fn validate(&self) -> Result<()> {
        match (self.status, self.pdf_id.as_deref()) {
            (TaskStatus::Finished, None) | (TaskStatus::Finished, Some("")) => Err(
                Error::InvalidInput(format!("finished task {} has no pdf id", self.task_id)),
            ),
            (TaskStatus::Failed, Some(_)) => Err(Error::InvalidInput(format!(
                "failed task {} carries a pdf id",
                self.task_id
            ))),
            _ => Ok(()),
        }
    }
}

impl Record for Task {
    const COLLECTION: Collection = Collection::Tasks;

    fn id(&self) -> &str {
        &self.task_id
    }

    fn set_id(&mut self, id: String) {
        self.task_id = id;
    }
}

// =============================================================================
// IMAGES
// =============================================================================

/// A parsed image reference (`<image_id>.<extension>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub image_id: String,
    pub extension: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        match reference.split_once('.') {
            Some((id, ext))
                if !id.is_empty()
                    && !ext.is_empty()
                    && !ext.contains('.')
                    && !reference.contains(['/', '\\']) =>
            {
                Ok(Self {
                    image_id: id.to_string(),
                    extension: ext.to_string(),
                })
            }
            _ => Err(Error::InvalidInput(format!(
                "image reference must be <id>.<ext>: {}",
                reference
            ))),
        }
    }

    /// File name the image is staged under.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.image_id, self.extension)
    }
}

/// An uploaded image owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(skip)]
    pub image_id: String,
    pub user_id: String,
    pub uploaded_time: DateTime<Utc>,
    /// Base64-encoded payload.
    pub content: String,
}

impl Image {
    pub fn new(image_id: impl Into<String>, user_id: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            image_id: image_id.into(),
            user_id: user_id.into(),
            uploaded_time: Utc::now(),
            content: BASE64.encode(bytes),
        }
    }

    /// Decode the stored payload.
    pub fn decode_content(&self) -> Result<Vec<u8>> {
        BASE64.decode(self.content.as_bytes()).map_err(|e| {
            Error::Serialization(format!("image {} payload is not base64: {}", self.image_id, e))
        })
    }
}

impl Record for Image {
    const COLLECTION: Collection = Collection::Images;

    fn id(&self) -> &str {
        &self.image_id
    }

    fn set_id(&mut self, id: String) {
        self.image_id = id;
    }
}

// =============================================================================
// PDFS
// =============================================================================

/// A compiled artifact. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pdf {
    #[serde(skip)]
    pub pdf_id: String,
    pub compiled_time: DateTime<Utc>,
    /// Base64-encoded payload.
    pub data: String,
}

impl Pdf {
    pub fn new(bytes: &[u8], compiled_time: DateTime<Utc>) -> Self {
        Self {
            pdf_id: String::new(),
            compiled_time,
            data: BASE64.encode(bytes),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>> {
        BASE64.decode(self.data.as_bytes()).map_err(|e| {
            Error::Serialization(format!("pdf {} payload is not base64: {}", self.pdf_id, e))
        })
    }
}

impl Record for Pdf {
    const COLLECTION: Collection = Collection::Pdfs;

    fn id(&self) -> &str {
        &self.pdf_id
    }

    fn set_id(&mut self, id: String) {
        self.pdf_id = id;
    }
}

// =============================================================================
// USERS
// =============================================================================

/// A user and the artifacts produced for them, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub user_id: String,
    #[serde(default)]
    pub compiled_pdfs: Vec<String>,
}

impl Record for User {
    const COLLECTION: Collection = Collection::Users;

    fn id(&self) -> &str {
        &self.user_id
    }

    fn set_id(&mut self, id: String) {
        self.user_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_status_forward_transitions() {
        use TaskStatus::*;
        assert!(New.can_transition_to(Compiling));
        assert!(Compiling.can_transition_to(Finished));
        assert!(Compiling.can_transition_to(Failed));

        assert!(!Compiling.can_transition_to(New));
        assert!(!Finished.can_transition_to(Compiling));
        assert!(!Failed.can_transition_to(Finished));
        assert!(!New.can_transition_to(Finished));
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            TaskStatus::New,
            TaskStatus::Compiling,
            TaskStatus::Finished,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_from_document_attaches_id() {
        let task = Task::from_document(
            "t1",
            doc(json!({
                "user_id": "u1",
                "document_id": "d1",
                "template": "article",
                "body": "Hello",
                "status": "new",
                "args": {"title": "A"},
            })),
        )
        .unwrap();

        assert_eq!(task.task_id, "t1");
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.args["title"], "A");
        assert!(task.part_args.is_empty());
        assert!(task.images.is_empty());
    }

    #[test]
    fn test_task_document_has_no_id_or_empty_optionals() {
        let mut task = Task::new("u1", "d1", "article", "body");
        task.task_id = "t1".into();
        let document = task.to_document().unwrap();

        assert!(!document.contains_key("task_id"));
        assert!(!document.contains_key("pdf_id"));
        assert!(!document.contains_key("lease_id"));
        assert_eq!(document["status"], "new");
    }

    #[test]
    fn test_task_rejects_unknown_status() {
        let result = Task::from_document(
            "t1",
            doc(json!({"user_id": "u1", "template": "article", "status": "paused"})),
        );
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_task_validate_invariants() {
        let mut task = Task::new("u1", "d1", "article", "");
        task.status = TaskStatus::Finished;
        assert!(task.validate().is_err());

        task.pdf_id = Some("p1".into());
        assert!(task.validate().is_ok());

        task.status = TaskStatus::Failed;
        assert!(task.validate().is_err());

        task.pdf_id = None;
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_image_ref_parse() {
        let r = ImageRef::parse("abc123.png").unwrap();
        assert_eq!(r.image_id, "abc123");
        assert_eq!(r.extension, "png");
        assert_eq!(r.file_name(), "abc123.png");

        assert!(ImageRef::parse("noext").is_err());
        assert!(ImageRef::parse(".png").is_err());
        assert!(ImageRef::parse("a.b.c").is_err());
        assert!(ImageRef::parse("dir/abc.png").is_err());
    }

    #[test]
    fn test_image_payload_decodes() {
        let image = Image::new("i1", "u1", b"\x89PNG");
        assert_eq!(image.decode_content().unwrap(), b"\x89PNG");

        let broken = Image {
            content: "***".into(),
            ..image
        };
        assert!(broken.decode_content().is_err());
    }

    #[test]
    fn test_pdf_payload_round_trip() {
        let pdf = Pdf::new(b"%PDF-1.5", Utc::now());
        assert_eq!(pdf.decode_data().unwrap(), b"%PDF-1.5");
    }

    #[test]
    fn test_user_defaults_to_empty_pdf_list() {
        let user = User::from_document("u1", Document::new()).unwrap();
        assert_eq!(user.user_id, "u1");
        assert!(user.compiled_pdfs.is_empty());
    }
}
