use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{StreamId, Version};

/// A materialized read-model document.
///
/// `DOCUMENT_TYPE` is the stored kind. Documents of different kinds may share
/// an id (the id of the stream they were projected from); the store keys them
/// by `(DOCUMENT_TYPE, id)`.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const DOCUMENT_TYPE: &'static str;
}

/// Storage key of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub document_type: String,
    pub id: StreamId,
}

impl DocumentKey {
    pub fn new(document_type: impl Into<String>, id: StreamId) -> Self {
        Self {
            document_type: document_type.into(),
            id,
        }
    }

    /// Key of the `D` document for `id`.
    pub fn of<D: Document>(id: StreamId) -> Self {
        Self::new(D::DOCUMENT_TYPE, id)
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.document_type, self.id)
    }
}

/// A document as persisted: kind, identity and JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// The stored kind (e.g., "InvitedUser").
    pub document_type: String,

    /// Identity shared with the source stream.
    pub id: StreamId,

    /// The serialized document.
    pub data: serde_json::Value,

    /// Stream version of the last event that touched this document.
    pub version: Version,

    /// When the document was last written.
    pub last_modified: DateTime<Utc>,
}

impl StoredDocument {
    /// Creates a stored document from raw JSON.
    pub fn new(
        document_type: impl Into<String>,
        id: StreamId,
        version: Version,
        data: serde_json::Value,
    ) -> Self {
        Self {
            document_type: document_type.into(),
            id,
            data,
            version,
            last_modified: Utc::now(),
        }
    }

    /// Serializes a typed document.
    pub fn from_document<D: Document>(
        id: StreamId,
        version: Version,
        document: &D,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            D::DOCUMENT_TYPE,
            id,
            version,
            serde_json::to_value(document)?,
        ))
    }

    /// Deserializes the body into a concrete document type.
    pub fn into_document<D: Document>(self) -> Result<D, serde_json::Error> {
        serde_json::from_value(self.data)
    }

    /// Whether this document is of kind `D`.
    pub fn is<D: Document>(&self) -> bool {
        self.document_type == D::DOCUMENT_TYPE
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.document_type.clone(), self.id)
    }
}

/// A staged write against the document store.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentMutation {
    Upsert(StoredDocument),
    Delete(DocumentKey),
}

impl DocumentMutation {
    /// The key this mutation writes to.
    pub fn key(&self) -> DocumentKey {
        match self {
            DocumentMutation::Upsert(document) => document.key(),
            DocumentMutation::Delete(key) => key.clone(),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, DocumentMutation::Delete(_))
    }
}
