//! User read models.
//!
//! A user is stored as exactly one of two document kinds, depending on where
//! they are in the lifecycle. Both share the id of the user's stream.

use chrono::{DateTime, Utc};
use common::StreamId;
use serde::{Deserialize, Serialize};
use store::{Document, StoredDocument};

/// A user who has been invited but has not accepted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitedUser {
    pub id: StreamId,
    pub email: String,
    pub name: String,
    pub invited_on: DateTime<Utc>,
}

impl Document for InvitedUser {
    const DOCUMENT_TYPE: &'static str = "InvitedUser";
}

/// A user who accepted their invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub id: StreamId,
    pub email: String,
    pub name: String,
    pub activated_on: DateTime<Utc>,
}

impl Document for ActiveUser {
    const DOCUMENT_TYPE: &'static str = "ActiveUser";
}

/// Any user, whatever their lifecycle stage.
#[derive(Debug, Clone, PartialEq)]
pub enum User {
    Invited(InvitedUser),
    Active(ActiveUser),
}

impl User {
    /// Reads a stored document as a user.
    ///
    /// Returns None for documents that are not user documents.
    pub fn from_stored(document: StoredDocument) -> Result<Option<Self>, serde_json::Error> {
        if document.is::<InvitedUser>() {
            Ok(Some(User::Invited(document.into_document()?)))
        } else if document.is::<ActiveUser>() {
            Ok(Some(User::Active(document.into_document()?)))
        } else {
            Ok(None)
        }
    }

    pub fn id(&self) -> StreamId {
        match self {
            User::Invited(user) => user.id,
            User::Active(user) => user.id,
        }
    }

    pub fn email(&self) -> &str {
        match self {
            User::Invited(user) => &user.email,
            User::Active(user) => &user.email,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            User::Invited(user) => &user.name,
            User::Active(user) => &user.name,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, User::Active(_))
    }
}

#[cfg(test)]
mod tests {
    use store::Version;

    use super::*;

    #[test]
    fn reads_either_kind() {
        let id = StreamId::new();
        let invited = InvitedUser {
            id,
            email: "jane@acme.inc".to_string(),
            name: "Jane".to_string(),
            invited_on: Utc::now(),
        };
        let stored = StoredDocument::from_document(id, Version::first(), &invited).unwrap();

        let user = User::from_stored(stored).unwrap().unwrap();
        assert_eq!(user, User::Invited(invited));
        assert_eq!(user.name(), "Jane");
        assert!(!user.is_active());
    }

    #[test]
    fn ignores_other_documents() {
        let stored = StoredDocument::new(
            "Invoice",
            StreamId::new(),
            Version::first(),
            serde_json::json!({}),
        );
        assert!(User::from_stored(stored).unwrap().is_none());
    }
}
