//! User lifecycle events.

use chrono::{DateTime, Utc};
use common::StreamId;
use serde::{Deserialize, Serialize};
use store::Event;

/// A user was invited. Starts the user's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInvited {
    pub id: StreamId,
    pub email: String,
    pub name: String,
    pub invited_on: DateTime<Utc>,
}

impl Event for UserInvited {
    const EVENT_TYPE: &'static str = "UserInvited";
}

/// The invited user accepted and is now active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationAccepted {
    pub id: StreamId,
    pub email: String,
    pub name: String,
    pub accepted_on: DateTime<Utc>,
}

impl Event for InvitationAccepted {
    const EVENT_TYPE: &'static str = "InvitationAccepted";
}

impl InvitationAccepted {
    /// Accepts `invitation` now.
    pub fn of(invitation: &UserInvited) -> Self {
        Self {
            id: invitation.id,
            email: invitation.email.clone(),
            name: invitation.name.clone(),
            accepted_on: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRenamed {
    pub name: String,
}

impl Event for UserRenamed {
    const EVENT_TYPE: &'static str = "UserRenamed";
}

impl UserInvited {
    /// Invites a new user, allocating a fresh stream id.
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: StreamId::new(),
            email: email.into(),
            name: name.into(),
            invited_on: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_copies_the_invitation() {
        let invited = UserInvited::new("jane@acme.inc", "Jane");
        let accepted = InvitationAccepted::of(&invited);

        assert_eq!(accepted.id, invited.id);
        assert_eq!(accepted.email, "jane@acme.inc");
        assert_eq!(accepted.name, "Jane");
        assert!(accepted.accepted_on >= invited.invited_on);
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let invited = UserInvited::new("jane@acme.inc", "Jane");
        let json = serde_json::to_value(&invited).unwrap();

        assert_eq!(json["email"], "jane@acme.inc");
        assert!(json.get("invited_on").is_some());
    }
}
