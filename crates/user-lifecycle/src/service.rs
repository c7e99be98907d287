//! Commands and queries over the user lifecycle.

use chrono::Utc;
use common::StreamId;
use projections::{RebuildReport, SessionFactory, rebuild_all};
use store::{CommitStore, EventStore, Version};

use crate::documents::{ActiveUser, InvitedUser, User};
use crate::error::AppError;
use crate::events::{InvitationAccepted, UserInvited, UserRenamed};

/// Appends lifecycle events and reads the projected user documents.
pub struct UserService<S: CommitStore> {
    sessions: SessionFactory<S>,
}

impl<S: CommitStore> UserService<S> {
    pub fn new(sessions: SessionFactory<S>) -> Self {
        Self { sessions }
    }

    /// Invites a user and returns the id of their new stream.
    #[tracing::instrument(skip(self, email, name))]
    pub async fn invite(
        &self,
        email: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<StreamId, AppError> {
        let invited = UserInvited::new(email, name);
        let id = invited.id;

        let mut session = self.sessions.open_session();
        session.start_stream(id, &invited)?;
        session.commit().await?;

        tracing::info!(%id, "user invited");
        Ok(id)
    }

    /// Accepts a pending invitation.
    ///
    /// Fails with [`AppError::UserNotFound`] if `id` has no pending invitation,
    /// and with a concurrency conflict if the stream moves before the
    /// acceptance is committed.
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self, id: StreamId) -> Result<(), AppError> {
        // Read the version first so the append rejects anything written after
        // the invitation was loaded.
        let expected = self.current_version(id).await?;
        let mut session = self.sessions.open_session();
        let invited = session
            .load::<InvitedUser>(id)
            .await?
            .ok_or(AppError::UserNotFound(id))?;

        let accepted = InvitationAccepted {
            id,
            email: invited.email,
            name: invited.name,
            accepted_on: Utc::now(),
        };
        session.append_expected(id, expected, &accepted)?;
        session.commit().await?;

        tracing::info!(%id, "invitation accepted");
        Ok(())
    }

    /// Renames a user in whatever stage they are.
    #[tracing::instrument(skip(self, name))]
    pub async fn rename(&self, id: StreamId, name: impl Into<String>) -> Result<(), AppError> {
        let expected = self.current_version(id).await?;
        if expected == Version::initial() {
            return Err(AppError::UserNotFound(id));
        }

        let mut session = self.sessions.open_session();
        session.append_expected(id, expected, &UserRenamed { name: name.into() })?;
        session.commit().await?;
        Ok(())
    }

    /// Loads the user, as whichever document kind currently exists.
    pub async fn user(&self, id: StreamId) -> Result<Option<User>, AppError> {
        let session = self.sessions.open_session();
        for document in session.load_all(id).await? {
            if let Some(user) = User::from_stored(document)? {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    pub async fn invited_user(&self, id: StreamId) -> Result<Option<InvitedUser>, AppError> {
        Ok(self.sessions.open_session().load::<InvitedUser>(id).await?)
    }

    pub async fn active_user(&self, id: StreamId) -> Result<Option<ActiveUser>, AppError> {
        Ok(self.sessions.open_session().load::<ActiveUser>(id).await?)
    }

    /// Recomputes every user document from the event log.
    pub async fn rebuild(&self) -> Result<RebuildReport, AppError> {
        Ok(rebuild_all(self.sessions.store(), self.sessions.engine()).await?)
    }

    async fn current_version(&self, id: StreamId) -> Result<Version, AppError> {
        Ok(self
            .sessions
            .store()
            .stream_version(id)
            .await?
            .unwrap_or_else(Version::initial))
    }
}
