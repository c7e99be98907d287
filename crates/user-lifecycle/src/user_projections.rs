//! Inline projections maintaining the user documents.

use projections::{MissingDocumentPolicy, ProjectionDefinition, ProjectionRegistry};

use crate::documents::{ActiveUser, InvitedUser};
use crate::events::{InvitationAccepted, UserInvited, UserRenamed};

/// Invited users exist from the invitation until it is accepted.
pub fn invited_user_projection() -> ProjectionDefinition<InvitedUser> {
    ProjectionDefinition::new()
        .create(|e: &UserInvited, _| InvitedUser {
            id: e.id,
            email: e.email.clone(),
            name: e.name.clone(),
            invited_on: e.invited_on,
        })
        .apply(|user, e: &UserRenamed, _| InvitedUser {
            name: e.name.clone(),
            ..user
        })
        .delete_on::<InvitationAccepted>()
        // Renames after acceptance have no invited user to update.
        .on_missing_document(MissingDocumentPolicy::Skip)
}

/// Active users are created on acceptance; no prior invitation is required.
pub fn active_user_projection() -> ProjectionDefinition<ActiveUser> {
    ProjectionDefinition::new()
        .create(|e: &InvitationAccepted, _| ActiveUser {
            id: e.id,
            email: e.email.clone(),
            name: e.name.clone(),
            activated_on: e.accepted_on,
        })
        .apply(|user, e: &UserRenamed, _| ActiveUser {
            name: e.name.clone(),
            ..user
        })
        .on_missing_document(MissingDocumentPolicy::Skip)
}

/// Registry with both user projections.
pub fn registry() -> projections::Result<ProjectionRegistry> {
    let mut registry = ProjectionRegistry::new();
    registry.register(invited_user_projection())?;
    registry.register(active_user_projection())?;
    Ok(registry)
}
