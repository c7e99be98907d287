//! User invitation lifecycle on top of inline projections.
//!
//! Each user has one event stream. Two inline projections keep the user's
//! read model in step with it: an [`InvitedUser`] while the invitation is
//! pending, replaced by an [`ActiveUser`] once it is accepted.

pub mod config;
pub mod documents;
pub mod error;
pub mod events;
pub mod service;
pub mod telemetry;
pub mod user_projections;

pub use config::{Config, LogFormat, StoreBackend};
pub use documents::{ActiveUser, InvitedUser, User};
pub use error::AppError;
pub use events::{InvitationAccepted, UserInvited, UserRenamed};
pub use service::UserService;
pub use user_projections::{active_user_projection, invited_user_projection, registry};
