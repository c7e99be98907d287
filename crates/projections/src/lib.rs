//! Inline projections: documents kept in step with their event stream.
//!
//! Events appended through a [`DocumentSession`] are folded into read-model
//! documents in the same commit:
//! - [`ProjectionDefinition`] declares which events create, update or delete a document type
//! - [`ProjectionRegistry`] holds one projection per document type
//! - [`AggregationEngine`] folds a batch of one stream's events into net document mutations
//! - [`DocumentSession`] stages appends and commits events and documents atomically
//! - [`rebuild_all`] replays the whole log to recompute every document

pub mod definition;
pub mod engine;
pub mod error;
pub mod rebuild;
pub mod registry;
pub mod session;

pub use definition::{
    EventContext, HandlerKind, MissingDocumentPolicy, Projection, ProjectionDefinition,
};
pub use engine::AggregationEngine;
pub use error::{FoldError, ProjectionError, Result};
pub use rebuild::{RebuildReport, rebuild_all};
pub use registry::ProjectionRegistry;
pub use session::{DocumentSession, SessionFactory};
