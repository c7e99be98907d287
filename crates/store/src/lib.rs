//! Storage layer for the inline projection engine.
//!
//! Events and materialized documents live side by side so that an append and
//! every document write it causes can be committed as one unit:
//! - [`EventStore`] and [`DocumentStore`] are the read/write contracts
//! - [`ChangeSet`] stages appends and document mutations ([`UnitOfWork`])
//! - [`CommitStore`] commits a change set atomically
//! - [`EventDecoder`] maps stored type tags back to typed payloads

pub mod change_set;
pub mod decoder;
pub mod document;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use change_set::{ChangeSet, CommitReceipt, StreamAppend, UnitOfWork};
pub use common::StreamId;
pub use decoder::{DecodeError, DecodedEvent, EventDecoder};
pub use document::{Document, DocumentKey, DocumentMutation, StoredDocument};
pub use error::{Result, StoreError};
pub use event::{Event, EventEnvelope, EventEnvelopeBuilder, EventId, NewEvent, Version};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AppendOptions, CommitStore, DocumentStore, DocumentStoreExt, EventStore, EventStoreExt,
    EventStream,
};
