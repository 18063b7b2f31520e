//! # Unicontact
//!
//! Identity consolidation for partial contact records. Every observed
//! `(email, phone)` pair is folded into a cluster with exactly one primary
//! contact, the oldest, and every other member linked directly to it.
//!
//! The identify pipeline runs against a non-transactional [`ContactStore`]:
//! candidate lookup, root resolution, cluster materialization, observation
//! classification, cluster repair and summary. Concurrent first sightings
//! and merges are serialized in-process by key locks and bounded by a
//! per-request deadline.

pub mod audit;
pub mod classify;
pub mod config;
pub mod deadline;
pub mod dsu;
pub mod error;
pub mod identify;
pub mod locks;
pub mod model;
pub mod persistence;
pub mod repair;
pub mod request;
pub mod resolve;
pub mod server;
pub mod store;
pub mod summary;
pub mod test_support;

pub use config::{ContactsConfig, IdentifyTuning};
pub use error::{IdentifyError, Stage};
pub use identify::Identifier;
pub use model::{
    Contact, ContactId, ContactSummary, IdentifyResponse, LinkPrecedence, NewContact, Observation,
};
pub use persistence::{PersistentContactStore, PersistentOpenOptions};
pub use request::IdentifyRequest;
pub use store::{ContactStore, MemoryContactStore};
