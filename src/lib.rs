//! notegraph LSP - bidirectional sync between plain files and a graph database
//!
//! This library provides the core functionality for the notegraph LSP server:
//! extraction (file text to entities), entity resolution (entities to graph
//! uids), diffing (resolved entities to minimal changesets), and the editor
//! features served from the same per-document context the sync path uses.

// Core modules
pub mod error;
pub mod fields;
pub mod schema;
pub mod store;
pub mod interpolate;
pub mod navigation;
pub mod parser;
pub mod template;
pub mod extract;
pub mod mapping;
pub mod diff;
pub mod cache;
pub mod workspace;
pub mod context;
pub mod features;
pub mod sync;

// Re-export commonly used types
pub use context::{build_document_context, DocumentContext};
pub use error::{CoreError, CoreResult};
pub use fields::{FieldSet, FieldValue};
pub use store::{Changeset, Entity, GraphStore, InMemoryGraph, Transaction};
pub use sync::{sync_document, SyncReport};
pub use workspace::{find_root, Workspace};
