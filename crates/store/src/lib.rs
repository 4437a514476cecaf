//! Config store: the canonical persisted plugin document.
//!
//! Holds server launch configs, plugin metadata, enablement, and raw per-plugin
//! config text. Every write is whole-document, serialized, and atomic; readers
//! observe committed snapshots through a `watch` channel.

pub mod backend;
pub mod document;
pub mod error;
pub mod import;
pub mod store;

pub use {
    backend::{DocumentBackend, FileBackend, MemoryBackend},
    document::ConfigDocument,
    error::{Result, StoreError},
    import::{ImportDocument, MergeOutcome},
    store::{ConfigStore, StoreEvent},
};
