//! Catalog synchronization layer: primary store, versioned cache, search
//! index and event publishing, kept consistent per tenant.
//!
//! Writes go through [`WriteCoordinator`]; reads through [`ReadPath`].
//! [`SyncEngine`] wires both from a set of [`Backends`].

pub mod cache;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod lanes;
pub mod publishing;
pub mod read_path;
pub mod retry;
pub mod search;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use capability::{CommittedChange, Invalidatable, PublishOutcome, Publishable, Upsertable};
pub use config::{DispatchMode, SyncConfig};
pub use coordinator::{ReplayReport, WriteContext, WriteCoordinator};
pub use engine::{Backends, InMemoryBackends, SyncEngine};
pub use error::{CatalogError, SyncError};
pub use read_path::ReadPath;
pub use retry::RetryPolicy;
