//! Catalog domain module.
//!
//! This crate contains the business rules for products and categories,
//! implemented purely as deterministic domain logic (no IO, no storage):
//! entity lifecycle and optimistic-concurrency guards, payload validation and
//! patching, list filters, search queries and the search projection.

pub mod document;
pub mod entity;
pub mod filter;
pub mod payload;
pub mod query;

mod digest;

pub use document::SearchDocument;
pub use entity::{CatalogEntity, EntityState, NewEntity};
pub use filter::ListFilter;
pub use payload::{CategoryPayload, ProductPayload};
pub use query::SearchQuery;
