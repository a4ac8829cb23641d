//! Error taxonomy of the synchronization layer.
//!
//! ```text
//! request path:  DomainError / StoreError ──► CatalogError (returned to caller)
//! post-commit:   CacheError / SearchError / TransportError / OutboxError ──► SyncError
//!                (logged, retried, dead-lettered; never returned to the writer)
//! ```

use std::time::Duration;

use thiserror::Error;

use marketplace_core::DomainError;
use marketplace_events::TransportError;

use crate::cache::CacheError;
use crate::publishing::OutboxError;
use crate::search::SearchError;
use crate::store::StoreError;

/// Errors surfaced by the write coordinator and the read path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// Bad input (payload, patch, filter, missing tenant context).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing, soft-deleted, or owned by another tenant.
    #[error("not found")]
    NotFound,

    /// `expected_version` did not match the stored version. Nothing was written.
    #[error("version conflict: {0}")]
    Conflict(String),

    /// The primary store failed. Nothing was committed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CatalogError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CatalogError::Conflict(_))
    }
}

impl From<DomainError> for CatalogError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg)
            | DomainError::InvariantViolation(msg)
            | DomainError::InvalidId(msg) => CatalogError::Validation(msg),
            DomainError::NotFound => CatalogError::NotFound,
            DomainError::Conflict(msg) => CatalogError::Conflict(msg),
        }
    }
}

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => CatalogError::NotFound,
            StoreError::Conflict { expected, actual } => CatalogError::Conflict(format!(
                "expected version {expected}, found {actual}"
            )),
            StoreError::Backend(msg) => CatalogError::Storage(msg),
        }
    }
}

/// A failed post-commit side effect.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("search index: {0}")]
    Search(#[from] SearchError),

    #[error("event transport: {0}")]
    Transport(#[from] TransportError),

    #[error("outbox: {0}")]
    Outbox(#[from] OutboxError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
