#![forbid(unsafe_code)]
//! Error types for the Riffle engine.
//!
//! Defines `RiffleError` and a `Result<T>` alias used throughout the
//! workspace. Block identifiers are carried as their rendered wire names
//! so this crate stays free of type dependencies.

use thiserror::Error;

/// Why a put could not be accommodated by the memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    /// The pool cannot fit the block even after evicting every
    /// candidate the policy permits.
    InsufficientMemory,
    /// Enough resident bytes exist, but they belong to the requesting
    /// block's own dataset or are pinned by readers.
    EvictionForbidden,
}

impl std::fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionReason::InsufficientMemory => write!(f, "insufficient memory"),
            AdmissionReason::EvictionForbidden => write!(f, "eviction forbidden"),
        }
    }
}

/// Unified error type for Riffle storage operations.
#[derive(Debug, Error)]
pub enum RiffleError {
    #[error("block {block} rejected: {reason}")]
    AdmissionRejected {
        block: String,
        reason: AdmissionReason,
    },

    #[error("block {block} holds a {actual} entry, {expected} was requested")]
    WrongVariant {
        block: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("block {0} already exists")]
    DuplicateBlock(String),

    #[error("block {0} is not registered")]
    UnknownBlock(String),

    #[error("eviction handler re-entered the store on the evicting thread")]
    ReentrantEviction,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A Riffle Result returning `RiffleError`.
pub type Result<T> = std::result::Result<T, RiffleError>;
