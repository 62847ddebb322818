//! Error types for the state store.

use std::fmt;
use thiserror::Error;

/// Why a path token failed to resolve against a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraverseResult {
    /// The hop names something that is absent right now (unset optional,
    /// missing map key, or a hop through a primitive).
    NonExistentNode,
    InvalidArrayIndex,
    InvalidMapKey,
    InvalidStructMember,
    InvalidVariantMember,
    /// The variant member exists in the schema but is not the active case.
    IncorrectVariantMember,
    InvalidSetMember,
}

impl fmt::Display for TraverseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TraverseResult::NonExistentNode => "non-existent node",
            TraverseResult::InvalidArrayIndex => "invalid array index",
            TraverseResult::InvalidMapKey => "invalid map key",
            TraverseResult::InvalidStructMember => "invalid struct member",
            TraverseResult::InvalidVariantMember => "invalid variant member",
            TraverseResult::IncorrectVariantMember => "incorrect variant member",
            TraverseResult::InvalidSetMember => "invalid set member",
        };
        f.write_str(s)
    }
}

/// Main error type for store operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("Invalid path /{path}: {reason}")]
    InvalidPath { path: String, reason: TraverseResult },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("Publisher {publisher} may not publish to /{path}")]
    PublisherNotPermitted { publisher: String, path: String },

    #[error("Subscriber {0} may not use extended subscriptions")]
    SubscriptionNotPermitted(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("Unknown publisher: {0}")]
    UnknownPublisher(String),

    #[error("Invalid regex {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("Update manager stopped")]
    Stopped,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Build an `InvalidPath` error for the first `depth + 1` tokens of `path`.
    pub fn invalid_path<S: AsRef<str>>(path: &[S], depth: usize, reason: TraverseResult) -> Self {
        let end = (depth + 1).min(path.len());
        StoreError::InvalidPath {
            path: join_path(&path[..end]),
            reason,
        }
    }
}

/// Render a path as `a/b/c`.
pub fn join_path<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
