//! Error types for the blob subsystem

use crate::common::types::{BlobId, NamespaceId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why an on-demand replication attempt gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFailure {
    /// The index records no region for the blob
    NoRegions,
    /// No peer endpoint is known for any recorded region
    NoPeers,
    /// Every peer answered 404
    NotFoundOnPeers,
    /// A peer answered with an unexpected status
    PeerStatus(u16),
    /// The request to a peer failed before a status was received
    Transport(String),
}

impl std::fmt::Display for ReplicationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationFailure::NoRegions => write!(f, "no regions recorded in the blob index"),
            ReplicationFailure::NoPeers => write!(f, "no peers available for the recorded regions"),
            ReplicationFailure::NotFoundOnPeers => write!(f, "no peer had the blob"),
            ReplicationFailure::PeerStatus(code) => write!(f, "peer answered {}", code),
            ReplicationFailure::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === Lookup Errors ===
    #[error("Blob {id} not found in namespace {namespace}")]
    BlobNotFound { namespace: NamespaceId, id: BlobId },

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(NamespaceId),

    // === Content Errors ===
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: BlobId, actual: BlobId },

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Replication Errors ===
    #[error("Replication of {id} in {namespace} failed: {reason}")]
    BlobReplication {
        namespace: NamespaceId,
        id: BlobId,
        reason: ReplicationFailure,
    },

    // === Multipart Errors ===
    #[error("Multipart upload {upload_id} is missing parts: {missing:?}")]
    MissingMultipartParts {
        upload_id: String,
        missing: Vec<String>,
    },

    #[error("No configured store supports multipart uploads")]
    MultipartNotSupported,

    // === Access Errors ===
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Access denied: {0}")]
    Authorization(String),

    // === Backend Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object store error: {0}")]
    ObjectStore(object_store::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn blob_not_found(namespace: &NamespaceId, id: &BlobId) -> Self {
        Error::BlobNotFound {
            namespace: namespace.clone(),
            id: *id,
        }
    }

    pub fn replication(namespace: &NamespaceId, id: &BlobId, reason: ReplicationFailure) -> Self {
        Error::BlobReplication {
            namespace: namespace.clone(),
            id: *id,
            reason,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TooManyRequests(_) | Error::Io(_) | Error::Http(_) => true,
            Error::BlobReplication { reason, .. } => {
                matches!(reason, ReplicationFailure::Transport(_))
            }
            _ => false,
        }
    }

    /// Is this a "does not exist" error that multi-layer iteration may skip?
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BlobNotFound { .. } | Error::NamespaceNotFound(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::BlobNotFound { .. } | Error::NamespaceNotFound(_) => StatusCode::NOT_FOUND,
            Error::HashMismatch { .. } | Error::InvalidId(_) => StatusCode::BAD_REQUEST,
            Error::MissingMultipartParts { .. } => StatusCode::BAD_REQUEST,
            Error::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::BlobReplication { .. } => StatusCode::BAD_GATEWAY,
            Error::MultipartNotSupported => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        // Throttling surfaces as a generic error with a 429/503 in the message.
        let msg = e.to_string();
        if msg.contains("429") || msg.contains("SlowDown") || msg.contains("TooManyRequests") {
            return Error::TooManyRequests(msg);
        }
        Error::ObjectStore(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
