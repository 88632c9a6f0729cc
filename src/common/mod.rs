//! Common utilities and types shared across the blob subsystem

pub mod config;
pub mod error;
pub mod hash;
pub mod types;
pub mod utils;

pub use config::{Config, StoreConfig, DEFAULT_STORAGE_POOL};
pub use error::{Error, ReplicationFailure, Result};
pub use hash::{blob_prefix, content_hash, ContentHasher};
pub use types::{BlobId, BlobReference, BucketId, ContentId, NamespaceId, RefId};
pub use utils::{encode_segment, format_bytes, parse_duration, retry_with_backoff};
