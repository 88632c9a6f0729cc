//! # jupiter-blob
//!
//! Hierarchical, content-addressed blob storage for a distributed
//! derived-data cache:
//! - Ordered store layers per storage pool (memory, filesystem, object
//!   storage, relay), read-through and write-through
//! - Content addressing: every blob id is the hash of its bytes
//! - A blob index recording which regions hold each blob
//! - On-demand replication from peer regions on a local miss
//! - Background consistency checks that heal index / store divergence
//! - Multipart uploads verified before they are committed
//!
//! ## Architecture
//!
//! ```text
//!            GET /api/v1/blobs/{ns}/{id}
//!                       │
//!              ┌────────▼─────────┐        ┌──────────────┐
//!              │   BlobService    │───────▶│  Blob Index  │
//!              └──┬──────────┬────┘        └──────────────┘
//!                 │          │ miss
//!   ┌─────────────▼───┐   ┌──▼─────────────────────────────────────┐
//!   │ cache layers    │   │ peer region                            │
//!   │   ...           │   │ GET ...?allowOndemandReplication=false │
//!   │ root layer      │   │                                        │
//!   └─────────────────┘   └────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! jupiter-blob serve --config ./jupiter.toml --bind 0.0.0.0:8080
//! ```

#![allow(clippy::result_large_err)]

pub mod access;
pub mod blob;
pub mod catalog;
pub mod common;
pub mod http;
pub mod index;
pub mod ops;
pub mod policy;
pub mod replication;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use blob::{BlobService, MultipartCoordinator};
pub use common::{BlobId, Config, Error, NamespaceId, Result};
pub use server::{Server, Services};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
