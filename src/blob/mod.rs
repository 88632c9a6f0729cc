//! Blob service, multipart coordinator and the payload types they share

pub mod compressed;
pub mod multipart;
pub mod payload;
pub mod service;

pub use multipart::{MultipartCoordinator, MultipartPartDescription, MultipartUpload, VerifiedUpload};
pub use payload::{BlobContents, BlobPayload, ByteStream};
pub use service::{BlobService, BlobServiceBuilder, ExistsOptions, GetOptions, PutOptions};
