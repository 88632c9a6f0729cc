//! Multipart uploads
//!
//! Parts go to the multipart-capable layer of the namespace's store stack.
//! Completing assembles them into a temp object named `multipart-<uuid>`;
//! verifying hashes that object and only then renames it to its
//! content-addressed location.

use crate::blob::compressed;
use crate::blob::payload::BlobPayload;
use crate::blob::service::BlobService;
use crate::catalog::ContentIdStore;
use crate::common::{BlobId, ContentHasher, ContentId, Error, NamespaceId, Result};
use crate::store::{MultipartLimits, StorageBackend};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

/// A started upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub blob_name: String,
}

/// Byte range of one part, inclusive on both ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPartDescription {
    pub part_id: String,
    pub first_byte: u64,
    pub last_byte: u64,
}

/// Ids a verified upload was committed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedUpload {
    /// Canonical id the object was renamed to
    pub blob_id: BlobId,
    /// Hash of the decompressed content, for compressed buffers
    pub content_id: Option<ContentId>,
}

pub struct MultipartCoordinator {
    service: Arc<BlobService>,
    content_ids: Arc<dyn ContentIdStore>,
}

impl MultipartCoordinator {
    pub fn new(service: Arc<BlobService>, content_ids: Arc<dyn ContentIdStore>) -> Self {
        Self {
            service,
            content_ids,
        }
    }

    fn multipart_layer(&self, ns: &NamespaceId) -> Result<Arc<StorageBackend>> {
        let (_, stack) = self.service.resolve(ns)?;
        stack
            .multipart_layer()
            .cloned()
            .ok_or(Error::MultipartNotSupported)
    }

    /// Is any layer of the namespace's stack able to take multipart uploads?
    pub fn is_multipart_enabled(&self, ns: &NamespaceId) -> Result<bool> {
        match self.multipart_layer(ns) {
            Ok(_) => Ok(true),
            Err(Error::MultipartNotSupported) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn get_multipart_limits(&self, ns: &NamespaceId) -> Result<MultipartLimits> {
        let layer = self.multipart_layer(ns)?;
        let store = layer.as_multipart().ok_or(Error::MultipartNotSupported)?;
        Ok(store.multipart_limits())
    }

    /// Split `content_length` bytes into parts the store will accept
    pub fn get_multipart_ranges(
        &self,
        ns: &NamespaceId,
        content_length: u64,
    ) -> Result<Vec<MultipartPartDescription>> {
        split_ranges(content_length, &self.get_multipart_limits(ns)?)
    }

    pub async fn start(&self, ns: &NamespaceId) -> Result<MultipartUpload> {
        let layer = self.multipart_layer(ns)?;
        let store = layer.as_multipart().ok_or(Error::MultipartNotSupported)?;
        let blob_name = format!("multipart-{}", uuid::Uuid::new_v4());
        let upload_id = store.start_multipart_upload(ns, &blob_name).await?;
        tracing::debug!(namespace = %ns, %blob_name, %upload_id, layer = layer.name(), "started multipart upload");
        Ok(MultipartUpload {
            upload_id,
            blob_name,
        })
    }

    /// Store one part, returning its etag
    pub async fn put_part(
        &self,
        ns: &NamespaceId,
        upload: &MultipartUpload,
        part_id: &str,
        data: Bytes,
    ) -> Result<String> {
        let layer = self.multipart_layer(ns)?;
        let store = layer.as_multipart().ok_or(Error::MultipartNotSupported)?;
        store
            .put_multipart_part(ns, &upload.blob_name, &upload.upload_id, part_id, data)
            .await
    }

    /// Assemble the parts in `part_ids` order; every one must have been uploaded
    pub async fn complete(
        &self,
        ns: &NamespaceId,
        upload: &MultipartUpload,
        part_ids: &[String],
    ) -> Result<()> {
        let layer = self.multipart_layer(ns)?;
        let store = layer.as_multipart().ok_or(Error::MultipartNotSupported)?;

        let recorded: HashSet<String> = store
            .list_multipart_parts(ns, &upload.blob_name, &upload.upload_id)
            .await?
            .into_iter()
            .map(|p| p.part_id)
            .collect();
        let missing: Vec<String> = part_ids
            .iter()
            .filter(|p| !recorded.contains(*p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingMultipartParts {
                upload_id: upload.upload_id.clone(),
                missing,
            });
        }

        store
            .complete_multipart_upload(ns, &upload.blob_name, &upload.upload_id, part_ids)
            .await?;
        tracing::debug!(namespace = %ns, blob_name = %upload.blob_name, parts = part_ids.len(), "completed multipart upload");
        Ok(())
    }

    /// Hash the assembled object, record it in the index and move it to its
    /// canonical location. A mismatch deletes the temp object.
    ///
    /// For a compressed buffer `declared` is the hash of the decompressed
    /// content and the object is committed under the hash of the buffer.
    pub async fn verify(
        &self,
        ns: &NamespaceId,
        upload: &MultipartUpload,
        declared: &BlobId,
        is_compressed: bool,
    ) -> Result<VerifiedUpload> {
        let (_, stack) = self.service.resolve(ns)?;
        let layer = stack
            .multipart_layer()
            .cloned()
            .ok_or(Error::MultipartNotSupported)?;
        let store = layer.as_multipart().ok_or(Error::MultipartNotSupported)?;
        let contents = store
            .get_multipart_blob(ns, &upload.blob_name)
            .await?
            .ok_or_else(|| Error::blob_not_found(ns, declared))?;

        let verified = if is_compressed {
            let buffer = contents.into_bytes().await?;
            let decoded = match compressed::decode(&buffer) {
                Ok(decoded) => decoded,
                Err(e) => {
                    store.delete_multipart_blob(ns, &upload.blob_name).await?;
                    return Err(e);
                }
            };
            if BlobId::from(decoded.content_id) != *declared {
                store.delete_multipart_blob(ns, &upload.blob_name).await?;
                return Err(Error::HashMismatch {
                    expected: *declared,
                    actual: decoded.content_id.into(),
                });
            }
            let blob_id = BlobId::from_blob(&buffer);
            self.content_ids
                .put(ns, &decoded.content_id, &[blob_id])
                .await?;
            VerifiedUpload {
                blob_id,
                content_id: Some(decoded.content_id),
            }
        } else {
            let mut hasher = ContentHasher::new();
            let mut stream = contents.stream;
            while let Some(chunk) = stream.next().await {
                hasher.update(&chunk?);
            }
            let actual = BlobId::from_hasher(&hasher);
            if actual != *declared {
                store.delete_multipart_blob(ns, &upload.blob_name).await?;
                return Err(Error::HashMismatch {
                    expected: *declared,
                    actual,
                });
            }
            VerifiedUpload {
                blob_id: actual,
                content_id: None,
            }
        };

        // the root is the source of truth; a cache tier holding the upload is not enough
        let root = stack.root();
        if !Arc::ptr_eq(&layer, root) {
            let contents = store
                .get_multipart_blob(ns, &upload.blob_name)
                .await?
                .ok_or_else(|| Error::blob_not_found(ns, &verified.blob_id))?;
            let (payload, _) =
                BlobPayload::buffer(contents.stream, self.service.buffer_limit()).await?;
            root.put(ns, &verified.blob_id, &payload).await?;
            tracing::debug!(namespace = %ns, blob = %verified.blob_id, layer = layer.name(), root = root.name(), "copied multipart upload to root layer");
        }

        self.service
            .index()
            .add_blob_to_index(ns, &verified.blob_id, None)
            .await?;
        store
            .rename_multipart_blob(ns, &upload.blob_name, &verified.blob_id)
            .await?;
        tracing::info!(namespace = %ns, blob = %verified.blob_id, compressed = is_compressed, "verified multipart upload");
        Ok(verified)
    }
}

fn split_ranges(content_length: u64, limits: &MultipartLimits) -> Result<Vec<MultipartPartDescription>> {
    let max_parts = u64::from(limits.max_parts.max(1));
    let part_size = limits
        .min_part_size
        .max(content_length.div_ceil(max_parts))
        .max(1);
    if part_size > limits.max_part_size {
        return Err(Error::InvalidId(format!(
            "{} bytes do not fit in {} parts of at most {} bytes",
            content_length, limits.max_parts, limits.max_part_size
        )));
    }

    let mut ranges = Vec::new();
    let mut first_byte = 0u64;
    while first_byte < content_length {
        let last_byte = (first_byte + part_size).min(content_length) - 1;
        ranges.push(MultipartPartDescription {
            part_id: (ranges.len() + 1).to_string(),
            first_byte,
            last_byte,
        });
        first_byte = last_byte + 1;
    }
    Ok(ranges)
}
