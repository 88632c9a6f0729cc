//! Blob index: which regions hold a blob, and what references it
//!
//! Records are keyed by (namespace, blob id). A record is created by the first
//! region add (or reference add) and removed once its last region is removed.
//! A second table tracks (namespace, bucket, ref key, blob id) -> size for
//! capacity accounting.

pub mod memory;
pub mod rocks;

use crate::common::{BlobId, BlobReference, BucketId, NamespaceId, RefId, Result};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

pub use memory::MemoryBlobIndex;
pub use rocks::RocksBlobIndex;

/// Region set and reference set of one blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobIndexRecord {
    pub regions: BTreeSet<String>,
    pub references: BTreeSet<BlobReference>,
}

/// A record together with its key, as produced by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobIndexEntry {
    pub namespace: NamespaceId,
    pub id: BlobId,
    pub record: BlobIndexRecord,
}

impl BlobIndexEntry {
    pub fn cursor(&self) -> (NamespaceId, BlobId) {
        (self.namespace.clone(), self.id)
    }
}

/// Usage summary of one bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketStats {
    pub namespace: Option<NamespaceId>,
    pub bucket: Option<BucketId>,
    pub count: u64,
    pub total_size: u64,
    pub smallest: u64,
    pub largest: u64,
    pub average: f64,
}

impl BucketStats {
    /// Fold a sequence of blob sizes into a summary
    pub fn from_sizes(
        namespace: &NamespaceId,
        bucket: &BucketId,
        sizes: impl IntoIterator<Item = u64>,
    ) -> Self {
        let mut stats = BucketStats {
            namespace: Some(namespace.clone()),
            bucket: Some(bucket.clone()),
            smallest: u64::MAX,
            ..Default::default()
        };
        for size in sizes {
            stats.count += 1;
            stats.total_size += size;
            stats.smallest = stats.smallest.min(size);
            stats.largest = stats.largest.max(size);
        }
        if stats.count == 0 {
            stats.smallest = 0;
        } else {
            stats.average = stats.total_size as f64 / stats.count as f64;
        }
        stats
    }
}

#[async_trait]
pub trait BlobIndex: Send + Sync {
    /// Region used when an operation is not given one
    fn local_region(&self) -> &str;

    /// Record that `region` (default: local) holds the blob; idempotent
    async fn add_blob_to_index(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<()>;

    /// Drop `region` (default: local) from the blob's region set
    async fn remove_blob_from_region(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<()>;

    /// Drop the whole record
    async fn remove_blob_from_all_regions(&self, ns: &NamespaceId, id: &BlobId) -> Result<()>;

    async fn blob_exists_in_region(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<bool>;

    /// Regions recorded for the blob; `BlobNotFound` if there is no record
    async fn get_blob_regions(&self, ns: &NamespaceId, id: &BlobId) -> Result<Vec<String>>;

    async fn get_blob_references(&self, ns: &NamespaceId, id: &BlobId)
        -> Result<Vec<BlobReference>>;

    /// Insert one reference edge on the blob's record, creating it if needed
    async fn add_reference(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        reference: BlobReference,
    ) -> Result<()>;

    /// Remove the given edges, or every edge when `references` is `None`
    async fn remove_references(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        references: Option<&[BlobReference]>,
    ) -> Result<()>;

    /// Mark that the ref `bucket/key` holds each of `blobs`
    async fn add_ref_to_blobs(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        blobs: &[BlobId],
    ) -> Result<()> {
        try_join_all(blobs.iter().map(|id| {
            self.add_reference(
                ns,
                id,
                BlobReference::Ref {
                    bucket: bucket.clone(),
                    key: key.clone(),
                },
            )
        }))
        .await?;
        Ok(())
    }

    /// Mark that `source` depends on each of `targets`
    async fn add_blob_references(
        &self,
        ns: &NamespaceId,
        source: &BlobId,
        targets: &[BlobId],
    ) -> Result<()> {
        try_join_all(
            targets
                .iter()
                .map(|id| self.add_reference(ns, id, BlobReference::Blob { blob_id: *source })),
        )
        .await?;
        Ok(())
    }

    async fn add_blob_to_bucket_list(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        id: &BlobId,
        size: u64,
    ) -> Result<()>;

    async fn remove_blob_from_bucket_list(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        ids: &[BlobId],
    ) -> Result<()>;

    async fn calculate_bucket_statistics(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
    ) -> Result<BucketStats>;

    /// Up to `limit` records ordered by key, strictly after `after`
    async fn scan(
        &self,
        after: Option<&(NamespaceId, BlobId)>,
        limit: usize,
    ) -> Result<Vec<BlobIndexEntry>>;
}

/// Every record, fetched one page at a time
pub fn iterate_all(
    index: Arc<dyn BlobIndex>,
    page_size: usize,
) -> BoxStream<'static, Result<BlobIndexEntry>> {
    let page_size = page_size.max(1);
    async_stream::try_stream! {
        let mut cursor: Option<(NamespaceId, BlobId)> = None;
        loop {
            let page = index.scan(cursor.as_ref(), page_size).await?;
            let done = page.len() < page_size;
            cursor = page.last().map(BlobIndexEntry::cursor);
            for entry in page {
                yield entry;
            }
            if done || cursor.is_none() {
                break;
            }
        }
    }
    .boxed()
}
