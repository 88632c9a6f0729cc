//! Blob index consistency check
//!
//! Walks the whole index. An entry that claims the local region while the
//! root store lacks the object is repaired by a forced replication from
//! another region; if that fails the stale region is dropped (when allowed)
//! or the entry is only reported. Entries of namespaces that no longer exist
//! are purged.

use super::ConsistencyCheck;
use crate::blob::BlobService;
use crate::common::config::BlobIndexCheckConfig;
use crate::common::Result;
use crate::index::{iterate_all, BlobIndexEntry};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobIndexReport {
    pub checked: u64,
    /// Local region recorded but the root store lacked the object
    pub missing_in_root: u64,
    pub replicated: u64,
    pub regions_removed: u64,
    pub namespaces_purged: u64,
    pub failed: u64,
}

enum Outcome {
    Healthy,
    Replicated,
    RegionRemoved,
    Unresolved,
    NamespacePurged,
    Failed,
}

pub struct BlobIndexConsistencyCheck {
    service: Arc<BlobService>,
    settings: BlobIndexCheckConfig,
}

impl BlobIndexConsistencyCheck {
    pub fn new(service: Arc<BlobService>, settings: BlobIndexCheckConfig) -> Self {
        Self { service, settings }
    }

    async fn check_entry(&self, entry: BlobIndexEntry) -> Outcome {
        match self.try_check_entry(&entry).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(namespace = %entry.namespace, blob = %entry.id, error = %e, "blob index check failed");
                Outcome::Failed
            }
        }
    }

    async fn try_check_entry(&self, entry: &BlobIndexEntry) -> Result<Outcome> {
        let index = self.service.index();
        let (ns, id) = (&entry.namespace, &entry.id);

        if !self.service.policies().is_known(ns) {
            tracing::info!(namespace = %ns, blob = %id, "purging entry of unknown namespace");
            index.remove_blob_from_all_regions(ns, id).await?;
            return Ok(Outcome::NamespacePurged);
        }

        if !entry.record.regions.contains(index.local_region())
            || self.service.exists_in_root(ns, id).await?
        {
            return Ok(Outcome::Healthy);
        }

        tracing::info!(namespace = %ns, blob = %id, "blob missing in root store, replicating");
        match self.service.replicate_object(ns, id, true, None).await {
            Ok(()) => Ok(Outcome::Replicated),
            Err(e) if self.settings.allow_deletes_in_blob_index => {
                tracing::warn!(namespace = %ns, blob = %id, error = %e, "replication failed, removing local region from index");
                index.remove_blob_from_region(ns, id, None).await?;
                Ok(Outcome::RegionRemoved)
            }
            Err(e) => {
                tracing::warn!(namespace = %ns, blob = %id, error = %e, "replication failed, leaving index entry");
                Ok(Outcome::Unresolved)
            }
        }
    }
}

#[async_trait]
impl ConsistencyCheck for BlobIndexConsistencyCheck {
    type Report = BlobIndexReport;

    fn name(&self) -> &'static str {
        "blob-index"
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<BlobIndexReport> {
        let outcomes = iterate_all(self.service.index().clone(), PAGE_SIZE)
            .take_until(cancel.cancelled())
            .map(|entry| async move {
                match entry {
                    Ok(entry) => Ok(self.check_entry(entry).await),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.settings.parallelism.max(1));
        let mut outcomes = std::pin::pin!(outcomes);

        let mut report = BlobIndexReport::default();
        while let Some(outcome) = outcomes.next().await {
            report.checked += 1;
            match outcome? {
                Outcome::Healthy => {}
                Outcome::Replicated => {
                    report.missing_in_root += 1;
                    report.replicated += 1;
                }
                Outcome::RegionRemoved => {
                    report.missing_in_root += 1;
                    report.regions_removed += 1;
                }
                Outcome::Unresolved => report.missing_in_root += 1,
                Outcome::NamespacePurged => report.namespaces_purged += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BlobId, NamespaceId};
    use crate::index::MemoryBlobIndex;
    use crate::policy::{ConfigPolicyResolver, NamespacePolicy};
    use crate::store::{LayoutHandle, MemoryStore, StorageBackend, StorageLayout, StoreStack};
    use std::collections::HashMap;

    fn service() -> Arc<BlobService> {
        let layout = StorageLayout::new().with_pool(
            "default",
            StoreStack::new(vec![StorageBackend::from(MemoryStore::new())]).unwrap(),
        );
        let mut policies = HashMap::new();
        policies.insert(NamespaceId::new("ddc-test").unwrap(), NamespacePolicy::default());
        Arc::new(
            BlobService::builder(
                Arc::new(LayoutHandle::new(layout)),
                Arc::new(ConfigPolicyResolver::new(policies, None)),
                Arc::new(MemoryBlobIndex::new("local")),
            )
            .build()
            .unwrap(),
        )
    }

    fn settings(allow_deletes: bool) -> BlobIndexCheckConfig {
        BlobIndexCheckConfig {
            enabled: true,
            allow_deletes_in_blob_index: allow_deletes,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_purges_unknown_namespace() {
        let service = service();
        let gone = NamespaceId::new("retired").unwrap();
        let id = BlobId::from_blob(b"old");
        service.index().add_blob_to_index(&gone, &id, None).await.unwrap();

        let check = BlobIndexConsistencyCheck::new(service.clone(), settings(false));
        let report = check.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.namespaces_purged, 1);
        assert!(service.index().get_blob_regions(&gone, &id).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_local_region() {
        let service = service();
        let ns = NamespaceId::new("ddc-test").unwrap();
        let id = BlobId::from_blob(b"never stored");
        service.index().add_blob_to_index(&ns, &id, None).await.unwrap();

        // without deletes the entry survives
        let report = BlobIndexConsistencyCheck::new(service.clone(), settings(false))
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.missing_in_root, 1);
        assert_eq!(report.regions_removed, 0);
        assert!(service.index().blob_exists_in_region(&ns, &id, None).await.unwrap());

        let report = BlobIndexConsistencyCheck::new(service.clone(), settings(true))
            .run_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.regions_removed, 1);
        assert!(!service.index().blob_exists_in_region(&ns, &id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_check_stops_early() {
        let service = service();
        let ns = NamespaceId::new("ddc-test").unwrap();
        for i in 0..10u8 {
            service
                .index()
                .add_blob_to_index(&ns, &BlobId::from_blob(&[i]), Some("remote"))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = BlobIndexConsistencyCheck::new(service, settings(false))
            .run_once(&cancel)
            .await
            .unwrap();
        assert_eq!(report.checked, 0);
    }
}
