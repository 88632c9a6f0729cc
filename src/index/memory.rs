//! In-process blob index for tests and single-node deployments

use super::{BlobIndex, BlobIndexEntry, BlobIndexRecord, BucketStats};
use crate::common::{BlobId, BlobReference, BucketId, Error, NamespaceId, RefId, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

type UsageKey = (NamespaceId, BucketId, RefId, BlobId);

#[derive(Default)]
struct IndexTables {
    blobs: BTreeMap<(NamespaceId, BlobId), BlobIndexRecord>,
    usage: BTreeMap<UsageKey, u64>,
}

pub struct MemoryBlobIndex {
    site: String,
    tables: Mutex<IndexTables>,
}

impl MemoryBlobIndex {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            tables: Mutex::new(IndexTables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexTables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Internal("blob index lock poisoned".into()))
    }

    fn region<'a>(&'a self, region: Option<&'a str>) -> &'a str {
        region.unwrap_or(&self.site)
    }
}

#[async_trait]
impl BlobIndex for MemoryBlobIndex {
    fn local_region(&self) -> &str {
        &self.site
    }

    async fn add_blob_to_index(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<()> {
        let region = self.region(region).to_string();
        self.lock()?
            .blobs
            .entry((ns.clone(), *id))
            .or_default()
            .regions
            .insert(region);
        Ok(())
    }

    async fn remove_blob_from_region(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<()> {
        let region = self.region(region);
        let mut tables = self.lock()?;
        let key = (ns.clone(), *id);
        if let Some(record) = tables.blobs.get_mut(&key) {
            record.regions.remove(region);
            if record.regions.is_empty() {
                tables.blobs.remove(&key);
            }
        }
        Ok(())
    }

    async fn remove_blob_from_all_regions(&self, ns: &NamespaceId, id: &BlobId) -> Result<()> {
        self.lock()?.blobs.remove(&(ns.clone(), *id));
        Ok(())
    }

    async fn blob_exists_in_region(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<bool> {
        let region = self.region(region);
        Ok(self
            .lock()?
            .blobs
            .get(&(ns.clone(), *id))
            .map(|r| r.regions.contains(region))
            .unwrap_or(false))
    }

    async fn get_blob_regions(&self, ns: &NamespaceId, id: &BlobId) -> Result<Vec<String>> {
        self.lock()?
            .blobs
            .get(&(ns.clone(), *id))
            .map(|r| r.regions.iter().cloned().collect())
            .ok_or_else(|| Error::blob_not_found(ns, id))
    }

    async fn get_blob_references(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
    ) -> Result<Vec<BlobReference>> {
        Ok(self
            .lock()?
            .blobs
            .get(&(ns.clone(), *id))
            .map(|r| r.references.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_reference(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        reference: BlobReference,
    ) -> Result<()> {
        self.lock()?
            .blobs
            .entry((ns.clone(), *id))
            .or_default()
            .references
            .insert(reference);
        Ok(())
    }

    async fn remove_references(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        references: Option<&[BlobReference]>,
    ) -> Result<()> {
        if let Some(record) = self.lock()?.blobs.get_mut(&(ns.clone(), *id)) {
            match references {
                Some(refs) => {
                    for r in refs {
                        record.references.remove(r);
                    }
                }
                None => record.references.clear(),
            }
        }
        Ok(())
    }

    async fn add_blob_to_bucket_list(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        id: &BlobId,
        size: u64,
    ) -> Result<()> {
        self.lock()?
            .usage
            .insert((ns.clone(), bucket.clone(), key.clone(), *id), size);
        Ok(())
    }

    async fn remove_blob_from_bucket_list(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        ids: &[BlobId],
    ) -> Result<()> {
        let mut tables = self.lock()?;
        for id in ids {
            tables
                .usage
                .remove(&(ns.clone(), bucket.clone(), key.clone(), *id));
        }
        Ok(())
    }

    async fn calculate_bucket_statistics(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
    ) -> Result<BucketStats> {
        let tables = self.lock()?;
        let sizes = tables
            .usage
            .iter()
            .filter(|((n, b, _, _), _)| n == ns && b == bucket)
            .map(|(_, size)| *size);
        Ok(BucketStats::from_sizes(ns, bucket, sizes))
    }

    async fn scan(
        &self,
        after: Option<&(NamespaceId, BlobId)>,
        limit: usize,
    ) -> Result<Vec<BlobIndexEntry>> {
        let tables = self.lock()?;
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(tables
            .blobs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|((ns, id), record)| BlobIndexEntry {
                namespace: ns.clone(),
                id: *id,
                record: record.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> NamespaceId {
        NamespaceId::new("ddc-test").unwrap()
    }

    #[tokio::test]
    async fn test_add_and_remove_regions() {
        let index = MemoryBlobIndex::new("us-east");
        let id = BlobId::from_blob(b"hello");

        index.add_blob_to_index(&ns(), &id, None).await.unwrap();
        index.add_blob_to_index(&ns(), &id, None).await.unwrap();
        index.add_blob_to_index(&ns(), &id, Some("eu-west")).await.unwrap();
        assert_eq!(
            index.get_blob_regions(&ns(), &id).await.unwrap(),
            vec!["eu-west".to_string(), "us-east".to_string()]
        );
        assert!(index.blob_exists_in_region(&ns(), &id, None).await.unwrap());

        index.remove_blob_from_region(&ns(), &id, None).await.unwrap();
        assert!(!index.blob_exists_in_region(&ns(), &id, None).await.unwrap());

        // removing the last region drops the record
        index.remove_blob_from_region(&ns(), &id, Some("eu-west")).await.unwrap();
        assert!(matches!(
            index.get_blob_regions(&ns(), &id).await,
            Err(Error::BlobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_references() {
        let index = MemoryBlobIndex::new("local");
        let bucket = BucketId::new("bucket").unwrap();
        let key = RefId::new("ref").unwrap();
        let a = BlobId::from_blob(b"a");
        let b = BlobId::from_blob(b"b");

        index.add_ref_to_blobs(&ns(), &bucket, &key, &[a, b]).await.unwrap();
        index.add_blob_references(&ns(), &a, &[b]).await.unwrap();
        assert_eq!(index.get_blob_references(&ns(), &a).await.unwrap().len(), 1);
        assert_eq!(index.get_blob_references(&ns(), &b).await.unwrap().len(), 2);

        index
            .remove_references(&ns(), &b, Some(&[BlobReference::Blob { blob_id: a }][..]))
            .await
            .unwrap();
        assert_eq!(
            index.get_blob_references(&ns(), &b).await.unwrap(),
            vec![BlobReference::Ref {
                bucket: bucket.clone(),
                key: key.clone()
            }]
        );

        index.remove_references(&ns(), &b, None).await.unwrap();
        assert!(index.get_blob_references(&ns(), &b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bucket_statistics() {
        let index = MemoryBlobIndex::new("local");
        let bucket = BucketId::new("bucket").unwrap();
        let key = RefId::new("ref").unwrap();
        let a = BlobId::from_blob(b"a");
        let b = BlobId::from_blob(b"b");

        index.add_blob_to_bucket_list(&ns(), &bucket, &key, &a, 100).await.unwrap();
        index.add_blob_to_bucket_list(&ns(), &bucket, &key, &b, 300).await.unwrap();
        let stats = index.calculate_bucket_statistics(&ns(), &bucket).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size, 400);
        assert_eq!(stats.largest, 300);

        index.remove_blob_from_bucket_list(&ns(), &bucket, &key, &[b]).await.unwrap();
        let stats = index.calculate_bucket_statistics(&ns(), &bucket).await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.smallest, 100);
    }

    #[tokio::test]
    async fn test_scan_resumes_after_cursor() {
        let index = MemoryBlobIndex::new("local");
        for i in 0..5u8 {
            index
                .add_blob_to_index(&ns(), &BlobId::from_blob(&[i]), None)
                .await
                .unwrap();
        }
        let first = index.scan(None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first[1].cursor();
        let rest = index.scan(Some(&cursor), 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|e| e.cursor() > cursor));
    }
}
