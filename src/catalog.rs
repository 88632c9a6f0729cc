//! Content-id mappings and ref records
//!
//! Both are owned by other parts of the cache; the blob subsystem only needs
//! the narrow interfaces below.

use crate::common::{BlobId, BucketId, ContentId, Error, NamespaceId, RefId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

/// Maps the hash of decompressed content to the blobs that store it
#[async_trait]
pub trait ContentIdStore: Send + Sync {
    async fn put(&self, ns: &NamespaceId, content_id: &ContentId, blobs: &[BlobId]) -> Result<()>;

    async fn resolve(&self, ns: &NamespaceId, content_id: &ContentId) -> Result<Option<Vec<BlobId>>>;
}

#[derive(Default)]
pub struct MemoryContentIdStore {
    mappings: Mutex<BTreeMap<(NamespaceId, ContentId), Vec<BlobId>>>,
}

impl MemoryContentIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentIdStore for MemoryContentIdStore {
    async fn put(&self, ns: &NamespaceId, content_id: &ContentId, blobs: &[BlobId]) -> Result<()> {
        self.mappings
            .lock()
            .map_err(|_| Error::Internal("content id store lock poisoned".into()))?
            .insert((ns.clone(), *content_id), blobs.to_vec());
        Ok(())
    }

    async fn resolve(&self, ns: &NamespaceId, content_id: &ContentId) -> Result<Option<Vec<BlobId>>> {
        Ok(self
            .mappings
            .lock()
            .map_err(|_| Error::Internal("content id store lock poisoned".into()))?
            .get(&(ns.clone(), *content_id))
            .cloned())
    }
}

/// A named reference and the blobs it keeps alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub namespace: NamespaceId,
    pub bucket: BucketId,
    pub key: RefId,
    pub blobs: Vec<BlobId>,
    /// Last time the ref was read; `None` until first recorded
    pub last_access: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReferencesStore: Send + Sync {
    async fn put_ref(&self, record: RefRecord) -> Result<()>;

    async fn get_ref(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
    ) -> Result<Option<RefRecord>>;

    async fn namespaces(&self) -> Result<Vec<NamespaceId>>;

    /// Up to `limit` refs of `ns` ordered by (bucket, key), strictly after `after`
    async fn scan_refs(
        &self,
        ns: &NamespaceId,
        after: Option<&(BucketId, RefId)>,
        limit: usize,
    ) -> Result<Vec<RefRecord>>;

    async fn update_last_access(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Every ref of a namespace, one page at a time
pub fn iterate_refs(
    store: Arc<dyn ReferencesStore>,
    ns: NamespaceId,
    page_size: usize,
) -> BoxStream<'static, Result<RefRecord>> {
    let page_size = page_size.max(1);
    async_stream::try_stream! {
        let mut cursor: Option<(BucketId, RefId)> = None;
        loop {
            let page = store.scan_refs(&ns, cursor.as_ref(), page_size).await?;
            let done = page.len() < page_size;
            cursor = page.last().map(|r| (r.bucket.clone(), r.key.clone()));
            for record in page {
                yield record;
            }
            if done {
                break;
            }
        }
    }
    .boxed()
}

type RefKey = (NamespaceId, BucketId, RefId);

#[derive(Default)]
pub struct MemoryReferencesStore {
    refs: Mutex<BTreeMap<RefKey, RefRecord>>,
}

impl MemoryReferencesStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<RefKey, RefRecord>>> {
        self.refs
            .lock()
            .map_err(|_| Error::Internal("references store lock poisoned".into()))
    }
}

#[async_trait]
impl ReferencesStore for MemoryReferencesStore {
    async fn put_ref(&self, record: RefRecord) -> Result<()> {
        let key = (
            record.namespace.clone(),
            record.bucket.clone(),
            record.key.clone(),
        );
        self.lock()?.insert(key, record);
        Ok(())
    }

    async fn get_ref(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
    ) -> Result<Option<RefRecord>> {
        Ok(self
            .lock()?
            .get(&(ns.clone(), bucket.clone(), key.clone()))
            .cloned())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceId>> {
        let mut namespaces: Vec<NamespaceId> =
            self.lock()?.keys().map(|(ns, _, _)| ns.clone()).collect();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn scan_refs(
        &self,
        ns: &NamespaceId,
        after: Option<&(BucketId, RefId)>,
        limit: usize,
    ) -> Result<Vec<RefRecord>> {
        let refs = self.lock()?;
        let lower = match after {
            Some((bucket, key)) => Bound::Excluded((ns.clone(), bucket.clone(), key.clone())),
            None => Bound::Unbounded,
        };
        Ok(refs
            .range((lower, Bound::Unbounded))
            .skip_while(|((n, _, _), _)| n < ns)
            .take_while(|((n, _, _), _)| n == ns)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn update_last_access(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut refs = self.lock()?;
        let record = refs
            .get_mut(&(ns.clone(), bucket.clone(), key.clone()))
            .ok_or_else(|| Error::Internal(format!("unknown ref {}/{} in {}", bucket, key, ns)))?;
        record.last_access = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    fn record(ns: &str, bucket: &str, key: &str) -> RefRecord {
        RefRecord {
            namespace: NamespaceId::new(ns).unwrap(),
            bucket: BucketId::new(bucket).unwrap(),
            key: RefId::new(key).unwrap(),
            blobs: vec![BlobId::from_blob(key.as_bytes())],
            last_access: None,
        }
    }

    #[tokio::test]
    async fn test_content_id_mapping() {
        let store = MemoryContentIdStore::new();
        let ns = NamespaceId::new("ns").unwrap();
        let content = ContentId::from_blob(b"raw");
        assert!(store.resolve(&ns, &content).await.unwrap().is_none());

        let blob = BlobId::from_blob(b"compressed");
        store.put(&ns, &content, &[blob]).await.unwrap();
        assert_eq!(store.resolve(&ns, &content).await.unwrap(), Some(vec![blob]));
    }

    #[tokio::test]
    async fn test_iterate_refs_stays_in_namespace() {
        let store = Arc::new(MemoryReferencesStore::new());
        for key in ["a", "b", "c"] {
            store.put_ref(record("first", "bucket", key)).await.unwrap();
        }
        store.put_ref(record("second", "bucket", "z")).await.unwrap();

        let first = NamespaceId::new("first").unwrap();
        let refs: Vec<RefRecord> = iterate_refs(store.clone(), first, 2).try_collect().await.unwrap();
        assert_eq!(refs.len(), 3);

        let second = NamespaceId::new("second").unwrap();
        let refs: Vec<RefRecord> = iterate_refs(store.clone(), second, 2).try_collect().await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(store.namespaces().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_last_access() {
        let store = MemoryReferencesStore::new();
        let r = record("ns", "bucket", "key");
        store.put_ref(r.clone()).await.unwrap();
        let now = Utc::now();
        store
            .update_last_access(&r.namespace, &r.bucket, &r.key, now)
            .await
            .unwrap();
        let stored = store.get_ref(&r.namespace, &r.bucket, &r.key).await.unwrap().unwrap();
        assert_eq!(stored.last_access, Some(now));
    }
}
