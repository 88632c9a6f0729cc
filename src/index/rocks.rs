//! Blob index persisted in RocksDB
//!
//! Column families:
//! - `blob_index`: `<ns>\0<blob id bytes>` -> bincode `BlobIndexRecord`
//! - `bucket_usage`: `<ns>\0<bucket>\0<ref>\0<blob id bytes>` -> size (u64 LE)
//!
//! Names never contain control characters, so `\0` is a safe separator and
//! key order matches (namespace, blob id) order.

use super::{BlobIndex, BlobIndexEntry, BlobIndexRecord, BucketStats};
use crate::common::{BlobId, BlobReference, BucketId, Error, NamespaceId, RefId, Result};
use crate::common::hash::HASH_LEN;
use async_trait::async_trait;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Mutex;

const CF_BLOB_INDEX: &str = "blob_index";
const CF_BUCKET_USAGE: &str = "bucket_usage";

pub struct RocksBlobIndex {
    db: DB,
    site: String,
    /// Serializes read-modify-write of records
    write_lock: Mutex<()>,
}

fn blob_key(ns: &NamespaceId, id: &BlobId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ns.as_str().len() + 1 + HASH_LEN);
    key.extend_from_slice(ns.as_str().as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode_blob_key(key: &[u8]) -> Result<(NamespaceId, BlobId)> {
    let sep = key
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Corrupted("blob index key without separator".into()))?;
    let ns = std::str::from_utf8(&key[..sep])
        .map_err(|_| Error::Corrupted("blob index key is not UTF-8".into()))?;
    let id: [u8; HASH_LEN] = key[sep + 1..]
        .try_into()
        .map_err(|_| Error::Corrupted("blob index key has a bad id length".into()))?;
    Ok((NamespaceId::new(ns)?, BlobId::from_bytes(id)))
}

fn bucket_prefix(ns: &NamespaceId, bucket: &BucketId) -> Vec<u8> {
    let mut key = Vec::new();
    key.extend_from_slice(ns.as_str().as_bytes());
    key.push(0);
    key.extend_from_slice(bucket.as_str().as_bytes());
    key.push(0);
    key
}

fn usage_key(ns: &NamespaceId, bucket: &BucketId, ref_key: &RefId, id: &BlobId) -> Vec<u8> {
    let mut key = bucket_prefix(ns, bucket);
    key.extend_from_slice(ref_key.as_str().as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

impl RocksBlobIndex {
    /// Open or create the index database
    pub fn open(path: impl AsRef<Path>, site: impl Into<String>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_BLOB_INDEX, CF_BUCKET_USAGE])?;

        Ok(Self {
            db,
            site: site.into(),
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn read_record(&self, key: &[u8]) -> Result<Option<BlobIndexRecord>> {
        match self.db.get_cf(self.cf(CF_BLOB_INDEX)?, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply `f` to the record under `key`, creating it when `create` is set.
    /// `f` returns whether the record should be kept.
    fn modify<F>(&self, key: &[u8], create: bool, f: F) -> Result<()>
    where
        F: FnOnce(&mut BlobIndexRecord) -> bool,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("blob index write lock poisoned".into()))?;
        let cf = self.cf(CF_BLOB_INDEX)?;

        let mut record = match self.read_record(key)? {
            Some(record) => record,
            None if create => BlobIndexRecord::default(),
            None => return Ok(()),
        };
        if f(&mut record) {
            self.db.put_cf(cf, key, bincode::serialize(&record)?)?;
        } else {
            self.db.delete_cf(cf, key)?;
        }
        Ok(())
    }

    fn region<'a>(&'a self, region: Option<&'a str>) -> &'a str {
        region.unwrap_or(&self.site)
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl BlobIndex for RocksBlobIndex {
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
        self.modify(&blob_key(ns, id), true, |record| {
            record.regions.insert(region);
            true
        })
    }

    async fn remove_blob_from_region(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        region: Option<&str>,
    ) -> Result<()> {
        let region = self.region(region);
        self.modify(&blob_key(ns, id), false, |record| {
            record.regions.remove(region);
            !record.regions.is_empty()
        })
    }

    async fn remove_blob_from_all_regions(&self, ns: &NamespaceId, id: &BlobId) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("blob index write lock poisoned".into()))?;
        self.db.delete_cf(self.cf(CF_BLOB_INDEX)?, blob_key(ns, id))?;
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
            .read_record(&blob_key(ns, id))?
            .map(|r| r.regions.contains(region))
            .unwrap_or(false))
    }

    async fn get_blob_regions(&self, ns: &NamespaceId, id: &BlobId) -> Result<Vec<String>> {
        self.read_record(&blob_key(ns, id))?
            .map(|r| r.regions.into_iter().collect())
            .ok_or_else(|| Error::blob_not_found(ns, id))
    }

    async fn get_blob_references(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
    ) -> Result<Vec<BlobReference>> {
        Ok(self
            .read_record(&blob_key(ns, id))?
            .map(|r| r.references.into_iter().collect())
            .unwrap_or_default())
    }

    async fn add_reference(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        reference: BlobReference,
    ) -> Result<()> {
        self.modify(&blob_key(ns, id), true, |record| {
            record.references.insert(reference);
            true
        })
    }

    async fn remove_references(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        references: Option<&[BlobReference]>,
    ) -> Result<()> {
        self.modify(&blob_key(ns, id), false, |record| {
            match references {
                Some(refs) => {
                    for r in refs {
                        record.references.remove(r);
                    }
                }
                None => record.references.clear(),
            }
            true
        })
    }

    async fn add_blob_to_bucket_list(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        id: &BlobId,
        size: u64,
    ) -> Result<()> {
        self.db.put_cf(
            self.cf(CF_BUCKET_USAGE)?,
            usage_key(ns, bucket, key, id),
            size.to_le_bytes(),
        )?;
        Ok(())
    }

    async fn remove_blob_from_bucket_list(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        ids: &[BlobId],
    ) -> Result<()> {
        let cf = self.cf(CF_BUCKET_USAGE)?;
        for id in ids {
            self.db.delete_cf(cf, usage_key(ns, bucket, key, id))?;
        }
        Ok(())
    }

    async fn calculate_bucket_statistics(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
    ) -> Result<BucketStats> {
        let prefix = bucket_prefix(ns, bucket);
        let iter = self.db.iterator_cf(
            self.cf(CF_BUCKET_USAGE)?,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        let mut sizes = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let size: [u8; 8] = value[..]
                .try_into()
                .map_err(|_| Error::Corrupted("bucket usage value is not a u64".into()))?;
            sizes.push(u64::from_le_bytes(size));
        }
        Ok(BucketStats::from_sizes(ns, bucket, sizes))
    }

    async fn scan(
        &self,
        after: Option<&(NamespaceId, BlobId)>,
        limit: usize,
    ) -> Result<Vec<BlobIndexEntry>> {
        let start = after.map(|(ns, id)| blob_key(ns, id));
        let mode = match &start {
            Some(key) => IteratorMode::From(key, Direction::Forward),
            None => IteratorMode::Start,
        };

        let mut entries = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(self.cf(CF_BLOB_INDEX)?, mode) {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if start.as_deref() == Some(&key[..]) {
                continue;
            }
            let (namespace, id) = decode_blob_key(&key)?;
            entries.push(BlobIndexEntry {
                namespace,
                id,
                record: bincode::deserialize(&value)?,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ns(name: &str) -> NamespaceId {
        NamespaceId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_regions_survive_reopen() {
        let dir = tempdir().unwrap();
        let id = BlobId::from_blob(b"hello");
        {
            let index = RocksBlobIndex::open(dir.path(), "local").unwrap();
            index.add_blob_to_index(&ns("ddc-test"), &id, None).await.unwrap();
            index
                .add_blob_to_index(&ns("ddc-test"), &id, Some("eu-west"))
                .await
                .unwrap();
            index.flush().unwrap();
        }

        let index = RocksBlobIndex::open(dir.path(), "local").unwrap();
        assert_eq!(
            index.get_blob_regions(&ns("ddc-test"), &id).await.unwrap(),
            vec!["eu-west".to_string(), "local".to_string()]
        );

        index.remove_blob_from_region(&ns("ddc-test"), &id, None).await.unwrap();
        index
            .remove_blob_from_region(&ns("ddc-test"), &id, Some("eu-west"))
            .await
            .unwrap();
        assert!(index.get_blob_regions(&ns("ddc-test"), &id).await.is_err());
    }

    #[tokio::test]
    async fn test_references_roundtrip_through_bincode() {
        let dir = tempdir().unwrap();
        let index = RocksBlobIndex::open(dir.path(), "local").unwrap();
        let bucket = BucketId::new("bucket").unwrap();
        let key = RefId::new("ref").unwrap();
        let a = BlobId::from_blob(b"a");
        let b = BlobId::from_blob(b"b");

        index.add_ref_to_blobs(&ns("n"), &bucket, &key, &[a]).await.unwrap();
        index.add_blob_references(&ns("n"), &b, &[a]).await.unwrap();
        let refs = index.get_blob_references(&ns("n"), &a).await.unwrap();
        assert!(refs.contains(&BlobReference::Ref { bucket, key }));
        assert!(refs.contains(&BlobReference::Blob { blob_id: b }));
    }

    #[tokio::test]
    async fn test_scan_orders_by_namespace_then_id() {
        let dir = tempdir().unwrap();
        let index = RocksBlobIndex::open(dir.path(), "local").unwrap();
        for name in ["a", "a-b", "b"] {
            for i in 0..3u8 {
                index
                    .add_blob_to_index(&ns(name), &BlobId::from_blob(&[i]), None)
                    .await
                    .unwrap();
            }
        }

        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let page = index.scan(cursor.as_ref(), 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(BlobIndexEntry::cursor);
            all.extend(page.into_iter().map(|e| e.cursor()));
        }
        assert_eq!(all.len(), 9);
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
    }

    #[tokio::test]
    async fn test_bucket_statistics_scoped_to_bucket() {
        let dir = tempdir().unwrap();
        let index = RocksBlobIndex::open(dir.path(), "local").unwrap();
        let key = RefId::new("r").unwrap();
        let bucket = BucketId::new("bucket").unwrap();
        let other = BucketId::new("bucket2").unwrap();

        index
            .add_blob_to_bucket_list(&ns("n"), &bucket, &key, &BlobId::from_blob(b"1"), 10)
            .await
            .unwrap();
        index
            .add_blob_to_bucket_list(&ns("n"), &bucket, &key, &BlobId::from_blob(b"2"), 50)
            .await
            .unwrap();
        index
            .add_blob_to_bucket_list(&ns("n"), &other, &key, &BlobId::from_blob(b"3"), 999)
            .await
            .unwrap();

        let stats = index.calculate_bucket_statistics(&ns("n"), &bucket).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size, 60);
        assert_eq!(stats.largest, 50);
    }
}
