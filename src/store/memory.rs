//! In-process store, used as a hot cache tier and in tests

use super::{BlobMetadata, MultipartPart, MultipartStore, StoredBlob};
use crate::blob::payload::{BlobContents, BlobPayload};
use crate::common::{BlobId, Error, NamespaceId, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Clone)]
struct MemoryEntry {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryUpload {
    blob_name: String,
    parts: BTreeMap<String, Bytes>,
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<NamespaceId, BTreeMap<BlobId, MemoryEntry>>,
    uploads: HashMap<String, MemoryUpload>,
    temp_blobs: HashMap<(NamespaceId, String), Bytes>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    /// Drop every blob in every namespace
    pub fn clear(&self) -> Result<()> {
        self.lock()?.blobs.clear();
        Ok(())
    }

    /// Number of blobs held across all namespaces
    pub fn blob_count(&self) -> usize {
        self.lock()
            .map(|s| s.blobs.values().map(|b| b.len()).sum())
            .unwrap_or(0)
    }

    pub async fn put(&self, ns: &NamespaceId, id: &BlobId, payload: &BlobPayload) -> Result<()> {
        if self.exists(ns, id).await? {
            return Ok(());
        }
        let data = payload.to_bytes().await?;
        self.lock()?.blobs.entry(ns.clone()).or_default().insert(
            *id,
            MemoryEntry {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn get(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobContents>> {
        let entry = self.lock()?.blobs.get(ns).and_then(|b| b.get(id)).cloned();
        Ok(entry.map(|e| BlobContents::from_bytes(e.data)))
    }

    pub async fn exists(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        Ok(self
            .lock()?
            .blobs
            .get(ns)
            .map(|b| b.contains_key(id))
            .unwrap_or(false))
    }

    pub async fn delete(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        Ok(self
            .lock()?
            .blobs
            .get_mut(ns)
            .and_then(|b| b.remove(id))
            .is_some())
    }

    pub fn list(&self, ns: &NamespaceId) -> BoxStream<'static, Result<StoredBlob>> {
        let entries: Vec<Result<StoredBlob>> = match self.lock() {
            Ok(state) => state
                .blobs
                .get(ns)
                .map(|b| {
                    b.iter()
                        .map(|(id, e)| {
                            Ok(StoredBlob {
                                id: *id,
                                length: e.data.len() as u64,
                                last_modified: e.last_modified,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(entries).boxed()
    }

    pub async fn metadata(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobMetadata>> {
        Ok(self
            .lock()?
            .blobs
            .get(ns)
            .and_then(|b| b.get(id))
            .map(|e| BlobMetadata {
                length: e.data.len() as u64,
                last_modified: e.last_modified,
            }))
    }

    pub async fn delete_namespace(&self, ns: &NamespaceId) -> Result<()> {
        let mut state = self.lock()?;
        state.blobs.remove(ns);
        state.temp_blobs.retain(|(n, _), _| n != ns);
        Ok(())
    }
}

#[async_trait]
impl MultipartStore for MemoryStore {
    async fn start_multipart_upload(&self, _ns: &NamespaceId, blob_name: &str) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.lock()?.uploads.insert(
            upload_id.clone(),
            MemoryUpload {
                blob_name: blob_name.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn put_multipart_part(
        &self,
        _ns: &NamespaceId,
        blob_name: &str,
        upload_id: &str,
        part_id: &str,
        data: Bytes,
    ) -> Result<String> {
        let etag = hex::encode(crate::common::content_hash(&data));
        let mut state = self.lock()?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.blob_name == blob_name)
            .ok_or_else(|| Error::Internal(format!("unknown multipart upload {}", upload_id)))?;
        upload.parts.insert(part_id.to_string(), data);
        Ok(etag)
    }

    async fn list_multipart_parts(
        &self,
        _ns: &NamespaceId,
        _blob_name: &str,
        upload_id: &str,
    ) -> Result<Vec<MultipartPart>> {
        let state = self.lock()?;
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| Error::Internal(format!("unknown multipart upload {}", upload_id)))?;
        Ok(upload
            .parts
            .iter()
            .map(|(part_id, data)| MultipartPart {
                part_id: part_id.clone(),
                etag: hex::encode(crate::common::content_hash(data)),
                length: data.len() as u64,
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        upload_id: &str,
        part_ids: &[String],
    ) -> Result<()> {
        let mut state = self.lock()?;
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::Internal(format!("unknown multipart upload {}", upload_id)))?;

        let mut assembled = BytesMut::new();
        for part_id in part_ids {
            let part = upload
                .parts
                .get(part_id)
                .ok_or_else(|| Error::Internal(format!("part {} was never uploaded", part_id)))?;
            assembled.extend_from_slice(part);
        }
        state
            .temp_blobs
            .insert((ns.clone(), blob_name.to_string()), assembled.freeze());
        Ok(())
    }

    async fn get_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
    ) -> Result<Option<BlobContents>> {
        Ok(self
            .lock()?
            .temp_blobs
            .get(&(ns.clone(), blob_name.to_string()))
            .cloned()
            .map(BlobContents::from_bytes))
    }

    async fn rename_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        id: &BlobId,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let data = state
            .temp_blobs
            .remove(&(ns.clone(), blob_name.to_string()))
            .ok_or_else(|| Error::Internal(format!("no assembled multipart blob {}", blob_name)))?;
        state
            .blobs
            .entry(ns.clone())
            .or_default()
            .entry(*id)
            .or_insert(MemoryEntry {
                data,
                last_modified: Utc::now(),
            });
        Ok(())
    }

    async fn delete_multipart_blob(&self, ns: &NamespaceId, blob_name: &str) -> Result<()> {
        self.lock()?
            .temp_blobs
            .remove(&(ns.clone(), blob_name.to_string()));
        Ok(())
    }
}
