//! Object storage (S3, Azure Blob, GCS, local files) through `object_store`
//!
//! Keys:
//! - Blobs: `<prefix>/<ns>/<first 4 hex>/<id>`
//! - Multipart parts: `<prefix>/<ns>/.multipart/<upload id>/<part id>`
//! - Assembled multipart objects: `<prefix>/<ns>/.multipart/blobs/<blob name>`
//!
//! Spooled payloads and assembled uploads are written with a multipart
//! writer so large blobs never sit in memory.

use super::{check_component, BlobMetadata, MultipartPart, MultipartStore, StoreRead, StoredBlob};
use crate::blob::payload::{BlobContents, BlobPayload};
use crate::common::{blob_prefix, content_hash, BlobId, Error, NamespaceId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{ObjectMeta, ObjectStore, ObjectStoreScheme, PutPayload, WriteMultipart};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Lifetime of a presigned read URI
const REDIRECT_TTL: Duration = Duration::from_secs(15 * 60);

const MULTIPART_DIR: &str = ".multipart";
const ASSEMBLED_DIR: &str = "blobs";
/// Object written when an upload starts; parts are only accepted after it
const UPLOAD_MARKER: &str = ".blob_name";

pub struct ObjectStorageStore {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    prefix: Path,
}

impl ObjectStorageStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self {
            store,
            signer: None,
            prefix,
        }
    }

    /// Process-local object store, mostly for tests
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), Path::default())
    }

    /// Build from a URL such as `s3://bucket/prefix` or `file:///srv/blobs`.
    ///
    /// Redirects are only produced for S3, which can presign GET requests.
    pub fn from_url(url_str: &str, allow_redirects: bool) -> Result<Self> {
        let url = url_str
            .parse::<Url>()
            .map_err(|e| Error::InvalidConfig(format!("invalid object store url {}: {}", url_str, e)))?;
        let (scheme, prefix) = ObjectStoreScheme::parse(&url).map_err(|e| {
            Error::InvalidConfig(format!("unsupported object store url {}: {}", url_str, e))
        })?;

        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                let s3 = Arc::new(AmazonS3Builder::from_env().with_url(url_str).build()?);
                let signer: Option<Arc<dyn Signer>> = if allow_redirects {
                    Some(s3.clone())
                } else {
                    None
                };
                Ok(Self {
                    store: s3,
                    signer,
                    prefix,
                })
            }
            _ => {
                let (store, prefix) = object_store::parse_url(&url)?;
                Ok(Self::new(Arc::from(store), prefix))
            }
        }
    }

    fn namespace_path(&self, ns: &NamespaceId) -> Path {
        self.prefix.child(ns.as_str())
    }

    fn blob_path(&self, ns: &NamespaceId, id: &BlobId) -> Path {
        let hex = id.to_hex();
        self.namespace_path(ns)
            .child(blob_prefix(&hex))
            .child(hex.as_str())
    }

    fn upload_path(&self, ns: &NamespaceId, upload_id: &str) -> Path {
        self.namespace_path(ns).child(MULTIPART_DIR).child(upload_id)
    }

    fn assembled_path(&self, ns: &NamespaceId, blob_name: &str) -> Path {
        self.namespace_path(ns)
            .child(MULTIPART_DIR)
            .child(ASSEMBLED_DIR)
            .child(blob_name)
    }

    async fn read(&self, path: &Path) -> Result<Option<BlobContents>> {
        match self.store.get(path).await {
            Ok(result) => {
                let length = result.meta.size;
                Ok(Some(BlobContents {
                    length,
                    stream: result.into_stream().map_err(Error::from).boxed(),
                    layer: None,
                }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<()> {
        let locations: Vec<Path> = self
            .store
            .list(Some(prefix))
            .map_ok(|m| m.location)
            .try_collect()
            .await?;
        for location in locations {
            match self.store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn put(&self, ns: &NamespaceId, id: &BlobId, payload: &BlobPayload) -> Result<()> {
        if self.exists(ns, id).await? {
            return Ok(());
        }
        let path = self.blob_path(ns, id);

        if payload.is_in_memory() {
            let bytes = payload.to_bytes().await?;
            self.store.put(&path, PutPayload::from(bytes)).await?;
            return Ok(());
        }

        let upload = self.store.put_multipart(&path).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut stream = payload.stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    writer.abort().await?;
                    return Err(e);
                }
            };
            writer.wait_for_capacity(1).await?;
            writer.write(&chunk);
        }
        writer.finish().await?;
        tracing::debug!(namespace = %ns, blob = %id, "uploaded blob in parts");
        Ok(())
    }

    pub async fn get(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        allow_redirect: bool,
    ) -> Result<Option<StoreRead>> {
        let path = self.blob_path(ns, id);

        if allow_redirect {
            if let Some(signer) = &self.signer {
                if self.exists(ns, id).await? {
                    let uri = signer
                        .signed_url(axum::http::Method::GET, &path, REDIRECT_TTL)
                        .await?;
                    return Ok(Some(StoreRead::Redirect(uri)));
                }
                return Ok(None);
            }
        }

        Ok(self.read(&path).await?.map(StoreRead::Contents))
    }

    pub async fn exists(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        Ok(self.metadata(ns, id).await?.is_some())
    }

    pub async fn delete(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        if !self.exists(ns, id).await? {
            return Ok(false);
        }
        match self.store.delete(&self.blob_path(ns, id)).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn metadata(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobMetadata>> {
        match self.store.head(&self.blob_path(ns, id)).await {
            Ok(meta) => Ok(Some(BlobMetadata {
                length: meta.size,
                last_modified: meta.last_modified,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self, ns: &NamespaceId) -> BoxStream<'static, Result<StoredBlob>> {
        let store = self.store.clone();
        let prefix = self.namespace_path(ns);
        async_stream::try_stream! {
            let mut listing = store.list(Some(&prefix));
            while let Some(meta) = listing.next().await {
                let meta = meta.map_err(Error::from)?;
                let Some(id) = meta.location.filename().and_then(|n| n.parse::<BlobId>().ok()) else {
                    continue;
                };
                yield StoredBlob {
                    id,
                    length: meta.size,
                    last_modified: meta.last_modified,
                };
            }
        }
        .boxed()
    }

    pub async fn delete_namespace(&self, ns: &NamespaceId) -> Result<()> {
        self.delete_prefix(&self.namespace_path(ns)).await
    }
}

#[async_trait]
impl MultipartStore for ObjectStorageStore {
    async fn start_multipart_upload(&self, ns: &NamespaceId, blob_name: &str) -> Result<String> {
        check_component(blob_name)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.store
            .put(
                &self.upload_path(ns, &upload_id).child(UPLOAD_MARKER),
                PutPayload::from(Bytes::from(blob_name.to_string())),
            )
            .await?;
        Ok(upload_id)
    }

    async fn put_multipart_part(
        &self,
        ns: &NamespaceId,
        _blob_name: &str,
        upload_id: &str,
        part_id: &str,
        data: Bytes,
    ) -> Result<String> {
        check_component(upload_id)?;
        check_component(part_id)?;
        let dir = self.upload_path(ns, upload_id);
        match self.store.head(&dir.child(UPLOAD_MARKER)).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::Internal(format!("unknown multipart upload {}", upload_id)))
            }
            Err(e) => return Err(e.into()),
        }
        let etag = hex::encode(content_hash(&data));
        self.store.put(&dir.child(part_id), PutPayload::from(data)).await?;
        Ok(etag)
    }

    async fn list_multipart_parts(
        &self,
        ns: &NamespaceId,
        _blob_name: &str,
        upload_id: &str,
    ) -> Result<Vec<MultipartPart>> {
        check_component(upload_id)?;
        let listed: Vec<ObjectMeta> = self
            .store
            .list(Some(&self.upload_path(ns, upload_id)))
            .try_collect()
            .await?;
        let mut parts: Vec<MultipartPart> = listed
            .into_iter()
            .filter_map(|meta| {
                let part_id = meta.location.filename()?.to_string();
                if part_id.starts_with('.') {
                    return None;
                }
                Some(MultipartPart {
                    part_id,
                    etag: meta.e_tag.unwrap_or_default(),
                    length: meta.size,
                })
            })
            .collect();
        parts.sort_by(|a, b| a.part_id.cmp(&b.part_id));
        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        upload_id: &str,
        part_ids: &[String],
    ) -> Result<()> {
        check_component(upload_id)?;
        check_component(blob_name)?;
        for part_id in part_ids {
            check_component(part_id)?;
        }
        let dir = self.upload_path(ns, upload_id);

        let upload = self.store.put_multipart(&self.assembled_path(ns, blob_name)).await?;
        let mut writer = WriteMultipart::new(upload);
        let copied: Result<()> = async {
            for part_id in part_ids {
                let mut stream = self.store.get(&dir.child(part_id.as_str())).await?.into_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    writer.wait_for_capacity(1).await?;
                    writer.write(&chunk);
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = copied {
            writer.abort().await?;
            return Err(e);
        }
        writer.finish().await?;

        self.delete_prefix(&dir).await
    }

    async fn get_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
    ) -> Result<Option<BlobContents>> {
        check_component(blob_name)?;
        self.read(&self.assembled_path(ns, blob_name)).await
    }

    async fn rename_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        id: &BlobId,
    ) -> Result<()> {
        check_component(blob_name)?;
        let from = self.assembled_path(ns, blob_name);
        if self.exists(ns, id).await? {
            self.store.delete(&from).await?;
            return Ok(());
        }
        self.store.rename(&from, &self.blob_path(ns, id)).await?;
        Ok(())
    }

    async fn delete_multipart_blob(&self, ns: &NamespaceId, blob_name: &str) -> Result<()> {
        check_component(blob_name)?;
        match self.store.delete(&self.assembled_path(ns, blob_name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_exists() {
        let store = ObjectStorageStore::in_memory();
        let ns = NamespaceId::new("ddc-test").unwrap();
        let id = BlobId::from_blob(b"object");
        assert!(!store.exists(&ns, &id).await.unwrap());

        store.put(&ns, &id, &BlobPayload::from_bytes(&b"object"[..])).await.unwrap();
        assert!(store.exists(&ns, &id).await.unwrap());

        let Some(StoreRead::Contents(contents)) = store.get(&ns, &id, false).await.unwrap() else {
            panic!("expected contents");
        };
        assert_eq!(&contents.into_bytes().await.unwrap()[..], b"object");
    }

    #[tokio::test]
    async fn test_redirect_without_signer_streams() {
        let store = ObjectStorageStore::in_memory();
        let ns = NamespaceId::new("ddc-test").unwrap();
        let id = BlobId::from_blob(b"object");
        store.put(&ns, &id, &BlobPayload::from_bytes(&b"object"[..])).await.unwrap();
        assert!(matches!(
            store.get(&ns, &id, true).await.unwrap(),
            Some(StoreRead::Contents(_))
        ));
    }

    #[tokio::test]
    async fn test_spooled_payload_uses_multipart_writer() {
        let store = ObjectStorageStore::in_memory();
        let ns = NamespaceId::new("ddc-test").unwrap();
        let data = vec![7u8; 64 * 1024];
        let source = futures_util::stream::iter(
            data.chunks(4096)
                .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        )
        .boxed();
        let (payload, id) = BlobPayload::buffer(source, 1024).await.unwrap();
        assert!(!payload.is_in_memory());

        store.put(&ns, &id, &payload).await.unwrap();
        assert_eq!(store.metadata(&ns, &id).await.unwrap().unwrap().length, data.len() as u64);
    }

    #[tokio::test]
    async fn test_list_and_delete_namespace() {
        let store = ObjectStorageStore::in_memory();
        let ns = NamespaceId::new("ddc-test").unwrap();
        for body in [&b"one"[..], &b"two"[..]] {
            let id = BlobId::from_blob(body);
            store.put(&ns, &id, &BlobPayload::from_bytes(body)).await.unwrap();
        }
        let listed: Vec<StoredBlob> = store.list(&ns).try_collect().await.unwrap();
        assert_eq!(listed.len(), 2);

        store.delete_namespace(&ns).await.unwrap();
        let listed: Vec<StoredBlob> = store.list(&ns).try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_multipart_parts_assemble_and_rename() {
        let store = ObjectStorageStore::in_memory();
        let ns = NamespaceId::new("ddc-test").unwrap();
        let upload = store.start_multipart_upload(&ns, "multipart-test").await.unwrap();
        store
            .put_multipart_part(&ns, "multipart-test", &upload, "2", Bytes::from_static(b"world"))
            .await
            .unwrap();
        store
            .put_multipart_part(&ns, "multipart-test", &upload, "1", Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let parts = store.list_multipart_parts(&ns, "multipart-test", &upload).await.unwrap();
        let ids: Vec<&str> = parts.iter().map(|p| p.part_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        store
            .complete_multipart_upload(&ns, "multipart-test", &upload, &["1".into(), "2".into()])
            .await
            .unwrap();
        // parts are gone once assembled
        assert!(store
            .list_multipart_parts(&ns, "multipart-test", &upload)
            .await
            .unwrap()
            .is_empty());

        let assembled = store.get_multipart_blob(&ns, "multipart-test").await.unwrap().unwrap();
        assert_eq!(&assembled.into_bytes().await.unwrap()[..], b"hello world");

        let id = BlobId::from_blob(b"hello world");
        store.rename_multipart_blob(&ns, "multipart-test", &id).await.unwrap();
        assert!(store.exists(&ns, &id).await.unwrap());
        assert!(store.get_multipart_blob(&ns, "multipart-test").await.unwrap().is_none());

        // multipart bookkeeping never shows up as blobs
        let listed: Vec<StoredBlob> = store.list(&ns).try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_part_for_unknown_upload_rejected() {
        let store = ObjectStorageStore::in_memory();
        let ns = NamespaceId::new("ddc-test").unwrap();
        assert!(store
            .put_multipart_part(&ns, "multipart-test", "no-such-upload", "1", Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
