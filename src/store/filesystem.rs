//! Local filesystem store
//!
//! Layout:
//! - Blobs: `<root>/<ns>/<first 4 hex>/<id>`
//! - Multipart parts: `<root>/<ns>/.multipart/<upload id>/<part id>`
//! - Assembled multipart objects: `<root>/<ns>/.multipart/blobs/<blob name>`
//!
//! Writes go to a dot-prefixed temp file in the target directory and are
//! renamed into place, so a reader never sees a partial blob.

use super::{check_component, BlobMetadata, MultipartPart, MultipartStore, StoredBlob};
use crate::blob::payload::{BlobContents, BlobPayload};
use crate::common::{blob_prefix, BlobId, Error, NamespaceId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

const MULTIPART_DIR: &str = ".multipart";
const ASSEMBLED_DIR: &str = "blobs";

pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a namespace; the name must be a single normal path component
    fn namespace_dir(&self, ns: &NamespaceId) -> Result<PathBuf> {
        let mut components = Path::new(ns.as_str()).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if !is_hidden(Path::new(name)) => {
                Ok(self.root.join(name))
            }
            _ => Err(Error::InvalidId(format!(
                "namespace {} is not a valid directory name",
                ns
            ))),
        }
    }

    fn blob_path(&self, ns: &NamespaceId, id: &BlobId) -> Result<PathBuf> {
        let hex = id.to_hex();
        Ok(self.namespace_dir(ns)?.join(blob_prefix(&hex)).join(&hex))
    }

    fn upload_dir(&self, ns: &NamespaceId, upload_id: &str) -> Result<PathBuf> {
        Ok(self.namespace_dir(ns)?.join(MULTIPART_DIR).join(upload_id))
    }

    fn assembled_path(&self, ns: &NamespaceId, blob_name: &str) -> Result<PathBuf> {
        Ok(self
            .namespace_dir(ns)?
            .join(MULTIPART_DIR)
            .join(ASSEMBLED_DIR)
            .join(blob_name))
    }

    /// Write `stream` to `path` through a temp file in the same directory
    async fn write_atomic(path: &Path, mut stream: crate::blob::payload::ByteStream) -> Result<u64> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("no parent directory for {:?}", path)))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let mut written = 0u64;
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok::<_, Error>(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result.map(|_| written)
    }

    async fn open_contents(path: &Path) -> Result<Option<BlobContents>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let length = file.metadata().await?.len();
        Ok(Some(BlobContents {
            length,
            stream: ReaderStream::new(file).map_err(Error::from).boxed(),
            layer: None,
        }))
    }

    pub async fn put(&self, ns: &NamespaceId, id: &BlobId, payload: &BlobPayload) -> Result<()> {
        let path = self.blob_path(ns, id)?;
        if self.exists(ns, id).await? {
            return Ok(());
        }
        let written = Self::write_atomic(&path, payload.stream()).await?;
        tracing::debug!(namespace = %ns, blob = %id, bytes = written, "wrote blob to {:?}", path);
        Ok(())
    }

    pub async fn get(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobContents>> {
        Self::open_contents(&self.blob_path(ns, id)?).await
    }

    pub async fn exists(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        Ok(self.metadata(ns, id).await?.is_some())
    }

    pub async fn delete(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        match tokio::fs::remove_file(self.blob_path(ns, id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn metadata(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobMetadata>> {
        match tokio::fs::metadata(self.blob_path(ns, id)?).await {
            Ok(meta) if meta.is_file() => Ok(Some(BlobMetadata {
                length: meta.len(),
                last_modified: meta.modified().map(DateTime::<Utc>::from)?,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self, ns: &NamespaceId) -> BoxStream<'static, Result<StoredBlob>> {
        let ns_dir = self.namespace_dir(ns);
        async_stream::try_stream! {
            let ns_dir = ns_dir?;
            let mut prefixes = match tokio::fs::read_dir(&ns_dir).await {
                Ok(dir) => Some(dir),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => Err(Error::from(e))?,
            };
            while let Some(prefix) = match prefixes.as_mut() {
                Some(dir) => dir.next_entry().await.map_err(Error::from)?,
                None => None,
            } {
                if is_hidden(&prefix.path()) || !prefix.file_type().await.map_err(Error::from)?.is_dir() {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(prefix.path()).await.map_err(Error::from)?;
                while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
                    let name = entry.file_name();
                    let Some(id) = name.to_str().and_then(|n| n.parse::<BlobId>().ok()) else {
                        continue;
                    };
                    let meta = entry.metadata().await.map_err(Error::from)?;
                    yield StoredBlob {
                        id,
                        length: meta.len(),
                        last_modified: meta.modified().map(DateTime::<Utc>::from).map_err(Error::from)?,
                    };
                }
            }
        }
        .boxed()
    }

    pub async fn delete_namespace(&self, ns: &NamespaceId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.namespace_dir(ns)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Part ids become file names, so they are restricted to a safe alphabet
#[async_trait]
impl MultipartStore for FileSystemStore {
    async fn start_multipart_upload(&self, ns: &NamespaceId, blob_name: &str) -> Result<String> {
        check_component(blob_name)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.upload_dir(ns, &upload_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(".blob_name"), blob_name.as_bytes()).await?;
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
        let dir = self.upload_dir(ns, upload_id)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(Error::Internal(format!("unknown multipart upload {}", upload_id)));
        }
        let etag = hex::encode(crate::common::content_hash(&data));
        let body = futures_util::stream::once(async move { Ok(data) }).boxed();
        Self::write_atomic(&dir.join(part_id), body).await?;
        Ok(etag)
    }

    async fn list_multipart_parts(
        &self,
        ns: &NamespaceId,
        _blob_name: &str,
        upload_id: &str,
    ) -> Result<Vec<MultipartPart>> {
        check_component(upload_id)?;
        let mut entries = tokio::fs::read_dir(self.upload_dir(ns, upload_id)?).await?;
        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if is_hidden(&entry.path()) {
                continue;
            }
            let data = tokio::fs::read(entry.path()).await?;
            parts.push(MultipartPart {
                part_id: entry.file_name().to_string_lossy().into_owned(),
                etag: hex::encode(crate::common::content_hash(&data)),
                length: data.len() as u64,
            });
        }
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
        let dir = self.upload_dir(ns, upload_id)?;
        let paths: Vec<PathBuf> = part_ids
            .iter()
            .map(|p| check_component(p).map(|_| dir.join(p)))
            .collect::<Result<_>>()?;

        let parts = futures_util::stream::iter(paths)
            .then(|path| async move { tokio::fs::File::open(path).await })
            .map_ok(ReaderStream::new)
            .try_flatten()
            .map_err(Error::from)
            .boxed();
        Self::write_atomic(&self.assembled_path(ns, blob_name)?, parts).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn get_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
    ) -> Result<Option<BlobContents>> {
        check_component(blob_name)?;
        Self::open_contents(&self.assembled_path(ns, blob_name)?).await
    }

    async fn rename_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        id: &BlobId,
    ) -> Result<()> {
        check_component(blob_name)?;
        let from = self.assembled_path(ns, blob_name)?;
        let to = self.blob_path(ns, id)?;
        if self.exists(ns, id).await? {
            tokio::fs::remove_file(&from).await?;
            return Ok(());
        }
        if let Some(dir) = to.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn delete_multipart_blob(&self, ns: &NamespaceId, blob_name: &str) -> Result<()> {
        check_component(blob_name)?;
        match tokio::fs::remove_file(self.assembled_path(ns, blob_name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileSystemStore, NamespaceId) {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStore::new(dir.path().to_path_buf());
        (dir, store, NamespaceId::new("ddc-test").unwrap())
    }

    #[tokio::test]
    async fn test_layout_uses_hex_prefix() {
        let (dir, store, ns) = setup();
        let id = BlobId::from_blob(b"payload");
        store.put(&ns, &id, &BlobPayload::from_bytes(&b"payload"[..])).await.unwrap();

        let hex = id.to_hex();
        let expected = dir.path().join("ddc-test").join(&hex[..4]).join(&hex);
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, store, ns) = setup();
        let id = BlobId::from_blob(b"payload");
        assert!(store.get(&ns, &id).await.unwrap().is_none());

        store.put(&ns, &id, &BlobPayload::from_bytes(&b"payload"[..])).await.unwrap();
        // second put of the same content is a no-op
        store.put(&ns, &id, &BlobPayload::from_bytes(&b"payload"[..])).await.unwrap();

        let contents = store.get(&ns, &id).await.unwrap().unwrap();
        assert_eq!(contents.length, 7);
        assert_eq!(&contents.into_bytes().await.unwrap()[..], b"payload");

        assert!(store.delete(&ns, &id).await.unwrap());
        assert!(!store.exists(&ns, &id).await.unwrap());
        assert!(!store.delete(&ns, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_skips_multipart_and_temp_files() {
        let (_dir, store, ns) = setup();
        let a = BlobId::from_blob(b"a");
        let b = BlobId::from_blob(b"b");
        store.put(&ns, &a, &BlobPayload::from_bytes(&b"a"[..])).await.unwrap();
        store.put(&ns, &b, &BlobPayload::from_bytes(&b"b"[..])).await.unwrap();
        store.start_multipart_upload(&ns, "multipart-x").await.unwrap();

        let mut listed: Vec<BlobId> = store
            .list(&ns)
            .map_ok(|s| s.id)
            .try_collect()
            .await
            .unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_list_missing_namespace_is_empty() {
        let (_dir, store, _) = setup();
        let other = NamespaceId::new("nothing-here").unwrap();
        let listed: Vec<StoredBlob> = store.list(&other).try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_root_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // a regular file cannot act as a directory
        let store = FileSystemStore::new(file.path().to_path_buf());
        let ns = NamespaceId::new("ns").unwrap();
        let id = BlobId::from_blob(b"z");
        assert!(store.put(&ns, &id, &BlobPayload::from_bytes(&b"z"[..])).await.is_err());
    }

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let (_dir, store, ns) = setup();
        let upload = store.start_multipart_upload(&ns, "multipart-1").await.unwrap();
        store
            .put_multipart_part(&ns, "multipart-1", &upload, "0", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        store
            .put_multipart_part(&ns, "multipart-1", &upload, "1", Bytes::from_static(b"def"))
            .await
            .unwrap();
        let parts = store.list_multipart_parts(&ns, "multipart-1", &upload).await.unwrap();
        assert_eq!(
            parts.iter().map(|p| p.part_id.as_str()).collect::<Vec<_>>(),
            vec!["0", "1"]
        );

        store
            .complete_multipart_upload(&ns, "multipart-1", &upload, &["0".into(), "1".into()])
            .await
            .unwrap();
        let data = store
            .get_multipart_blob(&ns, "multipart-1")
            .await
            .unwrap()
            .unwrap()
            .into_bytes()
            .await
            .unwrap();
        assert_eq!(&data[..], b"abcdef");

        let id = BlobId::from_blob(&data);
        store.rename_multipart_blob(&ns, "multipart-1", &id).await.unwrap();
        assert!(store.exists(&ns, &id).await.unwrap());
        assert!(store.get_multipart_blob(&ns, "multipart-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_dir, store, ns) = setup();
        assert!(store.start_multipart_upload(&ns, "../escape").await.is_err());
    }
}
