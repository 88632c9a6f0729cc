//! Re-readable blob bodies
//!
//! A store write needs its own reader over the content, so a one-shot stream
//! is buffered once (hashing as it goes) and then handed to every layer.
//! Small payloads stay in memory, larger ones are spooled to a temp file.

use crate::common::{BlobId, ContentHasher, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Stream of blob bytes as produced by stores and peers
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Content read from a store layer
pub struct BlobContents {
    pub length: u64,
    pub stream: ByteStream,
    /// Name of the layer that served the read, when known
    pub layer: Option<String>,
}

impl BlobContents {
    pub fn from_bytes(bytes: Bytes) -> Self {
        let length = bytes.len() as u64;
        Self {
            length,
            stream: stream::once(async move { Ok(bytes) }).boxed(),
            layer: None,
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    /// Collect the whole stream
    pub async fn into_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.length as usize);
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for BlobContents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobContents")
            .field("length", &self.length)
            .field("layer", &self.layer)
            .finish()
    }
}

#[derive(Clone)]
enum PayloadInner {
    Memory(Bytes),
    Spooled(Arc<TempPath>),
}

/// Blob body that can be read any number of times
#[derive(Clone)]
pub struct BlobPayload {
    inner: PayloadInner,
    length: u64,
}

impl BlobPayload {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            length: bytes.len() as u64,
            inner: PayloadInner::Memory(bytes),
        }
    }

    /// Drain `stream` into a re-readable payload, hashing while copying.
    ///
    /// Content beyond `memory_limit` bytes is spooled to a temp file.
    pub async fn buffer(mut stream: ByteStream, memory_limit: u64) -> Result<(Self, BlobId)> {
        let mut hasher = ContentHasher::new();
        let mut buf = BytesMut::new();
        let mut spool: Option<(tokio::fs::File, TempPath)> = None;
        let mut length = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            length += chunk.len() as u64;

            match spool.as_mut() {
                Some((file, _)) => file.write_all(&chunk).await?,
                None => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() as u64 > memory_limit {
                        let (std_file, path) = tempfile::NamedTempFile::new()?.into_parts();
                        let mut file = tokio::fs::File::from_std(std_file);
                        file.write_all(&buf).await?;
                        buf.clear();
                        spool = Some((file, path));
                    }
                }
            }
        }

        let id = BlobId::from_hasher(&hasher);
        let payload = match spool {
            Some((mut file, path)) => {
                file.flush().await?;
                tracing::debug!(length, "spooled payload to {:?}", &*path);
                Self {
                    inner: PayloadInner::Spooled(Arc::new(path)),
                    length,
                }
            }
            None => Self::from_bytes(buf.freeze()),
        };
        Ok((payload, id))
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.inner, PayloadInner::Memory(_))
    }

    /// A fresh, independent reader over the content
    pub fn stream(&self) -> ByteStream {
        match &self.inner {
            PayloadInner::Memory(bytes) => {
                let bytes = bytes.clone();
                stream::once(async move { Ok(bytes) }).boxed()
            }
            PayloadInner::Spooled(path) => {
                let path = path.clone();
                let open = async move {
                    let file = tokio::fs::File::open(&**path).await?;
                    // the reader owns the temp path so the file outlives the payload
                    let reader = ReaderStream::new(file).map(move |chunk| {
                        let _keep = &path;
                        chunk.map_err(crate::Error::from)
                    });
                    Ok::<_, crate::Error>(reader)
                };
                stream::once(open).try_flatten().boxed()
            }
        }
    }

    /// The whole content in memory
    pub async fn to_bytes(&self) -> Result<Bytes> {
        match &self.inner {
            PayloadInner::Memory(bytes) => Ok(bytes.clone()),
            PayloadInner::Spooled(path) => Ok(Bytes::from(tokio::fs::read(&**path).await?)),
        }
    }

    /// Hash of the content
    pub async fn hash(&self) -> Result<BlobId> {
        match &self.inner {
            PayloadInner::Memory(bytes) => Ok(BlobId::from_blob(bytes)),
            PayloadInner::Spooled(_) => {
                let mut hasher = ContentHasher::new();
                let mut stream = self.stream();
                while let Some(chunk) = stream.next().await {
                    hasher.update(&chunk?);
                }
                Ok(BlobId::from_hasher(&hasher))
            }
        }
    }

    pub fn to_contents(&self) -> BlobContents {
        BlobContents {
            length: self.length,
            stream: self.stream(),
            layer: None,
        }
    }
}

impl std::fmt::Debug for BlobPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobPayload")
            .field("length", &self.length)
            .field("in_memory", &self.is_in_memory())
            .finish()
    }
}

impl From<Bytes> for BlobPayload {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for BlobPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&'static [u8]> for BlobPayload {
    fn from(bytes: &'static [u8]) -> Self {
        Self::from_bytes(Bytes::from_static(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: Vec<&'static [u8]>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p)))).boxed()
    }

    #[tokio::test]
    async fn test_buffer_in_memory() {
        let (payload, id) = BlobPayload::buffer(chunked(vec![&b"hel"[..], &b"lo"[..]]), 1024)
            .await
            .unwrap();
        assert!(payload.is_in_memory());
        assert_eq!(payload.len(), 5);
        assert_eq!(id, BlobId::from_blob(b"hello"));
        assert_eq!(payload.to_bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_buffer_spools_and_rereads() {
        let (payload, id) = BlobPayload::buffer(chunked(vec![&b"0123456789"[..], &b"abcdef"[..]]), 4)
            .await
            .unwrap();
        assert!(!payload.is_in_memory());
        assert_eq!(id, BlobId::from_blob(b"0123456789abcdef"));

        // every reader sees the whole content
        for _ in 0..2 {
            let bytes = payload.to_contents().into_bytes().await.unwrap();
            assert_eq!(&bytes[..], b"0123456789abcdef");
        }
        assert_eq!(payload.hash().await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(crate::Error::Internal("boom".into())),
        ])
        .boxed();
        assert!(BlobPayload::buffer(failing, 1024).await.is_err());
    }
}
