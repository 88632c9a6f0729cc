//! Physical store adapters
//!
//! Every backend exposes the same capability set (put, get, exists, delete,
//! list, metadata) and may additionally support multipart uploads. The set of
//! backends is closed: a [`StorageBackend`] layer dispatches to its
//! [`Backend`] adapter and carries the name the layer is known by.
//!
//! Stores are arranged per storage pool into an ordered [`StoreStack`]; the
//! last layer is the root (source of truth), the others are cache tiers.

pub mod filesystem;
pub mod memory;
pub mod object;
pub mod relay;

use crate::blob::payload::{BlobContents, BlobPayload};
use crate::common::config::{LayerConfig, StorageConfig};
use crate::common::{BlobId, Error, NamespaceId, Result, StoreConfig};
use crate::replication::ServiceCredentials;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use url::Url;

pub use filesystem::FileSystemStore;
pub use memory::MemoryStore;
pub use object::ObjectStorageStore;
pub use relay::RelayStore;

/// Size and age of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub length: u64,
    pub last_modified: DateTime<Utc>,
}

/// An entry produced by listing a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub id: BlobId,
    pub length: u64,
    pub last_modified: DateTime<Utc>,
}

/// Result of a successful store read
pub enum StoreRead {
    Contents(BlobContents),
    /// The caller may fetch the content directly from this URI
    Redirect(Url),
}

/// A part recorded for an in-flight multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub part_id: String,
    pub etag: String,
    pub length: u64,
}

/// Size constraints of a multipart-capable store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u32,
}

impl Default for MultipartLimits {
    fn default() -> Self {
        Self {
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 32 * 1024 * 1024,
            max_parts: 10_000,
        }
    }
}

/// Optional capability: chunked uploads assembled into a temp object that is
/// later renamed to its content-addressed location.
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Begin an upload of `blob_name`, returning the upload id
    async fn start_multipart_upload(&self, ns: &NamespaceId, blob_name: &str) -> Result<String>;

    /// Store one part, returning its etag
    async fn put_multipart_part(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        upload_id: &str,
        part_id: &str,
        data: Bytes,
    ) -> Result<String>;

    /// Parts recorded so far
    async fn list_multipart_parts(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        upload_id: &str,
    ) -> Result<Vec<MultipartPart>>;

    /// Assemble the parts, in the given order, into the temp object `blob_name`
    async fn complete_multipart_upload(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
        upload_id: &str,
        part_ids: &[String],
    ) -> Result<()>;

    /// Read the assembled temp object
    async fn get_multipart_blob(
        &self,
        ns: &NamespaceId,
        blob_name: &str,
    ) -> Result<Option<BlobContents>>;

    /// Move the temp object to the canonical location of `id`
    async fn rename_multipart_blob(&self, ns: &NamespaceId, blob_name: &str, id: &BlobId)
        -> Result<()>;

    async fn delete_multipart_blob(&self, ns: &NamespaceId, blob_name: &str) -> Result<()>;

    fn multipart_limits(&self) -> MultipartLimits {
        MultipartLimits::default()
    }
}

/// Upload ids, part ids and temp blob names become path segments
pub(crate) fn check_component(value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidId(format!("invalid multipart component: {}", value)))
    }
}

/// The concrete adapter behind a layer
pub enum Backend {
    Memory(MemoryStore),
    FileSystem(FileSystemStore),
    Object(ObjectStorageStore),
    Relay(RelayStore),
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::FileSystem(_) => "filesystem",
            Backend::Object(_) => "object",
            Backend::Relay(_) => "relay",
        }
    }
}

/// One layer of a store stack: a physical backend and the name it goes by
pub struct StorageBackend {
    name: String,
    backend: Backend,
}

impl From<Backend> for StorageBackend {
    fn from(backend: Backend) -> Self {
        Self {
            name: backend.kind().to_string(),
            backend,
        }
    }
}

impl From<MemoryStore> for StorageBackend {
    fn from(store: MemoryStore) -> Self {
        Backend::Memory(store).into()
    }
}

impl From<FileSystemStore> for StorageBackend {
    fn from(store: FileSystemStore) -> Self {
        Backend::FileSystem(store).into()
    }
}

impl From<ObjectStorageStore> for StorageBackend {
    fn from(store: ObjectStorageStore) -> Self {
        Backend::Object(store).into()
    }
}

impl From<RelayStore> for StorageBackend {
    fn from(store: RelayStore) -> Self {
        Backend::Relay(store).into()
    }
}

impl StorageBackend {
    /// Replace the default name (the backend kind)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Layer name used for logging, the `x-jupiter-layer` header and
    /// `storage_layers` filters
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Write the blob; writing content that is already present is a no-op
    pub async fn put(&self, ns: &NamespaceId, id: &BlobId, payload: &BlobPayload) -> Result<()> {
        match &self.backend {
            Backend::Memory(s) => s.put(ns, id, payload).await,
            Backend::FileSystem(s) => s.put(ns, id, payload).await,
            Backend::Object(s) => s.put(ns, id, payload).await,
            Backend::Relay(s) => s.put(ns, id, payload).await,
        }
    }

    /// Read the blob, or a redirect to it when `allow_redirect` is set and
    /// the backend can produce one
    pub async fn get(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        allow_redirect: bool,
    ) -> Result<Option<StoreRead>> {
        let read = match &self.backend {
            Backend::Memory(s) => s.get(ns, id).await?.map(StoreRead::Contents),
            Backend::FileSystem(s) => s.get(ns, id).await?.map(StoreRead::Contents),
            Backend::Object(s) => s.get(ns, id, allow_redirect).await?,
            Backend::Relay(s) => s.get(ns, id).await?.map(StoreRead::Contents),
        };
        Ok(read.map(|r| match r {
            StoreRead::Contents(c) => StoreRead::Contents(c.with_layer(self.name())),
            redirect => redirect,
        }))
    }

    pub async fn exists(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        match &self.backend {
            Backend::Memory(s) => s.exists(ns, id).await,
            Backend::FileSystem(s) => s.exists(ns, id).await,
            Backend::Object(s) => s.exists(ns, id).await,
            Backend::Relay(s) => s.exists(ns, id).await,
        }
    }

    /// Delete the blob, returning whether it existed
    pub async fn delete(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        match &self.backend {
            Backend::Memory(s) => s.delete(ns, id).await,
            Backend::FileSystem(s) => s.delete(ns, id).await,
            Backend::Object(s) => s.delete(ns, id).await,
            Backend::Relay(s) => s.delete(ns, id).await,
        }
    }

    pub fn list(&self, ns: &NamespaceId) -> BoxStream<'static, Result<StoredBlob>> {
        match &self.backend {
            Backend::Memory(s) => s.list(ns),
            Backend::FileSystem(s) => s.list(ns),
            Backend::Object(s) => s.list(ns),
            Backend::Relay(s) => s.list(ns),
        }
    }

    pub async fn metadata(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobMetadata>> {
        match &self.backend {
            Backend::Memory(s) => s.metadata(ns, id).await,
            Backend::FileSystem(s) => s.metadata(ns, id).await,
            Backend::Object(s) => s.metadata(ns, id).await,
            Backend::Relay(s) => s.metadata(ns, id).await,
        }
    }

    pub async fn delete_namespace(&self, ns: &NamespaceId) -> Result<()> {
        match &self.backend {
            Backend::Memory(s) => s.delete_namespace(ns).await,
            Backend::FileSystem(s) => s.delete_namespace(ns).await,
            Backend::Object(s) => s.delete_namespace(ns).await,
            Backend::Relay(s) => s.delete_namespace(ns).await,
        }
    }

    /// The multipart capability, if this backend has it
    pub fn as_multipart(&self) -> Option<&dyn MultipartStore> {
        match &self.backend {
            Backend::Memory(s) => Some(s),
            Backend::FileSystem(s) => Some(s),
            Backend::Object(s) => Some(s),
            Backend::Relay(_) => None,
        }
    }

    pub fn from_config(
        config: &LayerConfig,
        credentials: Arc<dyn ServiceCredentials>,
    ) -> Result<Self> {
        let backend = match &config.store {
            StoreConfig::Memory => Backend::Memory(MemoryStore::new()),
            StoreConfig::FileSystem { path } => {
                Backend::FileSystem(FileSystemStore::new(path.clone()))
            }
            StoreConfig::Object {
                url,
                allow_redirects,
            } => Backend::Object(ObjectStorageStore::from_url(url, *allow_redirects)?),
            StoreConfig::Relay { url } => Backend::Relay(RelayStore::new(url, credentials)?),
        };
        let layer = StorageBackend::from(backend);
        Ok(match &config.name {
            Some(name) => layer.named(name.clone()),
            None => layer,
        })
    }
}

/// Ordered store layers; the last one is the root
#[derive(Clone)]
pub struct StoreStack {
    layers: Vec<Arc<StorageBackend>>,
}

impl StoreStack {
    pub fn new(layers: Vec<StorageBackend>) -> Result<Self> {
        Self::from_shared(layers.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(layers: Vec<Arc<StorageBackend>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::InvalidConfig("a store stack needs at least one layer".into()));
        }
        for (i, layer) in layers.iter().enumerate() {
            if layers[..i].iter().any(|l| l.name() == layer.name()) {
                tracing::warn!(layer = layer.name(), "several layers share a name; name them to tell them apart");
            }
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Arc<StorageBackend>] {
        &self.layers
    }

    pub fn root(&self) -> &Arc<StorageBackend> {
        // non-empty by construction
        &self.layers[self.layers.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers whose name is in `names`, keeping the stack order
    pub fn filtered(&self, names: Option<&[String]>) -> Vec<Arc<StorageBackend>> {
        match names {
            None => self.layers.clone(),
            Some(names) => self
                .layers
                .iter()
                .filter(|l| names.iter().any(|n| n.eq_ignore_ascii_case(l.name())))
                .cloned()
                .collect(),
        }
    }

    /// The store that takes multipart uploads: the capable layer closest to the root
    pub fn multipart_layer(&self) -> Option<&Arc<StorageBackend>> {
        self.layers.iter().rev().find(|l| l.as_multipart().is_some())
    }
}

/// Store stacks for every storage pool
#[derive(Clone, Default)]
pub struct StorageLayout {
    pools: HashMap<String, Arc<StoreStack>>,
}

impl StorageLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: impl Into<String>, stack: StoreStack) -> Self {
        self.pools.insert(pool.into(), Arc::new(stack));
        self
    }

    pub fn from_config(
        config: &StorageConfig,
        credentials: Arc<dyn ServiceCredentials>,
    ) -> Result<Self> {
        let mut layout = Self::new();
        for (pool, layers) in &config.pools {
            let backends = layers
                .iter()
                .map(|l| StorageBackend::from_config(l, credentials.clone()))
                .collect::<Result<Vec<_>>>()?;
            let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
            tracing::info!(pool = %pool, layers = ?names, "configured storage pool");
            layout = layout.with_pool(pool.clone(), StoreStack::new(backends)?);
        }
        Ok(layout)
    }

    pub fn stack(&self, pool: &str) -> Result<Arc<StoreStack>> {
        self.pools
            .get(pool)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("unknown storage pool: {}", pool)))
    }

    pub fn pools(&self) -> impl Iterator<Item = (&String, &Arc<StoreStack>)> {
        self.pools.iter()
    }
}

/// Holder of the current layout; a reload swaps the whole value
#[derive(Default)]
pub struct LayoutHandle {
    current: RwLock<Arc<StorageLayout>>,
}

impl LayoutHandle {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            current: RwLock::new(Arc::new(layout)),
        }
    }

    /// Snapshot used for the duration of one request
    pub fn snapshot(&self) -> Result<Arc<StorageLayout>> {
        self.current
            .read()
            .map(|l| l.clone())
            .map_err(|_| Error::Internal("storage layout lock poisoned".into()))
    }

    pub fn replace(&self, layout: StorageLayout) -> Result<()> {
        *self
            .current
            .write()
            .map_err(|_| Error::Internal("storage layout lock poisoned".into()))? =
            Arc::new(layout);
        Ok(())
    }
}
