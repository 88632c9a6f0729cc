//! Blob service: the store stack used as a read-through / write-through cache
//!
//! Reads walk the layers in order and warm the layers above a hit. A miss
//! everywhere falls back to the fallback namespace, then to on-demand
//! replication from a peer region. Writes go to every layer in order, the
//! root last; a failed cache write is skipped, a failed root write fails the
//! put.

use crate::access::{AllowAll, NamespaceAccess, Principal};
use crate::blob::payload::{BlobContents, BlobPayload, ByteStream};
use crate::common::{format_bytes, BlobId, BucketId, Error, NamespaceId, ReplicationFailure, Result};
use crate::index::{iterate_all, BlobIndex};
use crate::policy::{NamespacePolicy, NamespacePolicyResolver};
use crate::replication::{
    ConfiguredPeers, MemoryReplicationLog, PeerFetch, PeerStatusService, ReplicationClient,
    ReplicationLog, ServiceCredentials, StaticToken,
};
use crate::store::{
    BlobMetadata, LayoutHandle, StorageBackend, StoreRead, StoreStack, StoredBlob,
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;

/// How many fallback hops a single request may follow
const MAX_FALLBACK_DEPTH: usize = 4;

/// Concurrency of bulk existence checks
const EXISTS_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Only consult the layers with these names
    pub storage_layers: Option<Vec<String>>,
    /// Accept a redirect URI instead of the content
    pub supports_redirect_uri: bool,
    /// Fetch from a peer region on a local miss (when the policy allows it)
    pub allow_on_demand_replication: bool,
    pub bucket_hint: Option<BucketId>,
    /// Read the root layer only
    pub bypass_cache: bool,
    /// Caller identity, checked against the fallback namespace
    pub principal: Option<Principal>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            storage_layers: None,
            supports_redirect_uri: false,
            allow_on_demand_replication: true,
            bucket_hint: None,
            bypass_cache: false,
            principal: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub bucket_hint: Option<BucketId>,
    /// Write the root layer only
    pub bypass_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExistsOptions {
    pub storage_layers: Option<Vec<String>>,
    /// Do not trust the index for blobs held by other regions
    pub ignore_remote_blobs: bool,
}

pub struct BlobService {
    layout: Arc<LayoutHandle>,
    policies: Arc<dyn NamespacePolicyResolver>,
    index: Arc<dyn BlobIndex>,
    peers: Arc<dyn PeerStatusService>,
    replication: ReplicationClient,
    replication_log: Arc<dyn ReplicationLog>,
    access: Arc<dyn NamespaceAccess>,
    buffer_limit: u64,
}

pub struct BlobServiceBuilder {
    layout: Arc<LayoutHandle>,
    policies: Arc<dyn NamespacePolicyResolver>,
    index: Arc<dyn BlobIndex>,
    peers: Option<Arc<dyn PeerStatusService>>,
    credentials: Option<Arc<dyn ServiceCredentials>>,
    replication_log: Option<Arc<dyn ReplicationLog>>,
    access: Option<Arc<dyn NamespaceAccess>>,
    request_timeout: Duration,
    buffer_limit: u64,
}

impl BlobServiceBuilder {
    pub fn peers(mut self, peers: Arc<dyn PeerStatusService>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn ServiceCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn replication_log(mut self, log: Arc<dyn ReplicationLog>) -> Self {
        self.replication_log = Some(log);
        self
    }

    pub fn access(mut self, access: Arc<dyn NamespaceAccess>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn buffer_in_memory_limit(mut self, limit: u64) -> Self {
        self.buffer_limit = limit;
        self
    }

    pub fn build(self) -> Result<BlobService> {
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(StaticToken::default()));
        Ok(BlobService {
            layout: self.layout,
            policies: self.policies,
            index: self.index,
            peers: self
                .peers
                .unwrap_or_else(|| Arc::new(ConfiguredPeers::new(Vec::new()))),
            replication: ReplicationClient::new(self.request_timeout, credentials)?,
            replication_log: self
                .replication_log
                .unwrap_or_else(|| Arc::new(MemoryReplicationLog::new())),
            access: self.access.unwrap_or_else(|| Arc::new(AllowAll)),
            buffer_limit: self.buffer_limit,
        })
    }
}

impl BlobService {
    pub fn builder(
        layout: Arc<LayoutHandle>,
        policies: Arc<dyn NamespacePolicyResolver>,
        index: Arc<dyn BlobIndex>,
    ) -> BlobServiceBuilder {
        BlobServiceBuilder {
            layout,
            policies,
            index,
            peers: None,
            credentials: None,
            replication_log: None,
            access: None,
            request_timeout: Duration::from_secs(60),
            buffer_limit: 8 * 1024 * 1024,
        }
    }

    pub fn index(&self) -> &Arc<dyn BlobIndex> {
        &self.index
    }

    pub fn policies(&self) -> &Arc<dyn NamespacePolicyResolver> {
        &self.policies
    }

    pub fn peers(&self) -> &Arc<dyn PeerStatusService> {
        &self.peers
    }

    pub fn replication_client(&self) -> &ReplicationClient {
        &self.replication
    }

    pub fn layout(&self) -> &Arc<LayoutHandle> {
        &self.layout
    }

    pub fn buffer_limit(&self) -> u64 {
        self.buffer_limit
    }

    /// Policy and store stack of a namespace, from the current snapshots
    pub(crate) fn resolve(&self, ns: &NamespaceId) -> Result<(NamespacePolicy, Arc<StoreStack>)> {
        let policy = self.policies.get_policy(ns)?;
        let stack = self.layout.snapshot()?.stack(&policy.storage_pool)?;
        Ok((policy, stack))
    }

    // === Put ===

    /// Buffer `stream` and store it under `id`
    pub async fn put_stream(
        &self,
        ns: &NamespaceId,
        stream: ByteStream,
        id: &BlobId,
        opts: &PutOptions,
    ) -> Result<BlobId> {
        let (payload, actual) = BlobPayload::buffer(stream, self.buffer_limit).await?;
        self.put_inner(ns, &payload, id, Some(actual), opts, 0).await
    }

    pub async fn put_bytes(
        &self,
        ns: &NamespaceId,
        bytes: Bytes,
        id: &BlobId,
        opts: &PutOptions,
    ) -> Result<BlobId> {
        self.put(ns, &BlobPayload::from_bytes(bytes), id, opts).await
    }

    pub async fn put(
        &self,
        ns: &NamespaceId,
        payload: &BlobPayload,
        id: &BlobId,
        opts: &PutOptions,
    ) -> Result<BlobId> {
        self.put_inner(ns, payload, id, None, opts, 0).await
    }

    fn put_inner<'a>(
        &'a self,
        ns: &'a NamespaceId,
        payload: &'a BlobPayload,
        id: &'a BlobId,
        known_hash: Option<BlobId>,
        opts: &'a PutOptions,
        depth: usize,
    ) -> BoxFuture<'a, Result<BlobId>> {
        async move {
            let (policy, stack) = self.resolve(ns)?;

            if policy.use_content_addressed_storage {
                let actual = match known_hash {
                    Some(hash) => hash,
                    None => payload.hash().await?,
                };
                if actual != *id {
                    tracing::warn!(namespace = %ns, blob = %id, %actual, "rejecting put with mismatching hash");
                    return Err(Error::HashMismatch {
                        expected: *id,
                        actual,
                    });
                }
            }

            let layers: Vec<Arc<StorageBackend>> = if opts.bypass_cache {
                vec![stack.root().clone()]
            } else {
                stack.layers().to_vec()
            };

            let writes = async {
                let last = layers.len() - 1;
                for (i, layer) in layers.iter().enumerate() {
                    match layer.put(ns, id, payload).await {
                        Ok(()) => {
                            tracing::trace!(namespace = %ns, blob = %id, layer = layer.name(), "stored blob")
                        }
                        Err(e) if i < last => {
                            tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "cache layer write failed, skipping");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            };
            let log = self.replication_log.insert_add_event(ns, id, Utc::now());

            let (written, logged) = tokio::join!(writes, log);
            written?;
            if let Err(e) = logged {
                tracing::warn!(namespace = %ns, blob = %id, error = %e, "failed to append replication event");
            }

            self.index.add_blob_to_index(ns, id, None).await?;
            tracing::debug!(namespace = %ns, blob = %id, bytes = payload.len(), "put blob");

            if policy.populate_fallback_namespace_on_upload && depth < MAX_FALLBACK_DEPTH {
                if let Some(fallback) = policy.fallback_namespace.as_ref().filter(|f| *f != ns) {
                    self.put_inner(fallback, payload, id, Some(*id), opts, depth + 1)
                        .await?;
                }
            }

            Ok(*id)
        }
        .boxed()
    }

    // === Get ===

    pub async fn get(&self, ns: &NamespaceId, id: &BlobId, opts: &GetOptions) -> Result<StoreRead> {
        self.get_inner(ns, id, opts, 0).await
    }

    /// Read the whole blob into memory
    pub async fn get_bytes(&self, ns: &NamespaceId, id: &BlobId) -> Result<Bytes> {
        match self.get(ns, id, &GetOptions::default()).await? {
            StoreRead::Contents(contents) => contents.into_bytes().await,
            StoreRead::Redirect(_) => Err(Error::Internal("unexpected redirect".into())),
        }
    }

    fn get_inner<'a>(
        &'a self,
        ns: &'a NamespaceId,
        id: &'a BlobId,
        opts: &'a GetOptions,
        depth: usize,
    ) -> BoxFuture<'a, Result<StoreRead>> {
        async move {
            let (policy, stack) = self.resolve(ns)?;
            let layers = if opts.bypass_cache {
                vec![stack.root().clone()]
            } else {
                stack.filtered(opts.storage_layers.as_deref())
            };
            let allow_redirect = opts.supports_redirect_uri && policy.allow_redirect_uris;
            let verify = policy.use_content_addressed_storage;

            if let Some(read) = self.read_through(ns, id, &layers, allow_redirect, verify).await? {
                return Ok(read);
            }

            let fallback = policy
                .fallback_namespace
                .as_ref()
                .filter(|f| *f != ns && depth < MAX_FALLBACK_DEPTH);

            if let Some(fallback) = fallback {
                if let Some(principal) = &opts.principal {
                    self.access.authorize_read(principal, fallback)?;
                }
                let read = match self.get_inner(fallback, id, opts, depth + 1).await {
                    Ok(read) => read,
                    Err(e) if e.is_not_found() => return Err(Error::blob_not_found(ns, id)),
                    Err(e) => return Err(e),
                };
                let contents = match read {
                    StoreRead::Contents(contents) => contents,
                    redirect => return Ok(redirect),
                };

                tracing::debug!(namespace = %ns, fallback = %fallback, blob = %id, "populating from fallback namespace");
                let (payload, actual) = BlobPayload::buffer(contents.stream, self.buffer_limit).await?;
                match self
                    .put_inner(ns, &payload, id, Some(actual), &PutOptions::default(), depth)
                    .await
                {
                    Ok(_) => {}
                    Err(e @ Error::HashMismatch { .. }) => return Err(e),
                    Err(e) => {
                        // the fallback read succeeded; serve it even if the primary stays cold
                        tracing::warn!(namespace = %ns, fallback = %fallback, blob = %id, error = %e, "failed to populate primary namespace");
                        return Ok(StoreRead::Contents(payload.to_contents()));
                    }
                }

                // one retry against the primary namespace, no further fallback
                if let Some(read) = self.read_through(ns, id, &layers, allow_redirect, verify).await? {
                    return Ok(read);
                }
                return Ok(StoreRead::Contents(payload.to_contents()));
            }

            if policy.on_demand_replication && opts.allow_on_demand_replication {
                match self
                    .replicate_object(ns, id, false, opts.bucket_hint.as_ref())
                    .await
                {
                    Ok(()) => {}
                    Err(Error::BlobReplication {
                        reason:
                            ReplicationFailure::NoRegions
                            | ReplicationFailure::NoPeers
                            | ReplicationFailure::NotFoundOnPeers,
                        ..
                    }) => return Err(Error::blob_not_found(ns, id)),
                    Err(e) => return Err(e),
                }
                if let Some(read) = self.read_through(ns, id, &layers, allow_redirect, verify).await? {
                    return Ok(read);
                }
            }

            Err(Error::blob_not_found(ns, id))
        }
        .boxed()
    }

    /// Walk `layers` until one has the blob, then warm the layers before it
    async fn read_through(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        layers: &[Arc<StorageBackend>],
        allow_redirect: bool,
        verify: bool,
    ) -> Result<Option<StoreRead>> {
        let mut misses = 0usize;
        let mut throttled: Option<Error> = None;

        for (k, layer) in layers.iter().enumerate() {
            let contents = match layer.get(ns, id, allow_redirect).await {
                Ok(Some(StoreRead::Contents(contents))) => contents,
                Ok(Some(redirect)) => return Ok(Some(redirect)),
                Ok(None) => {
                    misses += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "layer read failed, trying next");
                    misses += 1;
                    if matches!(e, Error::TooManyRequests(_)) {
                        throttled = Some(e);
                    }
                    continue;
                }
            };

            if k == 0 {
                return Ok(Some(StoreRead::Contents(contents)));
            }

            tracing::debug!(namespace = %ns, blob = %id, layer = layer.name(), misses, "hit below cache layers");
            match self.populate_upper(ns, id, contents, &layers[..k], verify).await {
                Ok(contents) => return Ok(Some(StoreRead::Contents(contents))),
                Err(e) => {
                    tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "layer read failed, trying next");
                    misses += 1;
                }
            }
        }

        match throttled {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Buffer `contents` and write it to `upper`; write failures are only logged
    async fn populate_upper(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        contents: BlobContents,
        upper: &[Arc<StorageBackend>],
        verify: bool,
    ) -> Result<BlobContents> {
        let source = contents.layer.clone();
        let (payload, actual) = BlobPayload::buffer(contents.stream, self.buffer_limit).await?;
        if verify && actual != *id {
            return Err(Error::Corrupted(format!(
                "{} in {} hashes to {}",
                id, ns, actual
            )));
        }

        for layer in upper {
            if let Err(e) = layer.put(ns, id, &payload).await {
                tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "failed to populate cache layer");
            }
        }

        let mut contents = payload.to_contents();
        contents.layer = source;
        Ok(contents)
    }

    // === Exists ===

    pub async fn exists(&self, ns: &NamespaceId, id: &BlobId, opts: &ExistsOptions) -> Result<bool> {
        self.exists_inner(ns, id, opts, 0).await
    }

    fn exists_inner<'a>(
        &'a self,
        ns: &'a NamespaceId,
        id: &'a BlobId,
        opts: &'a ExistsOptions,
        depth: usize,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            let (policy, stack) = self.resolve(ns)?;

            let found = if policy.use_blob_index_for_exists && opts.storage_layers.is_none() {
                self.index.blob_exists_in_region(ns, id, None).await?
            } else {
                let mut found = false;
                for layer in stack.filtered(opts.storage_layers.as_deref()) {
                    match layer.exists(ns, id).await {
                        Ok(true) => {
                            found = true;
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "layer exists check failed");
                        }
                    }
                }
                found
            };
            if found {
                return Ok(true);
            }

            if let Some(fallback) = policy
                .fallback_namespace
                .as_ref()
                .filter(|f| *f != ns && depth < MAX_FALLBACK_DEPTH)
            {
                if self.exists_inner(fallback, id, opts, depth + 1).await? {
                    return Ok(true);
                }
            }

            if policy.on_demand_replication && !opts.ignore_remote_blobs {
                return self.exists_in_remote(ns, id).await;
            }
            Ok(false)
        }
        .boxed()
    }

    /// Trust the index: two or more regions, or any region other than ours,
    /// counts as present. The peer itself is not contacted.
    pub async fn exists_in_remote(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        let regions = match self.index.get_blob_regions(ns, id).await {
            Ok(regions) => regions,
            Err(Error::BlobNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let local = self.index.local_region();
        Ok(regions.len() >= 2 || regions.iter().any(|r| r != local))
    }

    /// Does the root layer hold the blob?
    pub async fn exists_in_root(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        let (_, stack) = self.resolve(ns)?;
        stack.root().exists(ns, id).await
    }

    /// Ids from `ids` that do not exist
    pub async fn filter_out_known_blobs(
        &self,
        ns: &NamespaceId,
        ids: &[BlobId],
    ) -> Result<Vec<BlobId>> {
        let opts = ExistsOptions::default();
        let checked: Vec<(BlobId, bool)> = stream::iter(ids.iter().copied())
            .map(|id| {
                let opts = &opts;
                async move { self.exists(ns, &id, opts).await.map(|found| (id, found)) }
            })
            .buffered(EXISTS_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(checked
            .into_iter()
            .filter(|(_, found)| !found)
            .map(|(id, _)| id)
            .collect())
    }

    // === Delete ===

    /// Forget the blob in the index, then delete it from every layer
    pub async fn delete(&self, ns: &NamespaceId, id: &BlobId) -> Result<()> {
        let (_, stack) = self.resolve(ns)?;

        self.index.remove_references(ns, id, None).await?;
        self.index.remove_blob_from_region(ns, id, None).await?;

        let mut deleted = false;
        for layer in stack.layers() {
            match layer.delete(ns, id).await {
                Ok(true) => deleted = true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "layer delete failed");
                }
            }
        }

        if deleted {
            tracing::debug!(namespace = %ns, blob = %id, "deleted blob");
            Ok(())
        } else {
            Err(Error::blob_not_found(ns, id))
        }
    }

    /// Delete from each namespace; succeeds if any namespace held the blob
    pub async fn delete_in_namespaces(&self, namespaces: &[NamespaceId], id: &BlobId) -> Result<()> {
        let mut any_known = false;
        let mut deleted = false;
        for ns in namespaces {
            match self.delete(ns, id).await {
                Ok(()) => {
                    any_known = true;
                    deleted = true;
                }
                Err(Error::NamespaceNotFound(_)) => {}
                Err(Error::BlobNotFound { .. }) => any_known = true,
                Err(e) => return Err(e),
            }
        }

        match (deleted, any_known, namespaces.first()) {
            (true, _, _) => Ok(()),
            (false, true, Some(ns)) => Err(Error::blob_not_found(ns, id)),
            (false, false, Some(ns)) => Err(Error::NamespaceNotFound(ns.clone())),
            (false, _, None) => Err(Error::InvalidId("no namespaces given".into())),
        }
    }

    /// Remove every blob of a namespace from the stores and the index
    pub async fn delete_namespace(&self, ns: &NamespaceId) -> Result<()> {
        let (_, stack) = self.resolve(ns)?;
        for layer in stack.layers() {
            layer.delete_namespace(ns).await?;
        }

        let mut entries = iterate_all(self.index.clone(), 500);
        let mut removed = 0usize;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.namespace == *ns {
                self.index
                    .remove_blob_from_all_regions(&entry.namespace, &entry.id)
                    .await?;
                removed += 1;
            }
        }
        tracing::info!(namespace = %ns, index_entries = removed, "deleted namespace");
        Ok(())
    }

    // === Metadata & listing ===

    /// Length and age of the blob from the first layer that has it
    pub async fn get_object_metadata(&self, ns: &NamespaceId, id: &BlobId) -> Result<BlobMetadata> {
        let (_, stack) = self.resolve(ns)?;
        for layer in stack.layers() {
            match layer.metadata(ns, id).await {
                Ok(Some(meta)) => return Ok(meta),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(namespace = %ns, blob = %id, layer = layer.name(), error = %e, "layer metadata failed");
                }
            }
        }
        Err(Error::blob_not_found(ns, id))
    }

    /// Blobs held by the root layer
    pub fn list_objects(&self, ns: &NamespaceId) -> Result<BoxStream<'static, Result<StoredBlob>>> {
        let (_, stack) = self.resolve(ns)?;
        Ok(stack.root().list(ns))
    }

    // === Replication ===

    /// Fetch the blob from the fastest peer region that has it and store it
    /// locally. Without `force`, only namespaces with on-demand replication
    /// enabled are replicated.
    pub async fn replicate_object(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        force: bool,
        bucket_hint: Option<&BucketId>,
    ) -> Result<()> {
        let (policy, _) = self.resolve(ns)?;
        if !force && !policy.on_demand_replication {
            return Err(Error::blob_not_found(ns, id));
        }

        let regions = match self.index.get_blob_regions(ns, id).await {
            Ok(regions) => regions,
            Err(Error::BlobNotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let local = self.index.local_region();
        let remote: Vec<String> = regions.into_iter().filter(|r| r != local).collect();
        if remote.is_empty() {
            return Err(Error::replication(ns, id, ReplicationFailure::NoRegions));
        }

        let peers = self.peers.ranked_peers(&remote);
        if peers.is_empty() {
            return Err(Error::replication(ns, id, ReplicationFailure::NoPeers));
        }

        let mut transport_error: Option<String> = None;
        for peer in &peers {
            let contents = match self.replication.fetch(peer, ns, id).await {
                Ok(PeerFetch::Found(contents)) => contents,
                Ok(PeerFetch::NotFound) => {
                    tracing::debug!(namespace = %ns, blob = %id, region = %peer.region, "peer does not have blob");
                    continue;
                }
                Err(Error::BlobReplication {
                    reason: ReplicationFailure::Transport(msg),
                    ..
                }) => {
                    tracing::warn!(namespace = %ns, blob = %id, region = %peer.region, error = %msg, "peer unreachable");
                    transport_error = Some(msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (payload, actual) = match BlobPayload::buffer(contents.stream, self.buffer_limit).await {
                Ok(buffered) => buffered,
                Err(e) => {
                    tracing::warn!(namespace = %ns, blob = %id, region = %peer.region, error = %e, "peer stream failed");
                    transport_error = Some(e.to_string());
                    continue;
                }
            };

            let opts = PutOptions {
                bucket_hint: bucket_hint.cloned(),
                bypass_cache: false,
            };
            self.put_inner(ns, &payload, id, Some(actual), &opts, 0).await?;
            tracing::info!(namespace = %ns, blob = %id, region = %peer.region, size = %format_bytes(payload.len()), "replicated blob from peer");
            return Ok(());
        }

        let reason = match transport_error {
            Some(msg) => ReplicationFailure::Transport(msg),
            None => ReplicationFailure::NotFoundOnPeers,
        };
        Err(Error::replication(ns, id, reason))
    }
}
