//! Wiring of the blob subsystem from configuration

use crate::blob::{BlobService, MultipartCoordinator};
use crate::catalog::{MemoryContentIdStore, MemoryReferencesStore, ReferencesStore};
use crate::common::config::IndexConfig;
use crate::common::{Config, Result};
use crate::http::{create_router, AppState};
use crate::index::{BlobIndex, MemoryBlobIndex, RocksBlobIndex};
use crate::ops::{spawn_periodic, BlobIndexConsistencyCheck, RefStoreConsistencyCheck, StaticLeader};
use crate::policy::ConfigPolicyResolver;
use crate::replication::{ConfiguredPeers, ServiceCredentials, StaticToken};
use crate::store::{LayoutHandle, StorageLayout};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a running instance shares between the API and background jobs
pub struct Services {
    pub blobs: Arc<BlobService>,
    pub multipart: Arc<MultipartCoordinator>,
    pub policies: Arc<ConfigPolicyResolver>,
    pub peers: Arc<ConfiguredPeers>,
    pub refs: Arc<dyn ReferencesStore>,
    pub leader: Arc<StaticLeader>,
    credentials: Arc<dyn ServiceCredentials>,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let credentials: Arc<dyn ServiceCredentials> =
            Arc::new(StaticToken::new(config.replication.token.clone()));
        let layout = StorageLayout::from_config(&config.storage, credentials.clone())?;
        let policies = Arc::new(ConfigPolicyResolver::from_config(config)?);
        let peers = Arc::new(ConfiguredPeers::from_config(&config.replication)?);

        let index: Arc<dyn BlobIndex> = match &config.index {
            IndexConfig::Memory => Arc::new(MemoryBlobIndex::new(config.site.clone())),
            IndexConfig::RocksDb { path } => {
                tracing::info!(path = %path.display(), "opening blob index");
                Arc::new(RocksBlobIndex::open(path, config.site.clone())?)
            }
        };

        let blobs = Arc::new(
            BlobService::builder(Arc::new(LayoutHandle::new(layout)), policies.clone(), index)
                .peers(peers.clone())
                .credentials(credentials.clone())
                .request_timeout(config.replication.request_timeout)
                .buffer_in_memory_limit(config.storage.buffer_in_memory_limit)
                .build()?,
        );
        let multipart = Arc::new(MultipartCoordinator::new(
            blobs.clone(),
            Arc::new(MemoryContentIdStore::new()),
        ));

        Ok(Self {
            blobs,
            multipart,
            policies,
            peers,
            refs: Arc::new(MemoryReferencesStore::new()),
            leader: Arc::new(StaticLeader::new(config.consistency.leader)),
            credentials,
        })
    }

    /// Swap in the policies, storage layout and leadership of `config`.
    /// Requests in flight keep the snapshots they started with.
    pub fn reload(&self, config: &Config) -> Result<()> {
        let layout = StorageLayout::from_config(&config.storage, self.credentials.clone())?;
        self.policies.reload(config)?;
        self.blobs.layout().replace(layout)?;
        self.leader.set_leader(config.consistency.leader);
        tracing::info!("configuration reloaded");
        Ok(())
    }
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Serve the HTTP API and run the background jobs until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;
        let services = Services::from_config(&config)?;

        let mut jobs = Vec::new();
        jobs.push(services.peers.clone().spawn_prober(
            services.blobs.replication_client().http_client().clone(),
            config.replication.probe_interval,
            shutdown.child_token(),
        ));

        let consistency = &config.consistency;
        jobs.extend(spawn_periodic(
            Arc::new(BlobIndexConsistencyCheck::new(
                services.blobs.clone(),
                consistency.blob_index.clone(),
            )),
            consistency.blob_index.enabled,
            consistency.blob_index.interval,
            services.leader.clone(),
            shutdown.child_token(),
        ));
        jobs.extend(spawn_periodic(
            Arc::new(RefStoreConsistencyCheck::new(
                services.blobs.clone(),
                services.refs.clone(),
                consistency.ref_store.clone(),
            )),
            consistency.ref_store.enabled,
            consistency.ref_store.interval,
            services.leader.clone(),
            shutdown.child_token(),
        ));

        let router = create_router(AppState {
            blobs: services.blobs.clone(),
        });
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        tracing::info!(addr = %config.bind_addr, site = %config.site, "blob service ready");

        let stop = shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await?;

        shutdown.cancel();
        for job in jobs {
            if let Err(e) = job.await {
                tracing::warn!(error = %e, "background job ended abnormally");
            }
        }
        tracing::info!("blob service stopped");
        Ok(())
    }
}
