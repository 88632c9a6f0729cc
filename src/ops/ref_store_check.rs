//! Ref store consistency check
//!
//! Backfills missing last-access times so garbage collection sees every ref.
//! For the configured namespaces it also asks every peer region whether the
//! blobs of each ref are present there; gaps are logged, not repaired.

use super::ConsistencyCheck;
use crate::blob::BlobService;
use crate::catalog::{iterate_refs, RefRecord, ReferencesStore};
use crate::common::config::RefStoreCheckConfig;
use crate::common::{BlobId, Result};
use crate::replication::PeerEndpoint;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefStoreReport {
    pub refs_checked: u64,
    pub last_access_backfilled: u64,
    /// (region, blob) pairs probed by the regional pass
    pub blobs_checked: u64,
    /// (region, blob) pairs the peer reported missing
    pub missing_in_regions: u64,
    pub failed: u64,
}

#[derive(Default)]
struct RefOutcome {
    backfilled: bool,
    blobs_checked: u64,
    missing: u64,
    failed: bool,
}

pub struct RefStoreConsistencyCheck {
    service: Arc<BlobService>,
    refs: Arc<dyn ReferencesStore>,
    settings: RefStoreCheckConfig,
}

impl RefStoreConsistencyCheck {
    pub fn new(
        service: Arc<BlobService>,
        refs: Arc<dyn ReferencesStore>,
        settings: RefStoreCheckConfig,
    ) -> Self {
        Self {
            service,
            refs,
            settings,
        }
    }

    /// One endpoint per peer region, the fastest
    fn peer_regions(&self) -> Vec<PeerEndpoint> {
        let peers = self.service.peers();
        let local = self.service.index().local_region();
        peers
            .regions()
            .into_iter()
            .filter(|r| r != local)
            .filter_map(|r| peers.ranked_peers(&[r]).into_iter().next())
            .collect()
    }

    async fn check_ref(&self, record: RefRecord, regional: &[PeerEndpoint]) -> RefOutcome {
        let mut outcome = RefOutcome::default();

        if record.last_access.is_none() {
            match self
                .refs
                .update_last_access(&record.namespace, &record.bucket, &record.key, Utc::now())
                .await
            {
                Ok(()) => outcome.backfilled = true,
                Err(e) => {
                    tracing::warn!(namespace = %record.namespace, bucket = %record.bucket, key = %record.key, error = %e, "failed to backfill last access");
                    outcome.failed = true;
                }
            }
        }

        if regional.is_empty() {
            return outcome;
        }

        let client = self.service.replication_client();
        let ns = &record.namespace;
        let probes = regional.iter().flat_map(|peer| {
            record
                .blobs
                .iter()
                .map(move |blob| async move { (peer, blob, client.exists_on_peer(peer, ns, blob).await) })
        });

        for (peer, blob, found) in join_all(probes).await {
            outcome.blobs_checked += 1;
            match found {
                Ok(true) => {}
                Ok(false) => {
                    outcome.missing += 1;
                    log_missing(&record, &peer.region, blob);
                }
                Err(e) => {
                    tracing::warn!(namespace = %record.namespace, region = %peer.region, blob = %blob, error = %e, "regional presence check failed");
                    outcome.failed = true;
                }
            }
        }
        outcome
    }
}

fn log_missing(record: &RefRecord, region: &str, blob: &BlobId) {
    tracing::warn!(
        namespace = %record.namespace,
        bucket = %record.bucket,
        key = %record.key,
        region,
        blob = %blob,
        "referenced blob missing in region"
    );
}

#[async_trait]
impl ConsistencyCheck for RefStoreConsistencyCheck {
    type Report = RefStoreReport;

    fn name(&self) -> &'static str {
        "ref-store"
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<RefStoreReport> {
        let mut report = RefStoreReport::default();
        let peers = self.peer_regions();

        for ns in self.refs.namespaces().await? {
            if cancel.is_cancelled() {
                break;
            }
            let regional: &[PeerEndpoint] = if self
                .settings
                .regional_consistency_namespaces
                .iter()
                .any(|n| n == ns.as_str())
            {
                &peers
            } else {
                &[]
            };

            let outcomes = iterate_refs(self.refs.clone(), ns.clone(), PAGE_SIZE)
                .take_until(cancel.cancelled())
                .map(|record| async move {
                    match record {
                        Ok(record) => Ok(self.check_ref(record, regional).await),
                        Err(e) => Err(e),
                    }
                })
                .buffer_unordered(self.settings.parallelism.max(1));
            let mut outcomes = std::pin::pin!(outcomes);

            while let Some(outcome) = outcomes.next().await {
                let outcome = outcome?;
                report.refs_checked += 1;
                report.last_access_backfilled += u64::from(outcome.backfilled);
                report.blobs_checked += outcome.blobs_checked;
                report.missing_in_regions += outcome.missing;
                report.failed += u64::from(outcome.failed);
            }
            tracing::debug!(namespace = %ns, refs = report.refs_checked, "checked refs");
        }
        Ok(report)
    }
}
