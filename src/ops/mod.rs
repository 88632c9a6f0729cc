//! Background consistency checks
//!
//! Each check runs on its own timer, only on the elected leader, and scans
//! page by page so the full index is never held in memory.

pub mod blob_index_check;
pub mod leader;
pub mod ref_store_check;

pub use blob_index_check::{BlobIndexConsistencyCheck, BlobIndexReport};
pub use leader::{LeaderElection, StaticLeader};
pub use ref_store_check::{RefStoreConsistencyCheck, RefStoreReport};

use crate::common::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ConsistencyCheck: Send + Sync + 'static {
    type Report: std::fmt::Debug + Send;

    fn name(&self) -> &'static str;

    /// One full pass; stops early once `cancel` fires
    async fn run_once(&self, cancel: &CancellationToken) -> Result<Self::Report>;
}

/// Run `check` every `interval` while this instance is the leader.
///
/// Returns `None` when the check is disabled. The first pass is delayed by a
/// random fraction of the interval so restarted fleets do not scan in step.
pub fn spawn_periodic<C: ConsistencyCheck>(
    check: Arc<C>,
    enabled: bool,
    interval: Duration,
    leader: Arc<dyn LeaderElection>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !enabled {
        tracing::info!(check = check.name(), "consistency check disabled");
        return None;
    }

    let interval = interval.max(Duration::from_millis(1));
    Some(tokio::spawn(async move {
        let jitter_ms = rand::random::<u64>() % (interval.as_millis() as u64).max(1);
        let start = tokio::time::Instant::now() + Duration::from_millis(jitter_ms);
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !leader.is_leader() {
                tracing::debug!(check = check.name(), "not the leader, skipping");
                continue;
            }

            let started = tokio::time::Instant::now();
            match check.run_once(&cancel).await {
                Ok(report) => tracing::info!(
                    check = check.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ?report,
                    "consistency check finished"
                ),
                Err(e) => tracing::error!(check = check.name(), error = %e, "consistency check failed"),
            }
        }
        tracing::debug!(check = check.name(), "consistency check stopped");
    }))
}
