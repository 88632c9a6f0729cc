//! Replication log
//!
//! Add-blob events are grouped into five minute buckets named
//! `YYYY-MM-DDTHH:MM` so a peer can catch up bucket by bucket.

use crate::common::{BlobId, Error, NamespaceId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

const BUCKET_MINUTES: i64 = 5;

/// Bucket name for `timestamp`
pub fn time_bucket(timestamp: DateTime<Utc>) -> String {
    timestamp
        .duration_trunc(Duration::minutes(BUCKET_MINUTES))
        .unwrap_or(timestamp)
        .format("%Y-%m-%dT%H:%M")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    pub namespace: NamespaceId,
    pub blob: BlobId,
    pub timestamp: DateTime<Utc>,
    pub bucket: String,
    pub event_id: uuid::Uuid,
}

#[async_trait]
pub trait ReplicationLog: Send + Sync {
    /// Append an add-blob event
    async fn insert_add_event(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        timestamp: DateTime<Utc>,
    ) -> Result<ReplicationEvent>;

    /// Events of one namespace within one time bucket, in append order
    async fn events(&self, ns: &NamespaceId, bucket: &str) -> Result<Vec<ReplicationEvent>>;

    /// Known buckets of a namespace, oldest first
    async fn buckets(&self, ns: &NamespaceId) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct MemoryReplicationLog {
    events: Mutex<BTreeMap<(NamespaceId, String), Vec<ReplicationEvent>>>,
}

impl MemoryReplicationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(NamespaceId, String), Vec<ReplicationEvent>>>>
    {
        self.events
            .lock()
            .map_err(|_| Error::Internal("replication log lock poisoned".into()))
    }
}

#[async_trait]
impl ReplicationLog for MemoryReplicationLog {
    async fn insert_add_event(
        &self,
        ns: &NamespaceId,
        id: &BlobId,
        timestamp: DateTime<Utc>,
    ) -> Result<ReplicationEvent> {
        let event = ReplicationEvent {
            namespace: ns.clone(),
            blob: *id,
            timestamp,
            bucket: time_bucket(timestamp),
            event_id: uuid::Uuid::new_v4(),
        };
        self.lock()?
            .entry((ns.clone(), event.bucket.clone()))
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    async fn events(&self, ns: &NamespaceId, bucket: &str) -> Result<Vec<ReplicationEvent>> {
        Ok(self
            .lock()?
            .get(&(ns.clone(), bucket.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn buckets(&self, ns: &NamespaceId) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, b)| b.clone())
            .collect())
    }
}
