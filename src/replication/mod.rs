//! Cross-region replication: peer discovery, the peer client, credentials
//! presented to peers and the append-only replication log.

pub mod client;
pub mod log;
pub mod peers;

pub use client::{PeerFetch, ReplicationClient};
pub use log::{time_bucket, MemoryReplicationLog, ReplicationEvent, ReplicationLog};
pub use peers::{ConfiguredPeers, PeerEndpoint, PeerStatusService};

/// Source of the bearer token sent with peer requests
pub trait ServiceCredentials: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token from configuration (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

impl ServiceCredentials for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}
