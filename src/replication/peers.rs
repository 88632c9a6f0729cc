//! Peer regions and their measured latency

use crate::common::config::ReplicationConfig;
use crate::common::{Error, Result};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Latency assigned to endpoints that have never answered a probe
const UNKNOWN_LATENCY: Duration = Duration::from_secs(3600);

/// One reachable endpoint of a peer region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub region: String,
    pub url: Url,
    pub latency: Duration,
}

pub trait PeerStatusService: Send + Sync {
    /// Every known peer region
    fn regions(&self) -> Vec<String>;

    /// Endpoints serving any of `regions`, fastest first
    fn ranked_peers(&self, regions: &[String]) -> Vec<PeerEndpoint>;
}

/// Peers listed in configuration; latencies are refreshed by [`ConfiguredPeers::probe`]
pub struct ConfiguredPeers {
    endpoints: RwLock<Arc<Vec<PeerEndpoint>>>,
}

impl ConfiguredPeers {
    pub fn new(endpoints: Vec<PeerEndpoint>) -> Self {
        Self {
            endpoints: RwLock::new(Arc::new(endpoints)),
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Result<Self> {
        let mut endpoints = Vec::new();
        for peer in &config.peers {
            for endpoint in &peer.endpoints {
                let url = endpoint.parse::<Url>().map_err(|e| {
                    Error::InvalidConfig(format!("invalid peer endpoint {}: {}", endpoint, e))
                })?;
                endpoints.push(PeerEndpoint {
                    region: peer.region.clone(),
                    url,
                    latency: peer
                        .latency_ms
                        .map(Duration::from_millis)
                        .unwrap_or(UNKNOWN_LATENCY),
                });
            }
        }
        Ok(Self::new(endpoints))
    }

    fn snapshot(&self) -> Arc<Vec<PeerEndpoint>> {
        match self.endpoints.read() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Measure every endpoint with `GET /health/live` and publish new latencies
    pub async fn probe(&self, client: &reqwest::Client) {
        let current = self.snapshot();
        let mut updated = Vec::with_capacity(current.len());

        for endpoint in current.iter() {
            let mut endpoint = endpoint.clone();
            let started = Instant::now();
            let healthy = match endpoint.url.join("health/live") {
                Ok(url) => matches!(
                    client.get(url).send().await,
                    Ok(resp) if resp.status().is_success()
                ),
                Err(_) => false,
            };
            endpoint.latency = if healthy {
                started.elapsed()
            } else {
                tracing::debug!(region = %endpoint.region, url = %endpoint.url, "peer probe failed");
                UNKNOWN_LATENCY
            };
            updated.push(endpoint);
        }

        match self.endpoints.write() {
            Ok(mut guard) => *guard = Arc::new(updated),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(updated),
        }
    }

    /// Probe on a fixed interval until `cancel` fires
    pub fn spawn_prober(
        self: Arc<Self>,
        client: reqwest::Client,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.probe(&client).await,
                }
            }
            tracing::debug!("peer prober stopped");
        })
    }
}

impl PeerStatusService for ConfiguredPeers {
    fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self.snapshot().iter().map(|e| e.region.clone()).collect();
        regions.sort();
        regions.dedup();
        regions
    }

    fn ranked_peers(&self, regions: &[String]) -> Vec<PeerEndpoint> {
        let mut peers: Vec<PeerEndpoint> = self
            .snapshot()
            .iter()
            .filter(|e| regions.contains(&e.region))
            .cloned()
            .collect();
        peers.sort_by_key(|e| e.latency);
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::PeerConfig;

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            peers: vec![
                PeerConfig {
                    region: "eu-west".into(),
                    endpoints: vec!["http://eu-west.example:8080/".into()],
                    latency_ms: Some(90),
                },
                PeerConfig {
                    region: "us-west".into(),
                    endpoints: vec!["http://us-west.example:8080/".into()],
                    latency_ms: Some(20),
                },
                PeerConfig {
                    region: "ap-south".into(),
                    endpoints: vec!["http://ap-south.example:8080/".into()],
                    latency_ms: None,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_ranked_by_latency() {
        let peers = ConfiguredPeers::from_config(&config()).unwrap();
        let ranked = peers.ranked_peers(&[
            "eu-west".to_string(),
            "us-west".to_string(),
            "ap-south".to_string(),
        ]);
        let regions: Vec<_> = ranked.iter().map(|p| p.region.as_str()).collect();
        assert_eq!(regions, vec!["us-west", "eu-west", "ap-south"]);
    }

    #[test]
    fn test_filters_regions() {
        let peers = ConfiguredPeers::from_config(&config()).unwrap();
        let ranked = peers.ranked_peers(&["eu-west".to_string()]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(peers.regions().len(), 3);
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let mut cfg = config();
        cfg.peers[0].endpoints = vec!["not a url".into()];
        assert!(ConfiguredPeers::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_probe_marks_unreachable_peers_slow() {
        let peers = ConfiguredPeers::new(vec![PeerEndpoint {
            region: "nowhere".into(),
            // port 1 on loopback refuses connections
            url: "http://127.0.0.1:1/".parse().unwrap(),
            latency: Duration::from_millis(1),
        }]);
        peers.probe(&reqwest::Client::new()).await;
        assert_eq!(peers.ranked_peers(&["nowhere".to_string()])[0].latency, UNKNOWN_LATENCY);
    }
}
