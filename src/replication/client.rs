//! HTTP client for fetching blobs from peer regions
//!
//! Every request sets `allowOndemandReplication=false`: a peer that lacks the
//! blob must answer 404 rather than start its own replication, otherwise a
//! miss could bounce around the peer mesh.

use super::peers::PeerEndpoint;
use super::ServiceCredentials;
use crate::blob::payload::BlobContents;
use crate::common::{encode_segment, BlobId, Error, NamespaceId, ReplicationFailure, Result};
use futures_util::stream::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Outcome of asking one peer for a blob
pub enum PeerFetch {
    Found(BlobContents),
    NotFound,
}

#[derive(Clone)]
pub struct ReplicationClient {
    client: reqwest::Client,
    credentials: Arc<dyn ServiceCredentials>,
}

impl ReplicationClient {
    pub fn new(timeout: Duration, credentials: Arc<dyn ServiceCredentials>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// `{base}/api/v1/blobs/{ns}/{id}?allowOndemandReplication=false`
    pub fn blob_url(base: &Url, ns: &NamespaceId, id: &BlobId) -> Result<Url> {
        let mut url = base
            .join(&format!(
                "api/v1/blobs/{}/{}",
                encode_segment(ns.as_str()),
                id
            ))
            .map_err(|e| Error::Internal(format!("peer url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("allowOndemandReplication", "false");
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET the blob from one peer. 200 streams the body, 404 is `NotFound`,
    /// anything else is a replication failure.
    pub async fn fetch(&self, peer: &PeerEndpoint, ns: &NamespaceId, id: &BlobId) -> Result<PeerFetch> {
        let url = Self::blob_url(&peer.url, ns, id)?;
        tracing::debug!(region = %peer.region, %url, "fetching blob from peer");

        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| Error::replication(ns, id, ReplicationFailure::Transport(e.to_string())))?;

        match response.status() {
            StatusCode::OK => {
                let length = response.content_length().unwrap_or(0);
                Ok(PeerFetch::Found(BlobContents {
                    length,
                    stream: response.bytes_stream().map_err(Error::from).boxed(),
                    layer: Some(format!("peer:{}", peer.region)),
                }))
            }
            StatusCode::NOT_FOUND => Ok(PeerFetch::NotFound),
            status => Err(Error::replication(
                ns,
                id,
                ReplicationFailure::PeerStatus(status.as_u16()),
            )),
        }
    }

    /// HEAD the blob on one peer
    pub async fn exists_on_peer(
        &self,
        peer: &PeerEndpoint,
        ns: &NamespaceId,
        id: &BlobId,
    ) -> Result<bool> {
        let url = Self::blob_url(&peer.url, ns, id)?;
        let response = self
            .request(reqwest::Method::HEAD, url)
            .send()
            .await
            .map_err(|e| Error::replication(ns, id, ReplicationFailure::Transport(e.to_string())))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::replication(
                ns,
                id,
                ReplicationFailure::PeerStatus(status.as_u16()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_url_disables_on_demand_replication() {
        let base: Url = "http://peer.example:8080/".parse().unwrap();
        let ns = NamespaceId::new("ddc test").unwrap();
        let id = BlobId::from_blob(b"hello");
        let url = ReplicationClient::blob_url(&base, &ns, &id).unwrap();
        assert_eq!(
            url.as_str(),
            format!(
                "http://peer.example:8080/api/v1/blobs/ddc%20test/{}?allowOndemandReplication=false",
                id
            )
        );
    }

    #[test]
    fn test_blob_url_keeps_base_path() {
        let base: Url = "http://peer.example/jupiter/".parse().unwrap();
        let ns = NamespaceId::new("ns").unwrap();
        let id = BlobId::from_blob(b"x");
        let url = ReplicationClient::blob_url(&base, &ns, &id).unwrap();
        assert!(url.path().starts_with("/jupiter/api/v1/blobs/ns/"));
    }
}
