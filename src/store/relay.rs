//! Store layer that forwards to another instance's blob API
//!
//! Requests always carry `allowOndemandReplication=false` so the upstream
//! never turns a relay miss into a replication round trip.

use super::{BlobMetadata, StoredBlob};
use crate::blob::payload::{BlobContents, BlobPayload};
use crate::common::{encode_segment, retry_with_backoff, BlobId, Error, NamespaceId, Result};
use crate::replication::ServiceCredentials;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const PUT_ATTEMPTS: usize = 3;

pub struct RelayStore {
    client: Client,
    base: Url,
    credentials: Arc<dyn ServiceCredentials>,
}

impl RelayStore {
    pub fn new(base: &str, credentials: Arc<dyn ServiceCredentials>) -> Result<Self> {
        let base = base
            .parse::<Url>()
            .map_err(|e| Error::InvalidConfig(format!("invalid relay url {}: {}", base, e)))?;
        Ok(Self {
            client: Client::new(),
            base,
            credentials,
        })
    }

    fn blob_url(&self, ns: &NamespaceId, id: &BlobId) -> Result<Url> {
        let mut url = self
            .base
            .join(&format!(
                "api/v1/blobs/{}/{}",
                encode_segment(ns.as_str()),
                id
            ))
            .map_err(|e| Error::Internal(format!("relay url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("allowOndemandReplication", "false");
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check_status(status: StatusCode, what: &str) -> Result<()> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::TooManyRequests(format!("relay {}", what)));
        }
        if !status.is_success() {
            return Err(Error::Internal(format!("relay {} answered {}", what, status)));
        }
        Ok(())
    }

    /// Upload the payload, retrying throttled or dropped requests
    pub async fn put(&self, ns: &NamespaceId, id: &BlobId, payload: &BlobPayload) -> Result<()> {
        let url = &self.blob_url(ns, id)?;
        retry_with_backoff(
            move || async move {
                let response = self
                    .authorize(self.client.put(url.clone()))
                    .header(reqwest::header::CONTENT_LENGTH, payload.len())
                    .body(reqwest::Body::wrap_stream(payload.stream()))
                    .send()
                    .await?;
                Self::check_status(response.status(), "put")
            },
            PUT_ATTEMPTS,
            Duration::from_millis(100),
        )
        .await
    }

    pub async fn get(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobContents>> {
        let response = self
            .authorize(self.client.get(self.blob_url(ns, id)?))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(response.status(), "get")?;
        let length = response.content_length().unwrap_or(0);
        Ok(Some(BlobContents {
            length,
            stream: response.bytes_stream().map_err(Error::from).boxed(),
            layer: None,
        }))
    }

    pub async fn exists(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        Ok(self.metadata(ns, id).await?.is_some())
    }

    pub async fn delete(&self, ns: &NamespaceId, id: &BlobId) -> Result<bool> {
        let response = self
            .authorize(self.client.delete(self.blob_url(ns, id)?))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_status(response.status(), "delete")?;
        Ok(true)
    }

    pub async fn metadata(&self, ns: &NamespaceId, id: &BlobId) -> Result<Option<BlobMetadata>> {
        let response = self
            .authorize(self.client.head(self.blob_url(ns, id)?))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(response.status(), "head")?;
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        // HEAD responses have no body, so read the header rather than the size hint
        let length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Some(BlobMetadata {
            length,
            last_modified,
        }))
    }

    /// The upstream blob API cannot enumerate a namespace
    pub fn list(&self, _ns: &NamespaceId) -> BoxStream<'static, Result<StoredBlob>> {
        stream::empty().boxed()
    }

    pub async fn delete_namespace(&self, ns: &NamespaceId) -> Result<()> {
        tracing::warn!(namespace = %ns, "namespace deletion is not forwarded through a relay layer");
        Ok(())
    }
}
