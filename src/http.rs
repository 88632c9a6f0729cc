//! HTTP API: the blob endpoints peers replicate from, plus health checks

use crate::blob::{BlobService, ExistsOptions, GetOptions, PutOptions};
use crate::common::{BlobId, Error, NamespaceId};
use crate::store::StoreRead;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub blobs: Arc<BlobService>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobQuery {
    #[serde(default = "default_true")]
    allow_ondemand_replication: bool,
    #[serde(default)]
    supports_redirect_uri: bool,
    /// Comma separated layer names
    #[serde(default)]
    storage_layers: Option<String>,
    #[serde(default)]
    bypass_cache: bool,
}

fn default_true() -> bool {
    true
}

impl BlobQuery {
    fn storage_layers(&self) -> Option<Vec<String>> {
        self.storage_layers.as_ref().map(|layers| {
            layers
                .split(',')
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
    }
}

fn parse_path(ns: &str, id: &str) -> crate::Result<(NamespaceId, BlobId)> {
    Ok((NamespaceId::new(ns)?, id.parse()?))
}

fn http_date(t: chrono::DateTime<chrono::Utc>) -> Option<HeaderValue> {
    HeaderValue::from_str(&t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()).ok()
}

async fn get_blob(
    State(state): State<AppState>,
    Path((ns, id)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
) -> crate::Result<Response> {
    let (ns, id) = parse_path(&ns, &id)?;
    let opts = GetOptions {
        storage_layers: query.storage_layers(),
        supports_redirect_uri: query.supports_redirect_uri,
        allow_on_demand_replication: query.allow_ondemand_replication,
        bypass_cache: query.bypass_cache,
        ..Default::default()
    };

    match state.blobs.get(&ns, &id, &opts).await? {
        StoreRead::Contents(contents) => {
            let mut response = Response::new(Body::from_stream(contents.stream));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(contents.length));
            if let Some(layer) = contents.layer.and_then(|l| HeaderValue::from_str(&l).ok()) {
                headers.insert("x-jupiter-layer", layer);
            }
            Ok(response)
        }
        StoreRead::Redirect(url) => Ok(Redirect::temporary(url.as_str()).into_response()),
    }
}

/// 200 with length and age when the blob exists, 404 otherwise
async fn head_blob(
    State(state): State<AppState>,
    Path((ns, id)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
) -> crate::Result<Response> {
    let (ns, id) = parse_path(&ns, &id)?;
    let opts = ExistsOptions {
        storage_layers: query.storage_layers(),
        ignore_remote_blobs: !query.allow_ondemand_replication,
    };
    if !state.blobs.exists(&ns, &id, &opts).await? {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let mut headers = HeaderMap::new();
    if let Ok(meta) = state.blobs.get_object_metadata(&ns, &id).await {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.length));
        if let Some(date) = http_date(meta.last_modified) {
            headers.insert(header::LAST_MODIFIED, date);
        }
    }
    Ok((StatusCode::OK, headers).into_response())
}

async fn put_blob(
    State(state): State<AppState>,
    Path((ns, id)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
    body: Body,
) -> crate::Result<Response> {
    let (ns, id) = parse_path(&ns, &id)?;
    let stream = body
        .into_data_stream()
        .map_err(|e| Error::Internal(format!("request body: {}", e)))
        .boxed();
    let opts = PutOptions {
        bypass_cache: query.bypass_cache,
        ..Default::default()
    };
    let stored = state.blobs.put_stream(&ns, stream, &id, &opts).await?;
    Ok(Json(json!({ "identifier": stored.to_string() })).into_response())
}

async fn delete_blob(
    State(state): State<AppState>,
    Path((ns, id)): Path<(String, String)>,
) -> crate::Result<StatusCode> {
    let (ns, id) = parse_path(&ns, &id)?;
    state.blobs.delete(&ns, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "alive": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.blobs.layout().snapshot() {
        Ok(layout) => {
            let pools = layout.pools().count();
            let status = if pools > 0 {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(json!({ "ready": pools > 0, "storage_pools": pools })))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": e.to_string() })),
        ),
    }
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/blobs/:ns/:id",
            get(get_blob).head(head_blob).put(put_blob).delete(delete_blob),
        )
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
