//! Blob HTTP API over a loopback listener
use jupiter_blob::http::{create_router, AppState};
use jupiter_blob::index::BlobIndex;
use jupiter_blob::{BlobId, Config, Services};
use reqwest::{Client, StatusCode};
use std::net::SocketAddr;

async fn start() -> (SocketAddr, Services) {
    let config = Config::from_toml(
        r#"
        [storage]
        pools = { default = [{ type = "memory" }, { type = "memory" }] }

        [namespaces.ddc-test]
        use_content_addressed_storage = true
        "#,
    )
    .unwrap();
    let services = Services::from_config(&config).unwrap();
    let router = create_router(AppState {
        blobs: services.blobs.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    (addr, services)
}

fn blob_url(addr: SocketAddr, ns: &str, id: &str) -> String {
    format!("http://{}/api/v1/blobs/{}/{}", addr, ns, id)
}

#[tokio::test]
async fn test_put_get_head_delete() {
    let (addr, _services) = start().await;
    let client = Client::new();
    let data = b"Hello, blob!";
    let id = BlobId::from_blob(data);
    let url = blob_url(addr, "ddc-test", &id.to_string());

    // PUT
    let put_resp = client.put(&url).body(data.as_ref()).send().await.unwrap();
    assert_eq!(put_resp.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&put_resp.bytes().await.unwrap()).unwrap();
    assert_eq!(body["identifier"], id.to_string());

    // GET
    let get_resp = client.get(&url).send().await.unwrap();
    assert_eq!(get_resp.status(), StatusCode::OK);
    assert_eq!(get_resp.headers()["x-jupiter-layer"], "memory");
    assert_eq!(get_resp.bytes().await.unwrap().as_ref(), data);

    // HEAD
    let head_resp = client.head(&url).send().await.unwrap();
    assert_eq!(head_resp.status(), StatusCode::OK);
    assert!(head_resp.headers().contains_key("last-modified"));

    // DELETE
    let delete_resp = client.delete(&url).send().await.unwrap();
    assert_eq!(delete_resp.status(), StatusCode::NO_CONTENT);
    let get_resp = client.get(&url).send().await.unwrap();
    assert_eq!(get_resp.status(), StatusCode::NOT_FOUND);
    let head_resp = client.head(&url).send().await.unwrap();
    assert_eq!(head_resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rejects_bad_uploads() {
    let (addr, services) = start().await;
    let client = Client::new();

    let claimed = BlobId::from_blob(b"claimed");
    let resp = client
        .put(blob_url(addr, "ddc-test", &claimed.to_string()))
        .body("actual")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert!(body["error"].as_str().unwrap().contains("mismatch"));
    assert!(services
        .blobs
        .index()
        .get_blob_regions(&"ddc-test".parse().unwrap(), &claimed)
        .await
        .is_err());

    let resp = client
        .put(blob_url(addr, "ddc-test", "not-a-hash"))
        .body("anything")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_namespace_is_not_found() {
    let (addr, _services) = start().await;
    let client = Client::new();
    let id = BlobId::from_blob(b"whatever");

    let resp = client
        .get(blob_url(addr, "unknown-ns", &id.to_string()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = client
        .put(blob_url(addr, "unknown-ns", &id.to_string()))
        .body("whatever")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_endpoints() {
    let (addr, _services) = start().await;
    let client = Client::new();

    let live = client
        .get(format!("http://{}/health/live", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = client
        .get(format!("http://{}/health/ready", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&ready.bytes().await.unwrap()).unwrap();
    assert_eq!(body["storage_pools"], 1);
}
