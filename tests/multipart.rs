//! Multipart uploads against a filesystem store, wired from configuration

use bytes::Bytes;
use jupiter_blob::blob::compressed::{self, CompressionMethod};
use jupiter_blob::blob::MultipartUpload;
use jupiter_blob::{BlobId, Config, Error, NamespaceId, Services};
use tempfile::TempDir;

fn ddc() -> NamespaceId {
    NamespaceId::new("ddc-test").unwrap()
}

fn services(dir: &TempDir) -> Services {
    let toml = format!(
        r#"
        site = "local"

        [storage]
        pools = {{ default = [{{ type = "memory" }}, {{ type = "filesystem", path = '{}' }}] }}

        [namespaces.ddc-test]
        use_content_addressed_storage = true
        "#,
        dir.path().join("blobs").display()
    );
    Services::from_config(&Config::from_toml(&toml).unwrap()).unwrap()
}

async fn upload_in_parts(services: &Services, data: &[u8]) -> MultipartUpload {
    let multipart = &services.multipart;
    let upload = multipart.start(&ddc()).await.unwrap();

    let ranges = multipart
        .get_multipart_ranges(&ddc(), data.len() as u64)
        .unwrap();
    let mut parts = Vec::new();
    for range in &ranges {
        let chunk = Bytes::copy_from_slice(&data[range.first_byte as usize..=range.last_byte as usize]);
        multipart
            .put_part(&ddc(), &upload, &range.part_id, chunk)
            .await
            .unwrap();
        parts.push(range.part_id.clone());
    }
    multipart.complete(&ddc(), &upload, &parts).await.unwrap();
    upload
}

#[tokio::test]
async fn test_filesystem_multipart_lifecycle() {
    let dir = TempDir::new().unwrap();
    let services = services(&dir);
    assert!(services.multipart.is_multipart_enabled(&ddc()).unwrap());

    let data = b"multipart payload ".repeat(1000);
    let upload = upload_in_parts(&services, &data).await;
    let id = BlobId::from_blob(&data);

    let verified = services
        .multipart
        .verify(&ddc(), &upload, &id, false)
        .await
        .unwrap();
    assert_eq!(verified.blob_id, id);

    assert!(services.blobs.exists_in_root(&ddc(), &id).await.unwrap());
    assert_eq!(services.blobs.get_bytes(&ddc(), &id).await.unwrap(), data);
}

#[tokio::test]
async fn test_failed_verification_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let services = services(&dir);

    let upload = upload_in_parts(&services, b"not what was promised").await;
    let promised = BlobId::from_blob(b"promised");
    let err = services
        .multipart
        .verify(&ddc(), &upload, &promised, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HashMismatch { .. }));

    // The temp object was removed, so a second attempt cannot find it
    let actual = BlobId::from_blob(b"not what was promised");
    assert!(services
        .multipart
        .verify(&ddc(), &upload, &actual, false)
        .await
        .is_err());
    assert!(!services.blobs.exists_in_root(&ddc(), &actual).await.unwrap());
}

#[tokio::test]
async fn test_compressed_multipart_upload() {
    let dir = TempDir::new().unwrap();
    let services = services(&dir);

    let raw = b"compressible derived data ".repeat(512);
    let buffer = compressed::encode(&raw, CompressionMethod::Lz4).unwrap();
    let upload = upload_in_parts(&services, &buffer).await;

    let declared = BlobId::from_blob(&raw);
    let verified = services
        .multipart
        .verify(&ddc(), &upload, &declared, true)
        .await
        .unwrap();
    assert_eq!(verified.blob_id, BlobId::from_blob(&buffer));
    assert!(verified.content_id.is_some());

    let stored = services.blobs.get_bytes(&ddc(), &verified.blob_id).await.unwrap();
    assert_eq!(compressed::decode(&stored).unwrap().raw, raw);
}

#[tokio::test]
async fn test_missing_part_blocks_completion() {
    let dir = TempDir::new().unwrap();
    let services = services(&dir);
    let multipart = &services.multipart;

    let upload = multipart.start(&ddc()).await.unwrap();
    multipart
        .put_part(&ddc(), &upload, "1", Bytes::from_static(b"first"))
        .await
        .unwrap();
    let err = multipart
        .complete(&ddc(), &upload, &["1".to_string(), "2".to_string()])
        .await
        .unwrap_err();
    match err {
        Error::MissingMultipartParts { upload_id, missing } => {
            assert_eq!(upload_id, upload.upload_id);
            assert_eq!(missing, vec!["2".to_string()]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_namespace_is_rejected() {
    let dir = TempDir::new().unwrap();
    let services = services(&dir);
    let other = NamespaceId::new("not-configured").unwrap();
    assert!(matches!(
        services.multipart.start(&other).await,
        Err(Error::NamespaceNotFound(_))
    ));
}
