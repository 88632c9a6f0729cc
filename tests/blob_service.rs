//! Blob service over real store stacks

use bytes::Bytes;
use futures_util::TryStreamExt;
use jupiter_blob::blob::{BlobService, GetOptions, PutOptions};
use jupiter_blob::index::{BlobIndex, MemoryBlobIndex, RocksBlobIndex};
use jupiter_blob::policy::{ConfigPolicyResolver, NamespacePolicy};
use jupiter_blob::store::{
    Backend, FileSystemStore, LayoutHandle, MemoryStore, StorageBackend, StorageLayout, StoreRead,
    StoreStack, StoredBlob,
};
use jupiter_blob::{BlobId, Error, NamespaceId};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn ddc() -> NamespaceId {
    NamespaceId::new("ddc-test").unwrap()
}

fn service(layers: Vec<Arc<StorageBackend>>, index: Arc<dyn BlobIndex>) -> BlobService {
    let layout =
        StorageLayout::new().with_pool("default", StoreStack::from_shared(layers).unwrap());
    let mut policies = HashMap::new();
    policies.insert(ddc(), NamespacePolicy::default());
    BlobService::builder(
        Arc::new(LayoutHandle::new(layout)),
        Arc::new(ConfigPolicyResolver::new(policies, None)),
        index,
    )
    .build()
    .unwrap()
}

async fn read(service: &BlobService, id: &BlobId) -> (Bytes, Option<String>) {
    match service.get(&ddc(), id, &GetOptions::default()).await.unwrap() {
        StoreRead::Contents(contents) => {
            let layer = contents.layer.clone();
            (contents.into_bytes().await.unwrap(), layer)
        }
        StoreRead::Redirect(url) => panic!("unexpected redirect to {}", url),
    }
}

#[tokio::test]
async fn test_ddc_end_to_end() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(StorageBackend::from(MemoryStore::new()));
    let filesystem = Arc::new(StorageBackend::from(FileSystemStore::new(
        dir.path().join("blobs"),
    )));
    let service = service(
        vec![memory.clone(), filesystem.clone()],
        Arc::new(MemoryBlobIndex::new("local")),
    );

    let id = BlobId::from_blob(b"hello");
    service
        .put_bytes(&ddc(), Bytes::from_static(b"hello"), &id, &PutOptions::default())
        .await
        .unwrap();
    assert!(memory.exists(&ddc(), &id).await.unwrap());
    assert!(filesystem.exists(&ddc(), &id).await.unwrap());
    assert_eq!(
        service.index().get_blob_regions(&ddc(), &id).await.unwrap(),
        vec!["local".to_string()]
    );

    // Drop the cache tier only
    if let Backend::Memory(store) = memory.backend() {
        store.clear().unwrap();
    }
    assert!(!memory.exists(&ddc(), &id).await.unwrap());

    let (bytes, layer) = read(&service, &id).await;
    assert_eq!(&bytes[..], b"hello");
    assert_eq!(layer.as_deref(), Some("filesystem"));
    assert!(memory.exists(&ddc(), &id).await.unwrap());

    // The next read never needs the filesystem
    assert!(filesystem.delete(&ddc(), &id).await.unwrap());
    let (bytes, layer) = read(&service, &id).await;
    assert_eq!(&bytes[..], b"hello");
    assert_eq!(layer.as_deref(), Some("memory"));
}

#[tokio::test]
async fn test_put_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(StorageBackend::from(MemoryStore::new()));
    let filesystem = Arc::new(StorageBackend::from(FileSystemStore::new(
        dir.path().to_path_buf(),
    )));
    let service = service(
        vec![memory.clone(), filesystem.clone()],
        Arc::new(MemoryBlobIndex::new("local")),
    );

    let id = BlobId::from_blob(b"same bytes");
    for _ in 0..2 {
        service
            .put_bytes(&ddc(), Bytes::from_static(b"same bytes"), &id, &PutOptions::default())
            .await
            .unwrap();
    }

    if let Backend::Memory(store) = memory.backend() {
        assert_eq!(store.blob_count(), 1);
    }
    let listed: Vec<StoredBlob> = filesystem.list(&ddc()).try_collect().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test]
async fn test_hash_mismatch_is_rejected() {
    let memory = Arc::new(StorageBackend::from(MemoryStore::new()));
    let service = service(vec![memory.clone()], Arc::new(MemoryBlobIndex::new("local")));

    let claimed = BlobId::from_blob(b"what the client said");
    let err = service
        .put_bytes(&ddc(), Bytes::from_static(b"what it sent"), &claimed, &PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HashMismatch { expected, .. } if expected == claimed));
    assert!(!memory.exists(&ddc(), &claimed).await.unwrap());
    if let Backend::Memory(store) = memory.backend() {
        assert_eq!(store.blob_count(), 0);
    }
}

#[tokio::test]
async fn test_delete_clears_index_when_a_layer_fails() {
    // A file where a directory is expected makes every filesystem call fail
    let broken_root = tempfile::NamedTempFile::new().unwrap();
    let broken = Arc::new(StorageBackend::from(FileSystemStore::new(
        broken_root.path().to_path_buf(),
    )));
    let root = Arc::new(StorageBackend::from(MemoryStore::new()));
    let service = service(
        vec![broken.clone(), root.clone()],
        Arc::new(MemoryBlobIndex::new("local")),
    );

    let id = BlobId::from_blob(b"to be deleted");
    service
        .put_bytes(&ddc(), Bytes::from_static(b"to be deleted"), &id, &PutOptions::default())
        .await
        .unwrap();
    assert!(service.index().blob_exists_in_region(&ddc(), &id, None).await.unwrap());

    service.delete(&ddc(), &id).await.unwrap();
    assert!(!service.index().blob_exists_in_region(&ddc(), &id, None).await.unwrap());
    assert!(!root.exists(&ddc(), &id).await.unwrap());

    // Nothing left anywhere: not found, and the index stays clean
    assert!(matches!(
        service.delete(&ddc(), &id).await,
        Err(Error::BlobNotFound { .. })
    ));
    assert!(service.index().get_blob_regions(&ddc(), &id).await.is_err());
}

#[tokio::test]
async fn test_storage_layer_filter() {
    let memory = Arc::new(StorageBackend::from(MemoryStore::new()));
    let dir = TempDir::new().unwrap();
    let filesystem = Arc::new(StorageBackend::from(FileSystemStore::new(
        dir.path().to_path_buf(),
    )));
    let service = service(
        vec![memory.clone(), filesystem.clone()],
        Arc::new(MemoryBlobIndex::new("local")),
    );

    let id = BlobId::from_blob(b"filtered");
    service
        .put_bytes(
            &ddc(),
            Bytes::from_static(b"filtered"),
            &id,
            &PutOptions {
                bypass_cache: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let only_memory = GetOptions {
        storage_layers: Some(vec!["Memory".to_string()]),
        ..Default::default()
    };
    assert!(matches!(
        service.get(&ddc(), &id, &only_memory).await,
        Err(Error::BlobNotFound { .. })
    ));

    let only_filesystem = GetOptions {
        storage_layers: Some(vec!["filesystem".to_string()]),
        ..Default::default()
    };
    assert!(service.get(&ddc(), &id, &only_filesystem).await.is_ok());
    // a filtered read warms nothing outside the filter
    assert!(!memory.exists(&ddc(), &id).await.unwrap());
}

#[tokio::test]
async fn test_rocksdb_index_survives_restart() {
    let dir = TempDir::new().unwrap();
    let index_path = dir.path().join("index");
    let id = BlobId::from_blob(b"durable");

    {
        let index = Arc::new(RocksBlobIndex::open(&index_path, "local").unwrap());
        let service = service(
            vec![Arc::new(StorageBackend::from(FileSystemStore::new(
                dir.path().join("blobs"),
            )))],
            index.clone(),
        );
        service
            .put_bytes(&ddc(), Bytes::from_static(b"durable"), &id, &PutOptions::default())
            .await
            .unwrap();
        index.flush().unwrap();
    }

    let index = RocksBlobIndex::open(&index_path, "local").unwrap();
    assert!(index.blob_exists_in_region(&ddc(), &id, None).await.unwrap());
}

#[tokio::test]
async fn test_named_layers_are_reported_by_name() {
    let hot = Arc::new(StorageBackend::from(MemoryStore::new()).named("hot"));
    let warm = Arc::new(StorageBackend::from(MemoryStore::new()).named("warm"));
    let service = service(vec![hot, warm], Arc::new(MemoryBlobIndex::new("local")));

    let id = BlobId::from_blob(b"named");
    service
        .put_bytes(&ddc(), Bytes::from_static(b"named"), &id, &PutOptions::default())
        .await
        .unwrap();

    let only_warm = GetOptions {
        storage_layers: Some(vec!["warm".to_string()]),
        ..Default::default()
    };
    match service.get(&ddc(), &id, &only_warm).await.unwrap() {
        StoreRead::Contents(contents) => assert_eq!(contents.layer.as_deref(), Some("warm")),
        StoreRead::Redirect(url) => panic!("unexpected redirect to {}", url),
    }
    let (_, layer) = read(&service, &id).await;
    assert_eq!(layer.as_deref(), Some("hot"));
}
