//! End-to-end tests of ingestion, egress, updates and deletes through
//! `BlobService`.

mod common;

use blob_store::{
    models::{caller::Caller, update::UpdateBlobRequest},
    services::{
        blob_service::{BlobService, Download, UploadTarget},
        error::BlobError,
        ids::UuidV7Ids,
        metadata::{MetadataStore, Page, index::IndexMetadataStore, sqlite::SqliteMetadataStore},
        query::PredicateSet,
        storage::{StorageBackend, remote::RemoteBackend},
    },
};
use common::{
    FakeSigner, FlakyMeta, Harness, StickyStorage, broken_stream, md5_hex, read_local, stream_of,
};
use object_store::memory::InMemory;
use std::sync::{Arc, atomic::{AtomicBool, Ordering}};

const LIMIT: u64 = 64 * 1024;

fn alice() -> Caller {
    Caller::new("alice")
}

fn new_named(name: &str) -> UploadTarget {
    UploadTarget::New { name: name.into() }
}

#[tokio::test]
async fn stored_bytes_match_recorded_hash_and_size() {
    let h = Harness::new(LIMIT).await;
    let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let record = h
        .service
        .upload(&alice(), new_named("report.pdf"), stream_of(&data, 1000), None)
        .await
        .unwrap();

    assert_eq!(record.author_id, "alice");
    assert_eq!(record.content_type.as_deref(), Some("application/pdf"));
    let stored = read_local(h.storage.as_ref(), record.path.as_deref().unwrap()).await;
    assert_eq!(md5_hex(&stored), record.content_hash.clone().unwrap());
    assert_eq!(stored.len() as i64, record.size.unwrap());

    assert_eq!(h.service.get(&record.id).await.unwrap(), record);
}

#[tokio::test]
async fn oversize_upload_leaves_no_artifact_or_record() {
    let h = Harness::new(1024).await;

    let err = h
        .service
        .upload(&alice(), new_named("big.bin"), stream_of(&[0u8; 4096], 256), None)
        .await
        .unwrap_err();

    assert!(matches!(err, BlobError::SizeLimitExceeded { limit: 1024 }));
    assert!(h.stored_files().is_empty());
    let page = h.service.query(&PredicateSet::all(), Page::default()).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn failed_reupload_keeps_committed_content() {
    let h = Harness::new(16).await;
    let original = h
        .service
        .upload(&alice(), new_named("note.txt"), stream_of(b"v1", 2), Some("text/plain"))
        .await
        .unwrap();

    let err = h
        .service
        .upload(
            &alice(),
            UploadTarget::Existing(original.id.clone()),
            stream_of(&[1u8; 32], 8),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::SizeLimitExceeded { .. }));

    let err = h
        .service
        .upload(&alice(), UploadTarget::Existing(original.id.clone()), broken_stream(b"v2"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::BackendWriteFailed(_)));

    assert_eq!(h.service.get(&original.id).await.unwrap(), original);
    assert_eq!(h.stored_files().len(), 1);
    assert_eq!(read_local(h.storage.as_ref(), original.path.as_deref().unwrap()).await, b"v1");
}

#[tokio::test]
async fn reupload_replaces_content_and_drops_the_old_artifact() {
    let h = Harness::new(LIMIT).await;
    let first = h
        .service
        .upload(&alice(), new_named("note.txt"), stream_of(b"v1", 2), None)
        .await
        .unwrap();

    let second = h
        .service
        .upload(&alice(), UploadTarget::Existing(first.id.clone()), stream_of(b"version two", 4), None)
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_ne!(second.path, first.path);
    assert_eq!(second.size, Some(11));
    assert_eq!(second.content_hash, Some(md5_hex(b"version two")));
    assert!(matches!(
        h.storage.read_locator(first.path.as_deref().unwrap()).await,
        Err(BlobError::ObjectNotFound(_))
    ));
    assert_eq!(h.stored_files().len(), 1);
}

#[tokio::test]
async fn delete_removes_content_and_metadata() {
    let h = Harness::new(LIMIT).await;
    let record = h
        .service
        .upload(&alice(), new_named("gone.txt"), stream_of(b"bye", 3), None)
        .await
        .unwrap();
    let path = record.path.clone().unwrap();

    h.service.delete(&alice(), &record.id).await.unwrap();

    assert!(matches!(h.service.get(&record.id).await, Err(BlobError::NotFound(_))));
    assert!(matches!(
        h.storage.read_locator(&path).await,
        Err(BlobError::ObjectNotFound(_))
    ));
    assert!(matches!(
        h.service.delete(&alice(), &record.id).await,
        Err(BlobError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_completes_when_content_is_already_gone() {
    let h = Harness::new(LIMIT).await;
    let record = h
        .service
        .upload(&alice(), new_named("half.txt"), stream_of(b"x", 1), None)
        .await
        .unwrap();
    h.storage.remove(record.path.as_deref().unwrap()).await.unwrap();

    h.service.delete(&alice(), &record.id).await.unwrap();
    assert!(matches!(h.service.get(&record.id).await, Err(BlobError::NotFound(_))));
}

#[tokio::test]
async fn non_owner_cannot_update_reupload_or_delete() {
    let h = Harness::new(LIMIT).await;
    let record = h
        .service
        .upload(&alice(), new_named("mine.txt"), stream_of(b"private", 3), None)
        .await
        .unwrap();
    let mallory = Caller::new("mallory");

    let update = UpdateBlobRequest {
        name: Some("stolen.txt".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.service.put_metadata(&mallory, Some(&record.id), &update).await,
        Err(BlobError::PermissionDenied(_))
    ));
    assert!(matches!(
        h.service
            .upload(&mallory, UploadTarget::Existing(record.id.clone()), stream_of(b"x", 1), None)
            .await,
        Err(BlobError::PermissionDenied(_))
    ));
    assert!(matches!(
        h.service.delete(&mallory, &record.id).await,
        Err(BlobError::PermissionDenied(_))
    ));

    assert_eq!(h.service.get(&record.id).await.unwrap(), record);
    assert_eq!(h.stored_files().len(), 1);

    // Checks are disabled for the empty identity.
    let renamed = h
        .service
        .put_metadata(&Caller::anonymous(), Some(&record.id), &update)
        .await
        .unwrap();
    assert_eq!(renamed.name, "stolen.txt");
    assert_eq!(renamed.author_id, "alice");
}

#[tokio::test]
async fn metadata_round_trip() {
    let h = Harness::new(LIMIT).await;
    let create: UpdateBlobRequest =
        serde_json::from_str(r#"{"name":"report.pdf","desc":"Q3"}"#).unwrap();
    let created = h.service.put_metadata(&alice(), None, &create).await.unwrap();
    assert!(!created.has_content());

    let update: UpdateBlobRequest = serde_json::from_str(r#"{"tags":"finance,q3"}"#).unwrap();
    h.service
        .put_metadata(&alice(), Some(&created.id), &update)
        .await
        .unwrap();

    let fetched = h.service.get(&created.id).await.unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.name, "report.pdf");
    assert_eq!(fetched.description, "Q3");
    assert_eq!(fetched.tags, "finance,q3");
    assert_eq!(fetched.author_id, "alice");
}

#[tokio::test]
async fn create_requires_a_name() {
    let h = Harness::new(LIMIT).await;
    assert!(matches!(
        h.service
            .put_metadata(&alice(), None, &UpdateBlobRequest::default())
            .await,
        Err(BlobError::ValidationFailed(_))
    ));
    assert!(matches!(
        h.service
            .upload(&alice(), new_named("  "), stream_of(b"x", 1), None)
            .await,
        Err(BlobError::ValidationFailed(_))
    ));
    assert!(h.stored_files().is_empty());
}

#[tokio::test]
async fn first_upload_fills_a_metadata_only_record() {
    let h = Harness::new(LIMIT).await;
    let create = UpdateBlobRequest {
        name: Some("later.csv".into()),
        ..Default::default()
    };
    let created = h.service.put_metadata(&alice(), None, &create).await.unwrap();
    assert!(matches!(h.service.open(&created.id).await, Err(BlobError::NotFound(_))));

    let filled = h
        .service
        .upload(&alice(), UploadTarget::Existing(created.id.clone()), stream_of(b"a,b\n", 2), None)
        .await
        .unwrap();
    assert_eq!(filled.size, Some(4));
    assert_eq!(filled.content_type.as_deref(), Some("text/csv"));

    match h.service.open(&created.id).await.unwrap() {
        Download::Stream { record, .. } => assert_eq!(record, filled),
        other => panic!("expected a stream, got {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_ingestions_are_independent() {
    let h = Harness::new(1024).await;
    let caller = alice();
    let small = h
        .service
        .upload(&caller, new_named("small.bin"), stream_of(&[1u8; 512], 64), None);
    let large = h
        .service
        .upload(&caller, new_named("large.bin"), stream_of(&[2u8; 2048], 64), None);

    let (small, large) = tokio::join!(small, large);
    let small = small.unwrap();
    assert!(matches!(large, Err(BlobError::SizeLimitExceeded { .. })));
    assert_eq!(small.size, Some(512));
    assert_eq!(h.stored_files().len(), 1);
}

#[tokio::test]
async fn concurrent_reuploads_of_one_id_keep_hash_and_size_paired() {
    let h = Harness::new(LIMIT).await;
    let record = h
        .service
        .upload(&alice(), new_named("race.bin"), stream_of(b"seed", 4), None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for n in 1..=8usize {
        let service = h.service.clone();
        let id = record.id.clone();
        tasks.push(tokio::spawn(async move {
            let data = vec![n as u8; n * 100];
            service
                .upload(&alice(), UploadTarget::Existing(id), stream_of(&data, 37), None)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let last = h.service.get(&record.id).await.unwrap();
    let stored = read_local(h.storage.as_ref(), last.path.as_deref().unwrap()).await;
    assert_eq!(Some(md5_hex(&stored)), last.content_hash);
    assert_eq!(Some(stored.len() as i64), last.size);
    assert_eq!(h.stored_files().len(), 1);
}

#[tokio::test]
async fn failed_commit_rolls_back_the_artifact() {
    let inner: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::in_memory().await.unwrap());
    let flaky = Arc::new(FlakyMeta::new(inner));
    let h = Harness::with_meta(flaky.clone(), LIMIT).await;

    let original = h
        .service
        .upload(&alice(), new_named("keep.txt"), stream_of(b"v1", 2), None)
        .await
        .unwrap();

    flaky.fail_puts.store(true, Ordering::SeqCst);
    let err = h
        .service
        .upload(&alice(), UploadTarget::Existing(original.id.clone()), stream_of(b"v2", 2), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::Index(_)));

    // Only the committed artifact remains and the record is untouched.
    assert_eq!(h.stored_files().len(), 1);
    assert_eq!(h.service.get(&original.id).await.unwrap(), original);
    assert_eq!(read_local(h.storage.as_ref(), original.path.as_deref().unwrap()).await, b"v1");
}

#[tokio::test]
async fn failed_rollback_reports_both_errors() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("blobs");
    let local = blob_store::services::storage::local::LocalBackend::open(&root)
        .await
        .unwrap();
    let sticky = Arc::new(StickyStorage {
        inner: Arc::new(local),
        fail_removes: AtomicBool::new(true),
    });
    let inner: Arc<dyn MetadataStore> = Arc::new(IndexMetadataStore::in_memory());
    let flaky = Arc::new(FlakyMeta::new(inner));
    flaky.fail_puts.store(true, Ordering::SeqCst);
    let h = Harness::assemble(flaky, sticky, root, dir, LIMIT);

    let err = h
        .service
        .upload(&alice(), new_named("orphan.txt"), stream_of(b"bytes", 5), None)
        .await
        .unwrap_err();

    match &err {
        BlobError::RollbackFailed { original, rollback } => {
            assert!(matches!(**original, BlobError::Index(_)));
            assert!(matches!(**rollback, BlobError::BackendWriteFailed(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.code(), "MetadataStoreFailed");
}

#[tokio::test]
async fn remote_backend_downloads_redirect() {
    let storage: Arc<dyn StorageBackend> = Arc::new(RemoteBackend::new(
        Arc::new(InMemory::new()),
        Arc::new(FakeSigner),
        "blobs",
    ));
    let meta: Arc<dyn MetadataStore> = Arc::new(IndexMetadataStore::in_memory());
    let service = BlobService::new(meta, storage, Arc::new(UuidV7Ids), LIMIT);

    let record = service
        .upload(&alice(), new_named("photo.png"), stream_of(b"\x89PNG....", 3), None)
        .await
        .unwrap();
    assert_eq!(record.content_type.as_deref(), Some("image/png"));

    match service.open(&record.id).await.unwrap() {
        Download::Redirect { record: resolved, url } => {
            assert_eq!(resolved.id, record.id);
            assert!(url.starts_with("https://signed.test/blobs/"), "{}", url);
        }
        other => panic!("expected a redirect, got {:?}", other),
    }

    service.delete(&alice(), &record.id).await.unwrap();
    assert!(matches!(service.open(&record.id).await, Err(BlobError::NotFound(_))));
}

#[tokio::test]
async fn uploads_are_queryable() {
    let h = Harness::new(LIMIT).await;
    for (name, size) in [("a.txt", 100usize), ("b.txt", 150), ("c.txt", 250)] {
        h.service
            .upload(&alice(), new_named(name), stream_of(&vec![0u8; size], 50), None)
            .await
            .unwrap();
    }

    let predicates = PredicateSet::decode([("size", "range", "100,200")]).unwrap();
    let page = h.service.query(&predicates, Page::default()).await.unwrap();
    assert_eq!(page.total, 2);
    let mut names: Vec<_> = page.records.iter().map(|r| r.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    let exact = PredicateSet::decode([("name", "kw", "a.txt")]).unwrap();
    let page = h.service.query(&exact, Page::default()).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].name, "a.txt");

    assert!(matches!(
        PredicateSet::decode([("name", "regex", "a.*")]),
        Err(BlobError::UnsupportedOperator { .. })
    ));
}
