//! End-to-end checkout scenarios against a real store on disk.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use depot_cas::{BlobKey, BlobStore};
use depot_checkout::{CheckoutError, CheckoutManager, CheckoutRequest, FileSpec};
use depot_config::testing::TestEnvironment;
use filetime::FileTime;
use tokio_util::sync::CancellationToken;

fn setup() -> (TestEnvironment, CheckoutManager) {
    let env = TestEnvironment::new().unwrap();
    let config = env.config();
    let store = BlobStore::from_config(&config).unwrap();
    let manager = CheckoutManager::from_config(&config, store).unwrap();
    (env, manager)
}

fn root_entries(manager: &CheckoutManager) -> usize {
    fs::read_dir(manager.root()).unwrap().count()
}

#[tokio::test]
async fn checkout_round_trip() {
    let (_env, manager) = setup();
    let contents: Vec<Vec<u8>> = (0..5).map(|i| format!("file number {i}").into_bytes()).collect();

    let mut request = CheckoutRequest::new("roundtrip");
    for (i, data) in contents.iter().enumerate() {
        let (key, _) = manager.store().store(data).unwrap();
        request = request.with_file(&key, format!("dir{}/file{i}.bin", i % 2));
    }

    let id = manager.checkout(&request, &CancellationToken::new()).await.unwrap();
    assert_eq!(id, "roundtrip");

    let dir = manager.checkout_dir(&id);
    for (i, data) in contents.iter().enumerate() {
        let link = dir.join(format!("dir{}/file{i}.bin", i % 2));
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(&fs::read(&link).unwrap(), data);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn second_checkout_with_same_name_gets_suffix() {
    let (_env, manager) = setup();
    let data = vec![b'b'; 3367];
    let (key, _) = manager.store().store(&data).unwrap();
    let request = CheckoutRequest::new("job1").with_file(&key, "scene.blend");
    let cancel = CancellationToken::new();

    let first = manager.checkout(&request, &cancel).await.unwrap();
    assert_eq!(first, "job1");
    let link = manager.checkout_dir(&first).join("scene.blend");
    assert_eq!(
        fs::read_link(&link).unwrap(),
        std::path::absolute(manager.store().blob_path(&key)).unwrap()
    );

    let second = manager.checkout(&request, &cancel).await.unwrap();
    assert_ne!(second, first);
    assert!(second.starts_with("job1-"));
    assert_eq!(second.len(), "job1-x7q2".len());

    // the first checkout is untouched by the retry
    assert_eq!(fs::read(&link).unwrap(), data);
    assert_eq!(fs::read(manager.checkout_dir(&second).join("scene.blend")).unwrap(), data);
    manager.shutdown().await;
}

#[tokio::test]
async fn missing_file_rolls_back_checkout() {
    let (_env, manager) = setup();
    let (stored, _) = manager.store().store(b"present").unwrap();
    let absent = BlobKey::for_bytes(b"absent");

    let request = CheckoutRequest::new("partial")
        .with_file(&stored, "present.txt")
        .with_file(&absent, "absent.txt");

    let err = manager.checkout(&request, &CancellationToken::new()).await.unwrap_err();
    match err {
        CheckoutError::MissingFiles { missing } => assert_eq!(missing, vec![absent]),
        other => panic!("expected MissingFiles, got {other:?}"),
    }
    assert!(!manager.checkout_dir("partial").exists());
    assert_eq!(root_entries(&manager), 0);
    assert!(manager.store().exists(&stored));
}

#[tokio::test]
async fn nested_checkout_rollback_removes_empty_parent() {
    let (_env, manager) = setup();
    let request = CheckoutRequest::new("ab/abcdef").with_file(&BlobKey::for_bytes(b"nope"), "x");

    assert!(manager.checkout(&request, &CancellationToken::new()).await.is_err());
    assert_eq!(root_entries(&manager), 0);
}

#[tokio::test]
async fn in_progress_upload_does_not_satisfy_checkout() {
    let (_env, manager) = setup();
    let key = BlobKey::for_bytes(b"still uploading");
    let mut upload = manager.store().open_for_upload(&key).await.unwrap();
    upload.write(b"still").await.unwrap();

    let request = CheckoutRequest::new("early").with_file(&key, "f");
    let err = manager.checkout(&request, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CheckoutError::MissingFiles { .. }));
    assert!(!manager.checkout_dir("early").exists());
}

#[tokio::test]
async fn invalid_requests_leave_nothing_behind() {
    let (_env, manager) = setup();
    let (key, _) = manager.store().store(b"ok").unwrap();
    let cancel = CancellationToken::new();

    let bad_id = CheckoutRequest::new("../evil").with_file(&key, "f");
    assert!(matches!(
        manager.checkout(&bad_id, &cancel).await,
        Err(CheckoutError::InvalidPath { .. })
    ));

    let bad_file = CheckoutRequest::new("job").with_file(&key, "../../etc/passwd");
    assert!(matches!(
        manager.checkout(&bad_file, &cancel).await,
        Err(CheckoutError::InvalidPath { .. })
    ));

    let mut bad_checksum = CheckoutRequest::new("job");
    bad_checksum.files.push(FileSpec {
        sha: "zz".to_string(),
        size: 2,
        path: "f".to_string(),
    });
    let err = manager.checkout(&bad_checksum, &cancel).await.unwrap_err();
    assert!(matches!(err, CheckoutError::Store(_)));
    assert!(err.is_client_error());

    assert_eq!(root_entries(&manager), 0);
}

#[tokio::test]
async fn cancelled_checkout_is_removed() {
    let (_env, manager) = setup();
    let (key, _) = manager.store().store(b"cancel me").unwrap();
    let request = CheckoutRequest::new("cancelled").with_file(&key, "f");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = manager.checkout(&request, &cancel).await.unwrap_err();
    assert!(matches!(err, CheckoutError::Cancelled));
    assert!(!manager.checkout_dir("cancelled").exists());
}

#[test]
fn concurrent_allocation_is_unique() {
    let (_env, manager) = setup();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.prepare_checkout("same"))
        })
        .collect();

    let ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    assert_eq!(ids.iter().filter(|id| *id == "same").count(), 1);
    for id in &ids {
        assert!(manager.checkout_dir(id).is_dir());
    }
}

#[tokio::test]
async fn checkout_touches_linked_blobs() {
    let (_env, manager) = setup();
    let (key, _) = manager.store().store(b"cold blob").unwrap();
    let blob = manager.store().blob_path(&key);

    let long_ago = FileTime::from_unix_time(1_000_000, 0);
    filetime::set_file_times(&blob, long_ago, long_ago).unwrap();
    let before = fs::metadata(&blob).unwrap().modified().unwrap();

    let request = CheckoutRequest::new("warm").with_file(&key, "blob");
    manager.checkout(&request, &CancellationToken::new()).await.unwrap();
    manager.shutdown().await;
    assert_eq!(manager.pending_touches(), 0);

    let after = fs::metadata(&blob).unwrap().modified().unwrap();
    assert!(after > before);
    let age = SystemTime::now().duration_since(after).unwrap_or_default();
    assert!(age < Duration::from_secs(60));
}

#[tokio::test]
async fn erase_leaves_other_checkouts_and_blobs_alone() {
    let (_env, manager) = setup();
    let (shared, _) = manager.store().store(b"shared").unwrap();
    let cancel = CancellationToken::new();

    let a = manager
        .checkout(&CheckoutRequest::new("a").with_file(&shared, "s"), &cancel)
        .await
        .unwrap();
    let b = manager
        .checkout(&CheckoutRequest::new("b").with_file(&shared, "s"), &cancel)
        .await
        .unwrap();

    manager.erase_checkout(&a).unwrap();
    assert!(!manager.checkout_dir(&a).exists());
    assert_eq!(fs::read(manager.checkout_dir(&b).join("s")).unwrap(), b"shared");
    assert!(manager.store().exists(&shared));
    assert!(manager.store().stored_path().is_dir());

    assert!(matches!(
        manager.erase_checkout(&a),
        Err(CheckoutError::NotFound(_))
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn ambiguous_checkout_ids_are_rejected() {
    let (_env, manager) = setup();
    let (key, _) = manager.store().store(b"frame").unwrap();
    let cancel = CancellationToken::new();

    for id in ["job/", "job/.", "./job", "a//b"] {
        let request = CheckoutRequest::new(id).with_file(&key, "frame.exr");
        for _ in 0..2 {
            assert!(
                matches!(
                    manager.checkout(&request, &cancel).await,
                    Err(CheckoutError::InvalidPath { .. })
                ),
                "{id:?} should be rejected"
            );
        }
    }
    assert_eq!(root_entries(&manager), 0);
}

#[tokio::test]
async fn suffixed_checkout_is_a_sibling() {
    let (_env, manager) = setup();
    let (key, _) = manager.store().store(b"frame").unwrap();
    let request = CheckoutRequest::new("renders/job").with_file(&key, "frame.exr");
    let cancel = CancellationToken::new();

    let first = manager.checkout(&request, &cancel).await.unwrap();
    let second = manager.checkout(&request, &cancel).await.unwrap();
    assert_eq!(first, "renders/job");
    assert!(second.starts_with("renders/job-"), "{second}");
    assert!(!manager.checkout_dir(&second).starts_with(manager.checkout_dir(&first)));

    manager.erase_checkout(&first).unwrap();
    assert_eq!(fs::read(manager.checkout_dir(&second).join("frame.exr")).unwrap(), b"frame");

    let third = manager.checkout(&request, &cancel).await.unwrap();
    manager.erase_checkout(&second).unwrap();
    assert_eq!(fs::read(manager.checkout_dir(&third).join("frame.exr")).unwrap(), b"frame");
    manager.shutdown().await;
}

#[tokio::test]
async fn erase_rejects_invalid_ids() {
    let (_env, manager) = setup();
    for id in ["", "..", "../jobs", "/tmp", ".", "jobs/", "a//b"] {
        assert!(
            matches!(manager.erase_checkout(id), Err(CheckoutError::InvalidPath { .. })),
            "{id:?} should be rejected"
        );
    }
    assert!(manager.root().is_dir());
}
