//! End-to-end runs of the cache agent against a SQLite store and a mock archive
//!
//! Each test builds a real [`CacheAgent`] (SQLite task store, HTTP archive
//! client, system free-space probe) inside a temporary directory and serves
//! the archive with wiremock.

mod common;

use archive_cacher::db::task_state;
use archive_cacher::{
    CacheAgent, CacheState, DatasetId, DiskSpaceProbe, Error, Event, Evictor, TaskId,
};
use common::{cached_path, mount_dataset, open_store, queue_all, test_config};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_task_is_downloaded_and_reported_cached() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&temp, &server.uri());

    let db = open_store(&config).await;
    let ids = queue_all(&db, &temp, 42, &["peaks.txt", "scans.csv"]).await;
    let task_id = db.create_task(DatasetId(42)).await.unwrap().unwrap();

    mount_dataset(
        &server,
        42,
        &[(900, "peaks.txt", "m/z,intensity\n"), (901, "SCANS.CSV", "scan\n1\n")],
    )
    .await;

    let agent = CacheAgent::new(config).await.unwrap();
    let report = agent.start(false).await;
    agent.close().await;

    assert!(report.is_success(), "{:?}", report.error_message);
    assert_eq!(report.tasks_processed, 1);

    assert_eq!(
        std::fs::read_to_string(cached_path(&temp, 42, "peaks.txt")).unwrap(),
        "m/z,intensity\n"
    );
    assert!(cached_path(&temp, 42, "scans.csv").exists());

    for id in ids {
        let entry = db.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.state, CacheState::Cached);
    }

    let task = db.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, task_state::COMPLETE);
    assert_eq!(task.completion_code, Some(0));
    assert_eq!(task.processor.as_deref(), Some("FileCacher_test"));
}

/// A cache volume with no free space
struct FullVolume;

impl DiskSpaceProbe for FullVolume {
    fn free_bytes(&self, _path: &Path) -> archive_cacher::Result<u64> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_file_cached_under_other_case_is_evicted() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&temp, &server.uri());

    let db = open_store(&config).await;
    let ids = queue_all(&db, &temp, 42, &["scans.csv"]).await;
    db.create_task(DatasetId(42)).await.unwrap().unwrap();
    mount_dataset(&server, 42, &[(901, "SCANS.CSV", "scan\n1\n")]).await;

    let agent = CacheAgent::new(config.clone()).await.unwrap();
    let report = agent.start(false).await;
    agent.close().await;
    assert!(report.is_success(), "{:?}", report.error_message);

    let cached = cached_path(&temp, 42, "scans.csv");
    assert!(cached.exists());

    let evictor = Evictor::new(Arc::new(db), Arc::new(FullVolume), &config.cache);
    let err = evictor.run().await.unwrap_err();
    assert!(matches!(err, Error::InsufficientSpace { .. }), "{err:?}");

    assert!(!cached.exists());
    assert!(!cached_path(&temp, 42, "SCANS.CSV").exists());
    assert!(cache_root_is_empty(&temp));

    let db = open_store(&config).await;
    assert_eq!(
        db.get_entry(ids[0]).await.unwrap().unwrap().state,
        CacheState::Purged
    );
}

fn cache_root_is_empty(temp: &TempDir) -> bool {
    std::fs::read_dir(common::cache_root(temp)).unwrap().next().is_none()
}

#[tokio::test]
async fn test_preview_lists_without_changing_the_store() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&temp, &server.uri());

    let db = open_store(&config).await;
    queue_all(&db, &temp, 42, &["a.txt", "b.txt", "c.txt"]).await;

    let agent = CacheAgent::new(config).await.unwrap();
    let report = agent.start(true).await;
    agent.close().await;

    assert!(report.is_success());
    let listing = report.preview.unwrap();
    assert_eq!(listing.dataset_id, Some(DatasetId(42)));
    assert_eq!(listing.files.len(), 3);
    assert_eq!(listing.files[2].1, cached_path(&temp, 42, "c.txt"));

    let text = listing.to_string();
    assert!(text.starts_with("Files to cache for dataset: 42\n"), "{text}");
    assert!(text.contains("Job\tFile_Path\n"), "{text}");

    assert_eq!(db.count_entries_in_state(CacheState::Queued).await.unwrap(), 3);
    assert!(db.get_task(TaskId(1)).await.unwrap().is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_required_file_fails_task_and_requeues_it() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&temp, &server.uri());

    let db = open_store(&config).await;
    let ids = queue_all(&db, &temp, 7, &["found.txt", "missing.txt"]).await;
    let task_id = db.create_task(DatasetId(7)).await.unwrap().unwrap();
    mount_dataset(&server, 7, &[(10, "found.txt", "here")]).await;

    let agent = CacheAgent::new(config).await.unwrap();
    let report = agent.start(false).await;
    agent.close().await;

    assert!(!report.is_success());
    assert_eq!(report.tasks_failed, 1);

    let task = db.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, task_state::FAILED);
    assert_eq!(task.completion_code, Some(2));
    assert_eq!(
        task.completion_message.as_deref(),
        Some("Unable to cache all of the requested files: 2 requested vs. 1 actually cached")
    );

    let found = db.get_entry(ids[0]).await.unwrap().unwrap();
    let missing = db.get_entry(ids[1]).await.unwrap().unwrap();
    assert_eq!(found.state, CacheState::Cached);
    assert_eq!(missing.state, CacheState::Queued);
}

#[tokio::test]
async fn test_offline_archive_fails_task_and_emits_event() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&temp, &server.uri());

    let db = open_store(&config).await;
    let ids = queue_all(&db, &temp, 8, &["a.txt"]).await;
    let task_id = db.create_task(DatasetId(8)).await.unwrap().unwrap();

    Mock::given(method("GET"))
        .and(path("/datasets/8/files"))
        .respond_with(ResponseTemplate::new(503).set_body_string("scheduled maintenance"))
        .mount(&server)
        .await;

    let agent = CacheAgent::new(config).await.unwrap();
    let mut events = agent.subscribe();
    let report = agent.start(false).await;
    agent.close().await;

    assert!(!report.is_success());
    let task = db.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.completion_code, Some(-1));
    assert_eq!(
        db.get_entry(ids[0]).await.unwrap().unwrap().state,
        CacheState::Queued
    );

    let mut saw_offline = false;
    while let Ok(event) = events.try_recv() {
        if let Event::ArchiveOffline { message } = event {
            assert_eq!(message, "scheduled maintenance");
            saw_offline = true;
        }
    }
    assert!(saw_offline);
}

#[tokio::test]
async fn test_empty_queue_is_success() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&temp, &server.uri());

    let agent = CacheAgent::new(config).await.unwrap();
    let report = agent.start(false).await;
    agent.close().await;

    assert!(report.is_success());
    assert_eq!(report.tasks_processed, 0);
}
