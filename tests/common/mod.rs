//! Shared helpers for archive-cacher integration tests

#![allow(dead_code)]

use archive_cacher::{Config, Database, DatasetId, EntryId, NewCacheEntry, Perspective};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Configuration pointing at a temporary store and cache root
pub fn test_config(temp: &TempDir, archive_url: &str) -> Config {
    let mut config = Config::default();
    config.store.database_path = temp.path().join("store").join("cacher.db");
    config.store.processor_name = Some("FileCacher_test".to_string());
    config.archive.base_url = archive_url.to_string();
    config.cache.perspective = Perspective::Server;
    config.cache.minimum_free_space_gb = 1;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.jitter = false;
    config
}

/// Cache root used by [`queued_file`]
pub fn cache_root(temp: &TempDir) -> PathBuf {
    temp.path().join("cache")
}

/// A queued file for `dataset_id` under the test cache root
pub fn queued_file(temp: &TempDir, dataset_id: i64, filename: &str, minutes: i64) -> NewCacheEntry {
    NewCacheEntry {
        dataset_id: DatasetId(dataset_id),
        job: 5000 + dataset_id,
        client_path: String::new(),
        server_path: cache_root(temp).display().to_string(),
        parent_path: "\\VOrbiETD01".to_string(),
        dataset_folder: format!("Dataset_{}", dataset_id),
        results_folder_name: "SIC201".to_string(),
        filename: filename.to_string(),
        queued_at: chrono::DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0),
        optional: false,
    }
}

/// Queue every file in `names` for `dataset_id`
pub async fn queue_all(db: &Database, temp: &TempDir, dataset_id: i64, names: &[&str]) -> Vec<EntryId> {
    let mut ids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        ids.push(
            db.queue_file(&queued_file(temp, dataset_id, name, i as i64))
                .await
                .unwrap(),
        );
    }
    ids
}

/// Where a queued file lands once cached
pub fn cached_path(temp: &TempDir, dataset_id: i64, filename: &str) -> PathBuf {
    cache_root(temp)
        .join("VOrbiETD01")
        .join(format!("Dataset_{}", dataset_id))
        .join("SIC201")
        .join(filename)
}

/// Serve a dataset listing and the content of each listed file
pub async fn mount_dataset(server: &MockServer, dataset_id: i64, files: &[(i64, &str, &'static str)]) {
    let listing: Vec<serde_json::Value> = files
        .iter()
        .map(|(id, name, body)| {
            serde_json::json!({
                "file_id": id,
                "sub_dir_path": "SIC201",
                "filename": name,
                "size": body.len(),
            })
        })
        .collect();

    Mock::given(method("GET"))
        .and(path(format!("/datasets/{}/files", dataset_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing))
        .mount(server)
        .await;

    for (id, _, body) in files {
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_string(*body))
            .mount(server)
            .await;
    }
}

/// Open the store a test agent will use
pub async fn open_store(config: &Config) -> Database {
    Database::new(&config.store.database_path).await.unwrap()
}
