
use crate::db::{Database, NewCacheEntry};
use crate::types::DatasetId;
use chrono::{TimeZone, Utc};

/// Build a queued entry for `dataset_id`, requested `minutes` after a fixed epoch
pub(super) fn new_entry(dataset_id: i64, filename: &str, minutes: i64) -> NewCacheEntry {
    NewCacheEntry {
        dataset_id: DatasetId(dataset_id),
        job: 1000 + dataset_id,
        client_path: r"\\proto-3\cache".to_string(),
        server_path: "/srv/cache".to_string(),
        parent_path: "QExactive".to_string(),
        dataset_folder: format!("Dataset_{}", dataset_id),
        results_folder_name: "SIC201".to_string(),
        filename: filename.to_string(),
        queued_at: Utc.timestamp_opt(1_700_000_000 + minutes * 60, 0).single(),
        optional: false,
    }
}

pub(super) async fn open_db(temp_file: &tempfile::NamedTempFile) -> Database {
    Database::new(temp_file.path()).await.unwrap()
}

/// Queue `files`, lease them as one task and report them all cached
pub(super) async fn cache_files(
    db: &Database,
    dataset_id: i64,
    files: &[(&str, i64)],
) -> Vec<crate::types::EntryId> {
    let mut ids = Vec::new();
    for (filename, minutes) in files {
        ids.push(
            db.queue_file(&new_entry(dataset_id, filename, *minutes))
                .await
                .unwrap(),
        );
    }

    let task_id = db
        .create_task(DatasetId(dataset_id))
        .await
        .unwrap()
        .unwrap();
    let lease = db.request_task("tester").await.unwrap();
    assert_eq!(lease.task_id, task_id);

    let csv = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    db.set_task_complete("tester", task_id, 0, "ok", &csv)
        .await
        .unwrap();

    ids
}
