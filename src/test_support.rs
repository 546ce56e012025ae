//! In-memory fakes shared by unit tests.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use crate::archive::{ArchiveClient, DownloadReport};
use crate::disk_space::DiskSpaceProbe;
use crate::error::{ArchiveError, DatabaseError, Error, Result};
use crate::store::{CacheEntryStore, DurableLog, TaskStore};
use crate::types::{
    ArchivedFileRef, CacheFileEntry, CacheState, DatasetId, EntryId, FileId, OverwriteMode,
    TaskId, TaskLease,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Entry for dataset 42 below `root` (server perspective), queued `minutes` after a fixed epoch
pub fn cached_entry(id: i64, root: &Path, filename: &str, minutes: i64) -> CacheFileEntry {
    CacheFileEntry {
        entry_id: EntryId(id),
        dataset_id: DatasetId(42),
        job: 1001,
        client_path: String::new(),
        server_path: root.display().to_string(),
        parent_path: "QExactive".to_string(),
        dataset_folder: "Dataset_42".to_string(),
        results_folder_name: "SIC201".to_string(),
        filename: filename.to_string(),
        queued_at: Utc
            .timestamp_opt(1_700_000_000 + minutes * 60, 0)
            .single()
            .unwrap(),
        optional: false,
        state: CacheState::Cached,
    }
}

/// A completion reported to [`MemoryStore`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCompletion {
    pub processor: String,
    pub task_id: TaskId,
    pub code: i32,
    pub message: String,
    pub cached_ids_csv: String,
}

/// Task store kept in memory
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<(CacheFileEntry, Option<TaskId>)>>,
    pending_tasks: Mutex<VecDeque<TaskId>>,
    completions: Mutex<Vec<RecordedCompletion>>,
    log: Mutex<Vec<(String, String)>>,
    request_failures: AtomicU32,
    read_failures: AtomicU32,
    purge_failures: AtomicU32,
    purge_calls: AtomicU32,
    purges_unrecorded: AtomicBool,
    request_calls: AtomicU32,
    mutations: AtomicU32,
}

impl MemoryStore {
    pub fn with_entries(entries: Vec<CacheFileEntry>) -> Self {
        let store = Self::default();
        *store.entries.lock().unwrap() = entries.into_iter().map(|e| (e, None)).collect();
        store
    }

    /// Queue `entries` under a new task that `request_task` will hand out
    pub fn add_task(&self, task_id: TaskId, entries: Vec<CacheFileEntry>) {
        let mut all = self.entries.lock().unwrap();
        for mut entry in entries {
            entry.state = CacheState::Queued;
            all.push((entry, Some(task_id)));
        }
        self.pending_tasks.lock().unwrap().push_back(task_id);
    }

    /// Queue entries without a task, as preview sees them
    pub fn add_queued(&self, entries: Vec<CacheFileEntry>) {
        let mut all = self.entries.lock().unwrap();
        for mut entry in entries {
            entry.state = CacheState::Queued;
            all.push((entry, None));
        }
    }

    /// Make the next `count` lease requests fail with a transient error
    pub fn fail_next_requests(&self, count: u32) {
        self.request_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` entry reads fail with a transient error
    pub fn fail_next_reads(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` purge updates fail with a transient error
    pub fn fail_next_purges(&self, count: u32) {
        self.purge_failures.store(count, Ordering::SeqCst);
    }

    /// Accept purge updates without changing any rows
    pub fn ignore_purges(&self) {
        self.purges_unrecorded.store(true, Ordering::SeqCst);
    }

    pub fn purge_calls(&self) -> u32 {
        self.purge_calls.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, id: EntryId) -> Option<CacheState> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(e, _)| e.entry_id == id)
            .map(|(e, _)| e.state)
    }

    pub fn completions(&self) -> Vec<RecordedCompletion> {
        self.completions.lock().unwrap().clone()
    }

    pub fn log_messages(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_calls(&self) -> u32 {
        self.request_calls.load(Ordering::SeqCst)
    }

    /// Number of calls that changed store state
    pub fn mutations(&self) -> u32 {
        self.mutations.load(Ordering::SeqCst)
    }
}

/// Fail with a busy-database error while `remaining` is above zero
fn take_failure(remaining: &AtomicU32) -> Result<()> {
    if remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Err(Error::Database(DatabaseError::QueryFailed(
            "database is locked".into(),
        )));
    }
    Ok(())
}

#[async_trait]
impl CacheEntryStore for MemoryStore {
    async fn get_files_to_cache(&self, task_id: TaskId) -> Result<Vec<CacheFileEntry>> {
        take_failure(&self.read_failures)?;
        let all = self.entries.lock().unwrap();
        if task_id == 0 {
            let first_dataset = all
                .iter()
                .filter(|(e, _)| e.state == CacheState::Queued)
                .min_by_key(|(e, _)| (e.queued_at, e.entry_id))
                .map(|(e, _)| e.dataset_id);
            return Ok(all
                .iter()
                .filter(|(e, _)| {
                    e.state == CacheState::Queued && Some(e.dataset_id) == first_dataset
                })
                .map(|(e, _)| e.clone())
                .collect());
        }
        Ok(all
            .iter()
            .filter(|(e, t)| *t == Some(task_id) && e.state == CacheState::InProgress)
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn get_oldest_cached(&self, limit: usize) -> Result<Vec<CacheFileEntry>> {
        take_failure(&self.read_failures)?;
        let all = self.entries.lock().unwrap();
        let mut cached: Vec<CacheFileEntry> = all
            .iter()
            .filter(|(e, _)| e.state == CacheState::Cached)
            .map(|(e, _)| e.clone())
            .collect();
        cached.sort_by_key(|e| (e.queued_at, e.entry_id));
        cached.truncate(limit);
        Ok(cached)
    }

    async fn mark_purged(&self, ids: &[EntryId]) -> Result<u64> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        take_failure(&self.purge_failures)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        if self.purges_unrecorded.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut all = self.entries.lock().unwrap();
        let mut updated = 0;
        for (entry, _) in all.iter_mut() {
            if ids.contains(&entry.entry_id) && entry.state != CacheState::Purged {
                entry.state = CacheState::Purged;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn request_task(&self, _processor: &str) -> Result<TaskLease> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        take_failure(&self.request_failures)?;

        let Some(task_id) = self.pending_tasks.lock().unwrap().pop_front() else {
            return Ok(TaskLease::none("No tasks found"));
        };
        self.mutations.fetch_add(1, Ordering::SeqCst);

        for (entry, task) in self.entries.lock().unwrap().iter_mut() {
            if *task == Some(task_id) && entry.state == CacheState::Queued {
                entry.state = CacheState::InProgress;
            }
        }

        Ok(TaskLease {
            available: true,
            task_id,
            message: String::new(),
        })
    }

    async fn set_task_complete(
        &self,
        processor: &str,
        task_id: TaskId,
        completion_code: i32,
        completion_message: &str,
        cached_ids_csv: &str,
    ) -> Result<String> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let cached: Vec<EntryId> = cached_ids_csv
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        for (entry, task) in self.entries.lock().unwrap().iter_mut() {
            if *task != Some(task_id) {
                continue;
            }
            if cached.contains(&entry.entry_id) {
                entry.state = CacheState::Cached;
            } else if completion_code != 0 && entry.state == CacheState::InProgress {
                entry.state = CacheState::Queued;
                *task = None;
            }
        }

        self.completions.lock().unwrap().push(RecordedCompletion {
            processor: processor.to_string(),
            task_id,
            code: completion_code,
            message: completion_message.to_string(),
            cached_ids_csv: cached_ids_csv.to_string(),
        });
        Ok(String::new())
    }
}

#[async_trait]
impl DurableLog for MemoryStore {
    async fn write_log(&self, _posted_by: &str, level: &str, message: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push((level.to_string(), message.to_string()));
        Ok(())
    }
}

/// Probe returning scripted free-space values; the last one repeats
pub struct FakeProbe {
    values: Vec<u64>,
    calls: AtomicUsize,
    failing: bool,
}

impl FakeProbe {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            calls: AtomicUsize::new(0),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            values: Vec::new(),
            calls: AtomicUsize::new(0),
            failing: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DiskSpaceProbe for FakeProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(Error::DiskSpaceCheckFailed(format!(
                "{}: device not ready",
                path.display()
            )));
        }
        Ok(self.values[call.min(self.values.len() - 1)])
    }
}

/// A download request seen by [`FakeArchive`]
#[derive(Clone, Debug)]
pub struct RecordedDownload {
    pub file_ids: Vec<FileId>,
    pub target_dir: PathBuf,
    pub overwrite: OverwriteMode,
}

/// Archive serving listings from memory and writing small files on download
#[derive(Default)]
pub struct FakeArchive {
    listings: Mutex<HashMap<DatasetId, Vec<ArchivedFileRef>>>,
    downloads: Mutex<Vec<RecordedDownload>>,
    list_calls: AtomicUsize,
    offline: bool,
    fail_downloads: bool,
}

impl FakeArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn failing_downloads() -> Self {
        Self {
            fail_downloads: true,
            ..Self::default()
        }
    }

    pub fn add_file(&self, dataset_id: DatasetId, file_id: i64, sub_dir: &str, filename: &str) {
        self.listings
            .lock()
            .unwrap()
            .entry(dataset_id)
            .or_default()
            .push(ArchivedFileRef {
                file_id: FileId(file_id),
                sub_dir_path: sub_dir.to_string(),
                filename: filename.to_string(),
                size_bytes: None,
                sha256: None,
            });
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> Vec<RecordedDownload> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveClient for FakeArchive {
    async fn find_files_by_dataset_id(&self, dataset_id: DatasetId) -> Result<Vec<ArchivedFileRef>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return Err(Error::Archive(ArchiveError::Offline("maintenance".into())));
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(&dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_files(
        &self,
        files: &BTreeMap<FileId, ArchivedFileRef>,
        target_dir: &Path,
        overwrite: OverwriteMode,
    ) -> Result<DownloadReport> {
        self.downloads.lock().unwrap().push(RecordedDownload {
            file_ids: files.keys().copied().collect(),
            target_dir: target_dir.to_path_buf(),
            overwrite,
        });
        if self.fail_downloads {
            return Err(Error::Other("connection dropped".into()));
        }

        let mut report = DownloadReport::default();
        for file in files.values() {
            let path = target_dir.join(file.relative_path());
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(&path, b"cached")?;
            report.downloaded.push(file.file_id);
            report.bytes_downloaded += 6;
        }
        Ok(report)
    }
}
