//! Store seams used by the evictor, processor and runner
//!
//! The agent talks to its task store only through these traits. The SQLite
//! [`Database`] implements all three; tests substitute in-memory fakes.

use crate::db::Database;
use crate::error::Result;
use crate::types::{CacheFileEntry, EntryId, TaskId, TaskLease};
use async_trait::async_trait;

/// Read and bulk-update access to cache entry records
#[async_trait]
pub trait CacheEntryStore: Send + Sync {
    /// Entries of a leased task; task 0 previews the next queued dataset
    async fn get_files_to_cache(&self, task_id: TaskId) -> Result<Vec<CacheFileEntry>>;

    /// Up to `limit` cached entries ordered by request time, oldest first
    async fn get_oldest_cached(&self, limit: usize) -> Result<Vec<CacheFileEntry>>;

    /// Move entries to the purged state, returning the rows actually changed
    ///
    /// Must not fail for entries that are already purged.
    async fn mark_purged(&self, ids: &[EntryId]) -> Result<u64>;
}

/// Task lease and completion calls
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Lease the next available task for `processor`
    async fn request_task(&self, processor: &str) -> Result<TaskLease>;

    /// Report the outcome of a leased task, returning the store's message
    async fn set_task_complete(
        &self,
        processor: &str,
        task_id: TaskId,
        completion_code: i32,
        completion_message: &str,
        cached_ids_csv: &str,
    ) -> Result<String>;
}

/// Durable (store-backed) log for escalated messages
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append one message
    async fn write_log(&self, posted_by: &str, level: &str, message: &str) -> Result<()>;
}

#[async_trait]
impl CacheEntryStore for Database {
    async fn get_files_to_cache(&self, task_id: TaskId) -> Result<Vec<CacheFileEntry>> {
        Database::get_files_to_cache(self, task_id).await
    }

    async fn get_oldest_cached(&self, limit: usize) -> Result<Vec<CacheFileEntry>> {
        Database::get_oldest_cached(self, limit).await
    }

    async fn mark_purged(&self, ids: &[EntryId]) -> Result<u64> {
        Database::mark_purged(self, ids).await
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn request_task(&self, processor: &str) -> Result<TaskLease> {
        Database::request_task(self, processor).await
    }

    async fn set_task_complete(
        &self,
        processor: &str,
        task_id: TaskId,
        completion_code: i32,
        completion_message: &str,
        cached_ids_csv: &str,
    ) -> Result<String> {
        Database::set_task_complete(
            self,
            processor,
            task_id,
            completion_code,
            completion_message,
            cached_ids_csv,
        )
        .await?;
        Ok(format!(
            "Task {} marked complete with code {}",
            task_id, completion_code
        ))
    }
}

#[async_trait]
impl DurableLog for Database {
    async fn write_log(&self, posted_by: &str, level: &str, message: &str) -> Result<()> {
        Database::write_log(self, posted_by, level, message).await
    }
}
