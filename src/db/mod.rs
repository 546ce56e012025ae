//! Database layer for archive-cacher
//!
//! SQLite realisation of the task store: cache tasks, cache entries and the
//! durable log.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`entries`] — Cache entry queries and state transitions
//! - [`tasks`] — Task lease and completion
//! - [`log`] — Durable log writes

use crate::error::{DatabaseError, Error, Result};
use crate::types::{CacheFileEntry, CacheState, DatasetId, EntryId};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod entries;
mod log;
mod migrations;
pub(crate) mod tasks;

/// Column list shared by every cache entry query
pub(crate) const ENTRY_COLUMNS: &str = "entry_id, task_id, dataset_id, job, client_path, \
    server_path, parent_path, dataset_folder, results_folder_name, filename, queued_at, \
    optional, state";

/// Task state constants
pub mod task_state {
    /// Created and waiting for a processor
    pub const NEW: i32 = 0;
    /// Leased by a processor
    pub const LEASED: i32 = 1;
    /// Completed with code 0
    pub const COMPLETE: i32 = 2;
    /// Completed with a nonzero code
    pub const FAILED: i32 = 3;
}

/// New cache entry to be queued
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    /// Dataset the file belongs to
    pub dataset_id: DatasetId,
    /// Job that produced the file
    pub job: i64,
    /// Cache root as seen by remote clients
    pub client_path: String,
    /// Cache root as seen by the server
    pub server_path: String,
    /// First path segment below the root
    pub parent_path: String,
    /// Dataset directory name
    pub dataset_folder: String,
    /// Results directory name
    pub results_folder_name: String,
    /// File name
    pub filename: String,
    /// Request time (defaults to now)
    pub queued_at: Option<DateTime<Utc>>,
    /// Absence in the archive is not an error
    pub optional: bool,
}

/// Cache entry record from database
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    /// Unique database ID
    pub entry_id: i64,
    /// Task the entry is assigned to, if any
    pub task_id: Option<i64>,
    /// Dataset the file belongs to
    pub dataset_id: i64,
    /// Job that produced the file
    pub job: i64,
    /// Cache root as seen by remote clients
    pub client_path: String,
    /// Cache root as seen by the server
    pub server_path: String,
    /// First path segment below the root
    pub parent_path: String,
    /// Dataset directory name
    pub dataset_folder: String,
    /// Results directory name
    pub results_folder_name: String,
    /// File name
    pub filename: String,
    /// Unix timestamp when the file was requested
    pub queued_at: i64,
    /// Optional flag (0 = required, 1 = optional)
    pub optional: i32,
    /// Entry state code (see [`CacheState`])
    pub state: i32,
}

impl TryFrom<CacheEntryRow> for CacheFileEntry {
    type Error = Error;

    fn try_from(row: CacheEntryRow) -> Result<Self> {
        let state = CacheState::from_i32(row.state).ok_or_else(|| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "entry {} has unknown state {}",
                row.entry_id, row.state
            )))
        })?;

        Ok(CacheFileEntry {
            entry_id: EntryId(row.entry_id),
            dataset_id: DatasetId(row.dataset_id),
            job: row.job,
            client_path: row.client_path,
            server_path: row.server_path,
            parent_path: row.parent_path.trim_start_matches(['\\', '/']).to_string(),
            dataset_folder: row.dataset_folder,
            results_folder_name: row.results_folder_name,
            filename: row.filename,
            queued_at: Utc
                .timestamp_opt(row.queued_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            optional: row.optional != 0,
            state,
        })
    }
}

/// Cache task record from database
#[derive(Debug, Clone, FromRow)]
pub struct CacheTaskRow {
    /// Unique database ID
    pub task_id: i64,
    /// Dataset the task covers
    pub dataset_id: i64,
    /// Task state (see [`task_state`])
    pub state: i32,
    /// Processor holding or last holding the lease
    pub processor: Option<String>,
    /// Unix timestamp of the lease
    pub leased_at: Option<i64>,
    /// Unix timestamp of completion
    pub completed_at: Option<i64>,
    /// Reported completion code
    pub completion_code: Option<i32>,
    /// Reported completion message
    pub completion_message: Option<String>,
}

/// Durable log record from database
#[derive(Debug, Clone, FromRow)]
pub struct LogEntryRow {
    /// Unique database ID
    pub id: i64,
    /// Component or processor that posted the message
    pub posted_by: String,
    /// Level name ("ERROR", "WARN", "INFO")
    pub level: String,
    /// Message text
    pub message: String,
    /// Unix timestamp when the message was posted
    pub posted_at: i64,
}

/// Convert a list of rows into domain entries
pub(crate) fn rows_to_entries(rows: Vec<CacheEntryRow>) -> Result<Vec<CacheFileEntry>> {
    rows.into_iter().map(CacheFileEntry::try_from).collect()
}

/// Database handle for archive-cacher
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
