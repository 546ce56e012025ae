//! Cache entry queries and state transitions.

use crate::error::DatabaseError;
use crate::types::{CacheFileEntry, CacheState, EntryId, TaskId};
use crate::{Error, Result};

use super::{CacheEntryRow, Database, ENTRY_COLUMNS, NewCacheEntry, rows_to_entries};

impl Database {
    /// Queue a file to be cached
    pub async fn queue_file(&self, entry: &NewCacheEntry) -> Result<EntryId> {
        let queued_at = entry.queued_at.unwrap_or_else(chrono::Utc::now).timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (
                dataset_id, job, client_path, server_path, parent_path,
                dataset_folder, results_folder_name, filename, queued_at,
                optional, state
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.dataset_id)
        .bind(entry.job)
        .bind(&entry.client_path)
        .bind(&entry.server_path)
        .bind(entry.parent_path.trim_start_matches(['\\', '/']))
        .bind(&entry.dataset_folder)
        .bind(&entry.results_folder_name)
        .bind(&entry.filename)
        .bind(queued_at)
        .bind(if entry.optional { 1i32 } else { 0i32 })
        .bind(CacheState::Queued.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to queue cache entry: {}",
                e
            )))
        })?;

        Ok(EntryId(result.last_insert_rowid()))
    }

    /// Get a cache entry by ID
    pub async fn get_entry(&self, id: EntryId) -> Result<Option<CacheFileEntry>> {
        let row = sqlx::query_as::<_, CacheEntryRow>(&format!(
            "SELECT {} FROM cache_entries WHERE entry_id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get cache entry: {}",
                e
            )))
        })?;

        row.map(CacheFileEntry::try_from).transpose()
    }

    /// Get the files a task should cache
    ///
    /// Task id 0 selects the queued entries of the first dataset that has any
    /// (the oldest request wins), without touching task assignment.
    pub async fn get_files_to_cache(&self, task_id: TaskId) -> Result<Vec<CacheFileEntry>> {
        let rows = if task_id == 0 {
            sqlx::query_as::<_, CacheEntryRow>(&format!(
                r#"
                SELECT {} FROM cache_entries
                WHERE state = ?
                  AND dataset_id = (
                      SELECT dataset_id FROM cache_entries
                      WHERE state = ?
                      ORDER BY queued_at ASC, entry_id ASC
                      LIMIT 1
                  )
                ORDER BY entry_id ASC
                "#,
                ENTRY_COLUMNS
            ))
            .bind(CacheState::Queued.to_i32())
            .bind(CacheState::Queued.to_i32())
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, CacheEntryRow>(&format!(
                "SELECT {} FROM cache_entries WHERE task_id = ? AND state = ? ORDER BY entry_id ASC",
                ENTRY_COLUMNS
            ))
            .bind(task_id)
            .bind(CacheState::InProgress.to_i32())
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get files to cache: {}",
                e
            )))
        })?;

        rows_to_entries(rows)
    }

    /// Get up to `limit` cached entries, oldest request first
    pub async fn get_oldest_cached(&self, limit: usize) -> Result<Vec<CacheFileEntry>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(&format!(
            r#"
            SELECT {} FROM cache_entries
            WHERE state = ?
            ORDER BY queued_at ASC, entry_id ASC
            LIMIT ?
            "#,
            ENTRY_COLUMNS
        ))
        .bind(CacheState::Cached.to_i32())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get cached entries: {}",
                e
            )))
        })?;

        rows_to_entries(rows)
    }

    /// Mark entries as purged, returning how many rows actually changed
    ///
    /// Entries that are already purged are not counted, so repeating a call
    /// with the same ids reports 0.
    pub async fn mark_purged(&self, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("UPDATE cache_entries SET state = ");
        query_builder.push_bind(CacheState::Purged.to_i32());
        query_builder.push(" WHERE state != ");
        query_builder.push_bind(CacheState::Purged.to_i32());
        query_builder.push(" AND entry_id IN (");

        let mut separated = query_builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to mark entries purged: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Count entries in a given state
    pub async fn count_entries_in_state(&self, state: CacheState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE state = ?")
            .bind(state.to_i32())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count cache entries: {}",
                    e
                )))
            })?;

        Ok(count)
    }
}
