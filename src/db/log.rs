//! Durable log writes.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, LogEntryRow};

impl Database {
    /// Append a message to the durable log
    pub async fn write_log(&self, posted_by: &str, level: &str, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO log_entries (posted_by, level, message, posted_at) VALUES (?, ?, ?, ?)",
        )
        .bind(posted_by)
        .bind(level)
        .bind(message)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write log entry: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// List the most recent durable log entries, newest first
    pub async fn list_log_entries(&self, limit: usize) -> Result<Vec<LogEntryRow>> {
        sqlx::query_as::<_, LogEntryRow>(
            r#"
            SELECT id, posted_by, level, message, posted_at
            FROM log_entries
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list log entries: {}",
                e
            )))
        })
    }
}
