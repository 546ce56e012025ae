//! Task lease and completion.

use crate::error::DatabaseError;
use crate::types::{CacheState, DatasetId, EntryId, TaskId, TaskLease};
use crate::{Error, Result};

use super::{CacheTaskRow, Database, task_state};

fn query_failed(context: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

/// Parse the comma-joined entry id list sent with a completion
pub(crate) fn parse_entry_ids(csv: &str) -> Result<Vec<EntryId>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<EntryId>().map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Invalid cached entry id '{}': {}",
                    s, e
                )))
            })
        })
        .collect()
}

impl Database {
    /// Create a task for the queued, unassigned entries of a dataset
    ///
    /// Returns `None` when the dataset has nothing to assign.
    pub async fn create_task(&self, dataset_id: DatasetId) -> Result<Option<TaskId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO cache_tasks (dataset_id, state, created_at) VALUES (?, ?, ?)",
        )
        .bind(dataset_id)
        .bind(task_state::NEW)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to insert cache task", e))?;

        let task_id = TaskId(result.last_insert_rowid());

        let assigned = sqlx::query(
            r#"
            UPDATE cache_entries SET task_id = ?
            WHERE dataset_id = ? AND state = ? AND task_id IS NULL
            "#,
        )
        .bind(task_id)
        .bind(dataset_id)
        .bind(CacheState::Queued.to_i32())
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to assign entries to task", e))?
        .rows_affected();

        if assigned == 0 {
            tx.rollback()
                .await
                .map_err(|e| query_failed("Failed to roll back empty task", e))?;
            return Ok(None);
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit cache task", e))?;

        tracing::debug!(task_id = task_id.0, dataset_id = dataset_id.0, assigned, "created cache task");

        Ok(Some(task_id))
    }

    /// Lease the lowest-numbered new task to `processor`
    ///
    /// The task's queued entries move to in progress in the same transaction.
    pub async fn request_task(&self, processor: &str) -> Result<TaskLease> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let task_id: Option<TaskId> = sqlx::query_scalar(
            "SELECT task_id FROM cache_tasks WHERE state = ? ORDER BY task_id ASC LIMIT 1",
        )
        .bind(task_state::NEW)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to find a new task", e))?;

        let Some(task_id) = task_id else {
            tx.commit()
                .await
                .map_err(|e| query_failed("Failed to commit task request", e))?;
            return Ok(TaskLease::none("No tasks found"));
        };

        sqlx::query(
            r#"
            UPDATE cache_tasks SET state = ?, processor = ?, leased_at = ?
            WHERE task_id = ? AND state = ?
            "#,
        )
        .bind(task_state::LEASED)
        .bind(processor)
        .bind(chrono::Utc::now().timestamp())
        .bind(task_id)
        .bind(task_state::NEW)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to lease task", e))?;

        sqlx::query("UPDATE cache_entries SET state = ? WHERE task_id = ? AND state = ?")
            .bind(CacheState::InProgress.to_i32())
            .bind(task_id)
            .bind(CacheState::Queued.to_i32())
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to mark task entries in progress", e))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit task lease", e))?;

        Ok(TaskLease {
            available: true,
            task_id,
            message: format!("Task {} leased to {}", task_id, processor),
        })
    }

    /// Record the completion of a leased task
    ///
    /// Entries listed in `cached_ids_csv` become cached. On a nonzero
    /// completion code the remaining in-progress entries go back to the
    /// queue, detached from the task, so a later task can pick them up.
    pub async fn set_task_complete(
        &self,
        processor: &str,
        task_id: TaskId,
        completion_code: i32,
        completion_message: &str,
        cached_ids_csv: &str,
    ) -> Result<()> {
        let cached_ids = parse_entry_ids(cached_ids_csv)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let task = sqlx::query_as::<_, CacheTaskRow>(
            r#"
            SELECT task_id, dataset_id, state, processor, leased_at, completed_at,
                   completion_code, completion_message
            FROM cache_tasks WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to load task", e))?
        .ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!("cache task {}", task_id)))
        })?;

        if task.state != task_state::LEASED || task.processor.as_deref() != Some(processor) {
            return Err(Error::Database(DatabaseError::LeaseNotHeld {
                task_id: task_id.0,
                processor: processor.to_string(),
            }));
        }

        if !cached_ids.is_empty() {
            let mut query_builder = sqlx::QueryBuilder::new("UPDATE cache_entries SET state = ");
            query_builder.push_bind(CacheState::Cached.to_i32());
            query_builder.push(" WHERE task_id = ");
            query_builder.push_bind(task_id);
            query_builder.push(" AND entry_id IN (");

            let mut separated = query_builder.separated(", ");
            for id in &cached_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to mark entries cached", e))?;
        }

        if completion_code != 0 {
            sqlx::query(
                r#"
                UPDATE cache_entries SET state = ?, task_id = NULL
                WHERE task_id = ? AND state = ?
                "#,
            )
            .bind(CacheState::Queued.to_i32())
            .bind(task_id)
            .bind(CacheState::InProgress.to_i32())
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to requeue unfinished entries", e))?;
        }

        let final_state = if completion_code == 0 {
            task_state::COMPLETE
        } else {
            task_state::FAILED
        };

        sqlx::query(
            r#"
            UPDATE cache_tasks
            SET state = ?, completed_at = ?, completion_code = ?, completion_message = ?
            WHERE task_id = ?
            "#,
        )
        .bind(final_state)
        .bind(chrono::Utc::now().timestamp())
        .bind(completion_code)
        .bind(completion_message)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to record task completion", e))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit task completion", e))?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<CacheTaskRow>> {
        sqlx::query_as::<_, CacheTaskRow>(
            r#"
            SELECT task_id, dataset_id, state, processor, leased_at, completed_at,
                   completion_code, completion_message
            FROM cache_tasks WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get task", e))
    }
}
