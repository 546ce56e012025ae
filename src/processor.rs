//! Resolve and download the files of one leased task
//!
//! A task's entries are matched against the archive's listing for their
//! dataset, every matched file is downloaded into the dataset directory in one
//! batch, and the outcome is summarised as a [`CompletionResult`] for the
//! store. Whether the task succeeded is decided by the match count; a failed
//! download is logged but does not change the completion code.

use crate::archive::ArchiveClient;
use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::logging::{ErrorBudget, Severity};
use crate::matcher::match_files;
use crate::retry::call_with_retry;
use crate::store::{CacheEntryStore, DurableLog};
use crate::types::{
    ArchivedFileRef, COMPLETION_GENERIC_FAILURE, COMPLETION_INCOMPLETE, COMPLETION_NO_FILES,
    COMPLETION_SUCCESS, CacheTask, CompletionResult, FileId, OverwriteMode, Perspective, TaskId,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Processes leased tasks one at a time
pub struct TaskProcessor {
    store: Arc<dyn CacheEntryStore>,
    archive: Arc<dyn ArchiveClient>,
    durable: Option<Arc<dyn DurableLog>>,
    posted_by: String,
    perspective: Perspective,
    overwrite: OverwriteMode,
    retry: RetryConfig,
    durable_error_limit: u32,
}

impl TaskProcessor {
    /// Create a processor using the perspective and overwrite mode from `config`
    pub fn new(
        store: Arc<dyn CacheEntryStore>,
        archive: Arc<dyn ArchiveClient>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            archive,
            durable: None,
            posted_by: "archive-cacher".to_string(),
            perspective: config.cache.perspective,
            overwrite: config.archive.overwrite,
            retry: config.retry.clone(),
            durable_error_limit: config.logging.durable_error_limit,
        }
    }

    /// Escalate per-task errors to `durable` as `posted_by`
    pub fn with_durable_log(mut self, durable: Arc<dyn DurableLog>, posted_by: impl Into<String>) -> Self {
        self.durable = Some(durable);
        self.posted_by = posted_by.into();
        self
    }

    /// Process task `task_id` and describe the outcome
    ///
    /// Never fails: errors are logged and reported as a generic failure code.
    pub async fn process(&self, task_id: TaskId) -> CompletionResult {
        let mut budget = ErrorBudget::new(
            self.durable.clone(),
            self.posted_by.clone(),
            self.durable_error_limit,
        );

        let entries = match call_with_retry(&self.retry, "get_files_to_cache", || {
            self.store.get_files_to_cache(task_id)
        })
        .await
        {
            Ok(entries) => entries,
            Err(e) => return failure(&mut budget, task_id, e).await,
        };

        let Some(first) = entries.first() else {
            tracing::warn!(task_id = task_id.0, "no queued files for task");
            return CompletionResult {
                completion_code: COMPLETION_NO_FILES,
                message: "did not find any queued files for this task".to_string(),
                ..Default::default()
            };
        };

        let task = CacheTask {
            task_id,
            dataset_id: first.dataset_id,
            entries,
        };

        match self.cache_task(&task, &mut budget).await {
            Ok(result) => result,
            Err(e) => failure(&mut budget, task_id, e).await,
        }
    }

    async fn cache_task(&self, task: &CacheTask, budget: &mut ErrorBudget) -> Result<CompletionResult> {
        tracing::info!(
            task_id = task.task_id.0,
            dataset_id = task.dataset_id.0,
            files = task.entries.len(),
            "processing task"
        );

        let available = self.archive.find_files_by_dataset_id(task.dataset_id).await?;
        let outcome = match_files(&task.entries, &available);

        for entry in &outcome.unmatched_required {
            budget
                .report(
                    Severity::Error,
                    &format!(
                        "File not found in the archive for dataset {}: {}",
                        entry.dataset_id,
                        entry.display_name()
                    ),
                )
                .await;
        }

        let downloads: BTreeMap<FileId, ArchivedFileRef> = task
            .entries
            .iter()
            .filter_map(|entry| {
                let file = outcome.matches.get(&entry.entry_id)?;
                Some((file.file_id, file.placed_for(entry)))
            })
            .collect();

        if !downloads.is_empty() {
            let first = &task.entries[0];
            if self.perspective.root_of(first).trim().is_empty() {
                return Err(Error::MissingCachePath {
                    entry_id: first.entry_id.0,
                    filename: first.filename.clone(),
                    field: self.perspective.path_field(),
                });
            }
            let target_dir = first.dataset_dir(self.perspective);

            match self
                .archive
                .download_files(&downloads, &target_dir, self.overwrite)
                .await
            {
                Ok(report) => {
                    tracing::info!(
                        task_id = task.task_id.0,
                        downloaded = report.downloaded.len(),
                        skipped = report.skipped.len(),
                        failed = report.failed.len(),
                        bytes = report.bytes_downloaded,
                        target = %target_dir.display(),
                        "download finished"
                    );
                    for (file_id, reason) in &report.failed {
                        budget
                            .report(
                                Severity::Error,
                                &format!("Error downloading file {}: {}", file_id, reason),
                            )
                            .await;
                    }
                }
                Err(e) => {
                    budget
                        .report(
                            Severity::Error,
                            &format!(
                                "Error downloading files for dataset {} to {}: {}",
                                task.dataset_id,
                                target_dir.display(),
                                e
                            ),
                        )
                        .await;
                }
            }
        }

        let cached_entry_ids = outcome.matches.keys().copied().collect();

        if outcome.is_complete() {
            tracing::info!(
                task_id = task.task_id.0,
                cached = outcome.matches.len(),
                skipped_optional = outcome.skipped_optional,
                "task complete"
            );
            return Ok(CompletionResult {
                completion_code: COMPLETION_SUCCESS,
                message: format!(
                    "Cached {} files for dataset {}",
                    outcome.matches.len(),
                    task.dataset_id
                ),
                cached_entry_ids,
            });
        }

        let message = format!(
            "Unable to cache all of the requested files: {} requested vs. {} actually cached",
            outcome.expected_count(),
            outcome.matches.len()
        );
        budget.report(Severity::Warning, &message).await;

        Ok(CompletionResult {
            completion_code: COMPLETION_INCOMPLETE,
            message,
            cached_entry_ids,
        })
    }
}

async fn failure(budget: &mut ErrorBudget, task_id: TaskId, error: Error) -> CompletionResult {
    let message = format!("Error processing task {}: {}", task_id, error);
    budget.report(Severity::Error, &message).await;
    CompletionResult {
        completion_code: COMPLETION_GENERIC_FAILURE,
        message,
        ..Default::default()
    }
}
