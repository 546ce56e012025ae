//! Free-space driven eviction of cached files
//!
//! The evictor keeps the cache volume above a free-space floor. It repeatedly
//! takes the oldest cached entries from the store, measures free space at
//! their cache root, and when space is short deletes files oldest-first until
//! enough bytes have been reclaimed. Every entry it processes is marked purged,
//! including entries whose file was already gone.

use crate::config::{CacheConfig, RetryConfig};
use crate::disk_space::{DiskSpaceProbe, bytes_to_gb, gb_to_bytes};
use crate::error::{Error, Result};
use crate::logging::{ErrorBudget, Severity};
use crate::retry::call_with_retry;
use crate::store::{CacheEntryStore, DurableLog};
use crate::types::{CacheFileEntry, EntryId, Event, Perspective};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Totals for one eviction run
#[must_use]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvictionSummary {
    /// Batches processed
    pub iterations: u32,
    /// Files actually deleted from disk
    pub files_deleted: usize,
    /// Bytes reclaimed by those deletions
    pub bytes_freed: u64,
    /// Entries marked purged, including ones whose file was missing
    pub entries_purged: usize,
    /// Free space at the cache root at the last measurement, in GB
    pub last_free_gb: Option<f64>,
}

/// Outcome of purging one batch
#[derive(Debug, Default)]
struct BatchPurge {
    purged: Vec<EntryId>,
    files_deleted: usize,
    bytes_freed: u64,
    parent_dirs: BTreeSet<(PathBuf, PathBuf)>,
}

/// Evicts the oldest cached files until free space clears the floor
pub struct Evictor {
    store: Arc<dyn CacheEntryStore>,
    probe: Arc<dyn DiskSpaceProbe>,
    durable: Option<Arc<dyn DurableLog>>,
    event_tx: Option<broadcast::Sender<Event>>,
    posted_by: String,
    retry: RetryConfig,
    minimum_free_space_gb: u64,
    perspective: Perspective,
    batch_size: usize,
    max_iterations: u32,
    durable_error_limit: u32,
}

impl Evictor {
    /// Create an evictor with the cache settings from `config`
    pub fn new(
        store: Arc<dyn CacheEntryStore>,
        probe: Arc<dyn DiskSpaceProbe>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            probe,
            durable: None,
            event_tx: None,
            posted_by: "archive-cacher".to_string(),
            retry: RetryConfig::default(),
            minimum_free_space_gb: config.minimum_free_space_gb,
            perspective: config.perspective,
            batch_size: config.effective_batch_size(),
            max_iterations: config.max_purge_iterations,
            durable_error_limit: crate::config::DEFAULT_DURABLE_ERROR_LIMIT,
        }
    }

    /// Escalate deletion failures to `durable`, at most `limit` per batch
    pub fn with_durable_log(
        mut self,
        durable: Arc<dyn DurableLog>,
        posted_by: impl Into<String>,
        limit: u32,
    ) -> Self {
        self.durable = Some(durable);
        self.posted_by = posted_by.into();
        self.durable_error_limit = limit;
        self
    }

    /// Retry store calls according to `retry`
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Publish eviction events on `event_tx`
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run eviction until the floor is met
    ///
    /// A floor of 0 disables eviction. Fails when space stays short with
    /// nothing left to purge, when free space cannot be measured, or when the
    /// loop exceeds its iteration ceiling.
    pub async fn run(&self) -> Result<EvictionSummary> {
        let mut summary = EvictionSummary::default();

        if self.minimum_free_space_gb == 0 {
            tracing::debug!("minimum free space is 0; eviction disabled");
            return Ok(summary);
        }

        let floor_gb = self.minimum_free_space_gb as f64;
        let mut cache_root: Option<PathBuf> = None;
        let mut purged_this_run: HashSet<EntryId> = HashSet::new();

        loop {
            if summary.iterations >= self.max_iterations {
                return Err(Error::RunawayEviction {
                    iterations: self.max_iterations,
                });
            }
            summary.iterations += 1;

            let batch: Vec<CacheFileEntry> = call_with_retry(&self.retry, "get_oldest_cached", || {
                self.store.get_oldest_cached(self.batch_size)
            })
            .await?
            .into_iter()
                .filter(|entry| !purged_this_run.contains(&entry.entry_id))
                .collect();

            let Some(first) = batch.first() else {
                return match (&cache_root, summary.last_free_gb) {
                    (Some(_), Some(free_gb)) => Err(Error::InsufficientSpace {
                        free_gb,
                        floor_gb: self.minimum_free_space_gb,
                    }),
                    _ => {
                        tracing::debug!("no cached files; nothing to evict");
                        Ok(summary)
                    }
                };
            };

            let root_str = self.perspective.root_of(first);
            if root_str.trim().is_empty() {
                return Err(Error::MissingCachePath {
                    entry_id: first.entry_id.0,
                    filename: first.filename.clone(),
                    field: self.perspective.path_field(),
                });
            }
            let root = PathBuf::from(root_str);

            let free_bytes = self.probe.free_bytes(&root)?;
            let free_gb = bytes_to_gb(free_bytes);
            summary.last_free_gb = Some(free_gb);
            cache_root = Some(root.clone());

            if free_gb > floor_gb {
                if summary.iterations == 1 {
                    tracing::debug!(
                        free_gb,
                        floor_gb = self.minimum_free_space_gb,
                        root = %root.display(),
                        "free space above threshold; eviction not required"
                    );
                }
                return Ok(summary);
            }

            tracing::info!(
                free_gb,
                floor_gb = self.minimum_free_space_gb,
                root = %root.display(),
                "free space below threshold; purging old cached files"
            );
            self.emit(Event::EvictionRequired {
                free_gb,
                floor_gb: self.minimum_free_space_gb,
            });

            let mut budget = ErrorBudget::new(
                self.durable.clone(),
                self.posted_by.clone(),
                self.durable_error_limit,
            );
            let bytes_to_reclaim = gb_to_bytes(floor_gb - free_gb);
            let outcome = self.purge_batch(&batch, bytes_to_reclaim, &mut budget).await;

            tracing::info!(
                "Deleted {} files to free up {:.2} GB in {}",
                outcome.files_deleted,
                bytes_to_gb(outcome.bytes_freed),
                root.display()
            );

            if !outcome.purged.is_empty() {
                let updated = call_with_retry(&self.retry, "mark_purged", || {
                    self.store.mark_purged(&outcome.purged)
                })
                .await?;
                if updated < outcome.purged.len() as u64 {
                    budget
                        .report(
                            Severity::Warning,
                            &format!(
                                "Marked {} of {} cache entries as purged",
                                updated,
                                outcome.purged.len()
                            ),
                        )
                        .await;
                }
            }

            remove_empty_parent_dirs(&outcome.parent_dirs).await;

            self.emit(Event::FilesPurged {
                files_deleted: outcome.files_deleted,
                bytes_freed: outcome.bytes_freed,
                cache_root: root,
            });

            summary.files_deleted += outcome.files_deleted;
            summary.bytes_freed += outcome.bytes_freed;
            summary.entries_purged += outcome.purged.len();
            purged_this_run.extend(outcome.purged);
        }
    }

    /// Delete files oldest-first until `bytes_to_reclaim` is met
    ///
    /// Stops right after the deletion that reaches the target. Missing files
    /// and failed deletions do not stop the batch; their entries are still
    /// reported as purged.
    async fn purge_batch(
        &self,
        batch: &[CacheFileEntry],
        bytes_to_reclaim: u64,
        budget: &mut ErrorBudget,
    ) -> BatchPurge {
        let mut outcome = BatchPurge::default();

        for entry in batch {
            let root = PathBuf::from(self.perspective.root_of(entry));
            let path = entry.path_under(&root);

            match delete_cached_file(&path).await {
                Ok(Some(bytes)) => {
                    tracing::debug!(entry_id = entry.entry_id.0, path = %path.display(), bytes, "deleted cached file");
                    outcome.files_deleted += 1;
                    outcome.bytes_freed += bytes;
                }
                Ok(None) => {
                    tracing::debug!(entry_id = entry.entry_id.0, path = %path.display(), "cached file already gone");
                }
                Err(e) => {
                    budget
                        .report(
                            Severity::Error,
                            &format!("Error deleting {}: {}", path.display(), e),
                        )
                        .await;
                }
            }

            outcome.purged.push(entry.entry_id);
            if let Some(parent) = path.parent() {
                outcome
                    .parent_dirs
                    .insert((parent.to_path_buf(), root.clone()));
            }

            if outcome.files_deleted > 0 && outcome.bytes_freed >= bytes_to_reclaim {
                break;
            }
        }

        outcome
    }
}

/// Delete one cached file, returning its length, or `None` if it was absent
async fn delete_cached_file(path: &Path) -> std::io::Result<Option<u64>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        tokio::fs::set_permissions(path, permissions).await?;
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove directories left empty by a purge, deepest first
///
/// Walks up from each directory and stops at the first non-empty directory or
/// at the cache root, which is never removed.
async fn remove_empty_parent_dirs(dirs: &BTreeSet<(PathBuf, PathBuf)>) {
    let mut ordered: Vec<&(PathBuf, PathBuf)> = dirs.iter().collect();
    ordered.sort_by_key(|(dir, _)| std::cmp::Reverse(dir.components().count()));

    for (dir, root) in ordered {
        let mut current = dir.as_path();
        while current != root.as_path() && current.starts_with(root) {
            match tokio::fs::remove_dir(current).await {
                Ok(()) => tracing::debug!(dir = %current.display(), "removed empty directory"),
                // Not empty, already gone, or not removable; stop climbing
                Err(_) => break,
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }
}
