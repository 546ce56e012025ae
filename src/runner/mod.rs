//! The cache agent: run context and task loop
//!
//! [`CacheAgent`] owns everything a run needs (store handles, archive client,
//! free-space probe, event channel) and is constructed once per process. A run
//! first evicts old files if the cache volume is short of space, then leases
//! and processes tasks until the store has none left. Preview mode only lists
//! what the next task would cache.

use crate::archive::{ArchiveClient, HttpArchiveClient};
use crate::config::Config;
use crate::db::Database;
use crate::disk_space::{DiskSpaceProbe, SystemDiskSpace};
use crate::error::{Error, Result};
use crate::evictor::{EvictionSummary, Evictor};
use crate::logging::{ErrorBudget, Severity};
use crate::processor::TaskProcessor;
use crate::retry::call_with_retry;
use crate::store::{CacheEntryStore, DurableLog, TaskStore};
use crate::types::{Event, TaskId};
use std::sync::Arc;
use tokio::sync::broadcast;

mod preview;

pub use preview::PreviewListing;

/// Outcome of one [`CacheAgent::start`] call
#[must_use]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    /// Eviction totals, when eviction ran
    pub eviction: Option<EvictionSummary>,
    /// Tasks leased and reported
    pub tasks_processed: u32,
    /// Tasks that completed with a non-zero code
    pub tasks_failed: u32,
    /// Listing produced in preview mode
    pub preview: Option<PreviewListing>,
    /// Message describing the failure that made the run unsuccessful
    pub error_message: Option<String>,
}

impl RunReport {
    /// Whether the run finished without a failure
    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

/// Cache agent for one process invocation
pub struct CacheAgent {
    config: Arc<Config>,
    entries: Arc<dyn CacheEntryStore>,
    tasks: Arc<dyn TaskStore>,
    durable: Arc<dyn DurableLog>,
    archive: Arc<dyn ArchiveClient>,
    probe: Arc<dyn DiskSpaceProbe>,
    database: Option<Arc<Database>>,
    processor_name: String,
    event_tx: broadcast::Sender<Event>,
}

impl CacheAgent {
    /// Open the SQLite store and the HTTP archive client described by `config`
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(1000);
        let database = Arc::new(Database::new(&config.store.database_path).await?);
        let archive = HttpArchiveClient::new(&config.archive)?.with_events(event_tx.clone());

        let mut agent = Self::assemble(
            config,
            database.clone(),
            Arc::new(archive),
            Arc::new(SystemDiskSpace),
            event_tx,
        );
        agent.database = Some(database);
        Ok(agent)
    }

    /// Build an agent around caller-supplied collaborators
    pub fn from_parts<S>(
        config: Config,
        store: Arc<S>,
        archive: Arc<dyn ArchiveClient>,
        probe: Arc<dyn DiskSpaceProbe>,
    ) -> Self
    where
        S: CacheEntryStore + TaskStore + DurableLog + 'static,
    {
        let (event_tx, _) = broadcast::channel(1000);
        Self::assemble(config, store, archive, probe, event_tx)
    }

    fn assemble<S>(
        config: Config,
        store: Arc<S>,
        archive: Arc<dyn ArchiveClient>,
        probe: Arc<dyn DiskSpaceProbe>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self
    where
        S: CacheEntryStore + TaskStore + DurableLog + 'static,
    {
        let processor_name = config.processor_name();
        Self {
            config: Arc::new(config),
            entries: store.clone(),
            tasks: store.clone(),
            durable: store,
            archive,
            probe,
            database: None,
            processor_name,
            event_tx,
        }
    }

    /// Subscribe to agent events
    ///
    /// Events emitted before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Name presented to the store when leasing tasks
    pub fn processor_name(&self) -> &str {
        &self.processor_name
    }

    /// Current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Run the agent once
    ///
    /// In preview mode the next dataset's queued files are listed and nothing
    /// is changed. Otherwise eviction runs first; when it fails no task is
    /// leased. Tasks are then processed until none are available. A task that
    /// fails is reported and the loop moves on to the next one.
    pub async fn start(&self, preview: bool) -> RunReport {
        tracing::info!("=== Started archive-cacher v{} ===", env!("CARGO_PKG_VERSION"));

        let mut budget = ErrorBudget::new(
            Some(self.durable.clone()),
            self.processor_name.clone(),
            self.config.logging.durable_error_limit,
        );
        let mut report = RunReport::default();

        if preview {
            match self.preview().await {
                Ok(listing) => report.preview = Some(listing),
                Err(e) => {
                    let message = format!("Error listing queued files: {}", e);
                    tracing::error!("{}", message);
                    self.fail(&mut report, message);
                }
            }
            return report;
        }

        if self.config.cache.minimum_free_space_gb > 0 {
            match self.evictor().run().await {
                Ok(summary) => report.eviction = Some(summary),
                Err(e) => {
                    let message = format!("Error purging old cached files: {}", e);
                    budget.report(Severity::Error, &message).await;
                    self.fail(&mut report, message);
                    return report;
                }
            }
        }

        self.process_tasks(&mut report, &mut budget).await;

        tracing::info!(
            processed = report.tasks_processed,
            failed = report.tasks_failed,
            "run finished"
        );
        report
    }

    /// List the next dataset's queued files without leasing anything
    pub async fn preview(&self) -> Result<PreviewListing> {
        let entries = self.entries.get_files_to_cache(TaskId(0)).await?;
        Ok(PreviewListing::from_entries(
            &entries,
            self.config.cache.perspective,
        ))
    }

    fn evictor(&self) -> Evictor {
        Evictor::new(self.entries.clone(), self.probe.clone(), &self.config.cache)
            .with_durable_log(
                self.durable.clone(),
                self.processor_name.clone(),
                self.config.logging.durable_error_limit,
            )
            .with_events(self.event_tx.clone())
            .with_retry(self.config.retry.clone())
    }

    async fn process_tasks(&self, report: &mut RunReport, budget: &mut ErrorBudget) {
        let processor = TaskProcessor::new(self.entries.clone(), self.archive.clone(), &self.config)
            .with_durable_log(self.durable.clone(), self.processor_name.clone());
        let name = self.processor_name.as_str();

        loop {
            let lease = match call_with_retry(&self.config.retry, "request_task", || {
                self.tasks.request_task(name)
            })
            .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    budget
                        .report(Severity::Error, &format!("Error requesting a task: {}", e))
                        .await;
                    break;
                }
            };

            if !lease.available || lease.task_id == 0 {
                tracing::info!(message = %lease.message, "no more tasks");
                break;
            }

            let task_id = lease.task_id;
            tracing::info!(task_id = task_id.0, processor = name, "leased task");
            self.emit(Event::TaskLeased { task_id });

            let result = processor.process(task_id).await;
            let completion_code = result.completion_code;
            let cached_ids = result.cached_ids_csv();

            match call_with_retry(&self.config.retry, "set_task_complete", || {
                self.tasks.set_task_complete(
                    name,
                    task_id,
                    completion_code,
                    &result.message,
                    &cached_ids,
                )
            })
            .await
            {
                Ok(message) => tracing::debug!(task_id = task_id.0, %message, "reported completion"),
                Err(e) => {
                    budget
                        .report(
                            Severity::Error,
                            &format!("Error reporting completion of task {}: {}", task_id, e),
                        )
                        .await;
                }
            }

            self.emit(Event::TaskCompleted {
                task_id,
                completion_code,
                message: result.message.clone(),
            });

            report.tasks_processed += 1;
            if completion_code != 0 {
                report.tasks_failed += 1;
                let error = Error::TaskProcessing {
                    task_id: task_id.0,
                    code: completion_code,
                    message: result.message,
                };
                self.fail(report, error.to_string());
            }
        }
    }

    fn fail(&self, report: &mut RunReport, message: String) {
        self.emit(Event::Error {
            message: message.clone(),
        });
        report.error_message = Some(message);
    }

    /// Close the store connection, if this agent opened one
    pub async fn close(&self) {
        if let Some(database) = &self.database {
            database.close().await;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_space::gb_to_bytes;
    use crate::test_support::{FakeArchive, FakeProbe, MemoryStore, cached_entry};
    use crate::types::{CacheState, DatasetId, EntryId, Perspective};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(floor_gb: u64) -> Config {
        let mut config = Config::default();
        config.cache.perspective = Perspective::Server;
        config.cache.minimum_free_space_gb = floor_gb;
        config.store.processor_name = Some("tester".into());
        config.retry.initial_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(5);
        config.retry.jitter = false;
        config
    }

    fn agent(
        config: Config,
        store: &Arc<MemoryStore>,
        archive: &Arc<FakeArchive>,
        probe: FakeProbe,
    ) -> CacheAgent {
        CacheAgent::from_parts(config, store.clone(), archive.clone(), Arc::new(probe))
    }

    fn dataset_entries(root: &Path, first_id: i64, dataset: i64, names: &[&str]) -> Vec<crate::types::CacheFileEntry> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut entry = cached_entry(first_id + i as i64, root, name, first_id + i as i64);
                entry.dataset_id = DatasetId(dataset);
                entry.dataset_folder = format!("Dataset_{}", dataset);
                entry
            })
            .collect()
    }

    #[tokio::test]
    async fn test_preview_lists_queued_files_without_mutation() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.add_queued(dataset_entries(dir.path(), 1, 42, &["a.txt", "b.txt", "c.txt"]));
        store.add_queued(dataset_entries(dir.path(), 10, 43, &["z.txt"]));
        let archive = Arc::new(FakeArchive::new());

        let report = agent(config(75), &store, &archive, FakeProbe::failing())
            .start(true)
            .await;

        assert!(report.is_success());
        let listing = report.preview.unwrap();
        assert_eq!(listing.dataset_id, Some(DatasetId(42)));
        assert_eq!(listing.files.len(), 3);
        assert_eq!(
            listing.files[0].1,
            dir.path().join("QExactive/Dataset_42/SIC201/a.txt")
        );
        assert_eq!(store.mutations(), 0);
        assert_eq!(store.request_calls(), 0);
        assert_eq!(archive.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_preview_with_empty_queue() {
        let store = Arc::new(MemoryStore::default());
        let archive = Arc::new(FakeArchive::new());

        let report = agent(config(75), &store, &archive, FakeProbe::new(vec![0]))
            .start(true)
            .await;

        assert!(report.is_success());
        assert!(report.preview.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processes_every_task_then_stops() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.add_task(TaskId(1), dataset_entries(dir.path(), 1, 42, &["a.txt"]));
        store.add_task(TaskId(2), dataset_entries(dir.path(), 2, 43, &["b.txt"]));
        let archive = Arc::new(FakeArchive::new());
        archive.add_file(DatasetId(42), 100, "SIC201", "a.txt");
        archive.add_file(DatasetId(43), 200, "SIC201", "b.txt");

        let agent = agent(config(0), &store, &archive, FakeProbe::failing());
        let mut events = agent.subscribe();
        let report = agent.start(false).await;

        assert!(report.is_success(), "{:?}", report.error_message);
        assert_eq!(report.tasks_processed, 2);
        assert!(report.eviction.is_none());

        let completions = store.completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].task_id, TaskId(1));
        assert_eq!(completions[0].code, 0);
        assert_eq!(completions[0].cached_ids_csv, "1");
        assert_eq!(completions[1].processor, "tester");
        assert_eq!(store.state_of(EntryId(2)), Some(CacheState::Cached));
        assert!(dir.path().join("QExactive/Dataset_43/SIC201/b.txt").exists());

        assert_eq!(events.recv().await.unwrap(), Event::TaskLeased { task_id: TaskId(1) });
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_the_loop() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.add_task(TaskId(1), dataset_entries(dir.path(), 1, 42, &["missing.txt"]));
        store.add_task(TaskId(2), dataset_entries(dir.path(), 2, 43, &["b.txt"]));
        let archive = Arc::new(FakeArchive::new());
        archive.add_file(DatasetId(43), 200, "SIC201", "b.txt");

        let report = agent(config(0), &store, &archive, FakeProbe::failing())
            .start(false)
            .await;

        assert_eq!(report.tasks_processed, 2);
        assert_eq!(report.tasks_failed, 1);
        let message = report.error_message.unwrap();
        assert!(message.contains("task 1 failed with completion code 2"), "{message}");

        let completions = store.completions();
        assert_eq!(completions[0].code, 2);
        assert_eq!(completions[1].code, 0);
        assert_eq!(store.state_of(EntryId(1)), Some(CacheState::Queued));
    }

    #[tokio::test]
    async fn test_eviction_failure_aborts_before_leasing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_entries(vec![cached_entry(
            1,
            dir.path(),
            "old.raw",
            0,
        )]));
        store.add_task(TaskId(1), dataset_entries(dir.path(), 5, 42, &["a.txt"]));
        let archive = Arc::new(FakeArchive::new());

        let report = agent(config(75), &store, &archive, FakeProbe::new(vec![gb_to_bytes(10.0)]))
            .start(false)
            .await;

        assert!(!report.is_success());
        assert!(
            report.error_message.unwrap().contains("no more cached files can be purged")
        );
        assert_eq!(store.request_calls(), 0);
        assert_eq!(store.state_of(EntryId(1)), Some(CacheState::Purged));
    }

    #[tokio::test]
    async fn test_eviction_runs_before_tasks() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_entries(vec![cached_entry(
            1,
            dir.path(),
            "old.raw",
            0,
        )]));
        let archive = Arc::new(FakeArchive::new());

        let report = agent(config(75), &store, &archive, FakeProbe::new(vec![gb_to_bytes(100.0)]))
            .start(false)
            .await;

        assert!(report.is_success());
        assert_eq!(report.eviction.unwrap().iterations, 1);
        assert_eq!(store.request_calls(), 1);
        assert_eq!(store.state_of(EntryId(1)), Some(CacheState::Cached));
    }

    #[tokio::test]
    async fn test_transient_lease_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.add_task(TaskId(1), dataset_entries(dir.path(), 1, 42, &["a.txt"]));
        store.fail_next_requests(3);
        let archive = Arc::new(FakeArchive::new());
        archive.add_file(DatasetId(42), 100, "SIC201", "a.txt");

        let report = agent(config(0), &store, &archive, FakeProbe::failing())
            .start(false)
            .await;

        assert!(report.is_success());
        assert_eq!(report.tasks_processed, 1);
        // three failures, the successful lease, then "no tasks"
        assert_eq!(store.request_calls(), 5);
    }

    #[tokio::test]
    async fn test_persistent_lease_failure_is_treated_as_no_task() {
        let store = Arc::new(MemoryStore::default());
        store.fail_next_requests(10);
        let archive = Arc::new(FakeArchive::new());

        let report = agent(config(0), &store, &archive, FakeProbe::failing())
            .start(false)
            .await;

        assert!(report.is_success());
        assert_eq!(report.tasks_processed, 0);
        assert_eq!(store.request_calls(), 4);
        assert_eq!(store.log_messages().len(), 1);
    }
}
