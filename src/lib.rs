//! # archive-cacher
//!
//! Agent that fills a shared file cache from a content archive.
//!
//! Each run:
//! - keeps the cache volume above a free-space floor by purging the oldest
//!   cached files
//! - leases cache tasks from the task store one at a time, matches each
//!   task's requested files against the archive listing for its dataset,
//!   downloads the matches and reports which entries are now cached
//!
//! Mutual exclusion between agents is left to the task store's lease.
//!
//! ## Quick Start
//!
//! ```no_run
//! use archive_cacher::{CacheAgent, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = CacheAgent::new(Config::default()).await?;
//!
//!     let mut events = agent.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = agent.start(false).await;
//!     agent.close().await;
//!     println!("processed {} tasks", report.tasks_processed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Archive client seam and HTTP implementation
pub mod archive;
/// Update blackout windows
pub mod blackout;
/// Configuration types
pub mod config;
/// SQLite task store
pub mod db;
/// Free-space measurement
pub mod disk_space;
/// Error types
pub mod error;
/// Free-space driven eviction
pub mod evictor;
/// Logging setup and durable-log escalation
pub mod logging;
/// Matching of requested files against archive listings
pub mod matcher;
/// Processing of a single leased task
pub mod processor;
/// Retry logic with exponential backoff
pub mod retry;
/// Agent context and task loop
pub mod runner;
/// Store traits
pub mod store;
/// Core types and events
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use archive::{ArchiveClient, DownloadReport, HttpArchiveClient};
pub use config::Config;
pub use db::{Database, NewCacheEntry};
pub use disk_space::{DiskSpaceProbe, SystemDiskSpace};
pub use error::{ArchiveError, DatabaseError, Error, Result, ToExitCode};
pub use evictor::{EvictionSummary, Evictor};
pub use processor::TaskProcessor;
pub use runner::{CacheAgent, PreviewListing, RunReport};
pub use store::{CacheEntryStore, DurableLog, TaskStore};
pub use types::{
    ArchivedFileRef, CacheFileEntry, CacheState, CompletionResult, DatasetId, EntryId, Event,
    FileId, OverwriteMode, Perspective, TaskId, TaskLease,
};
