//! Error types for archive-cacher
//!
//! This module provides error handling for the agent, including:
//! - Domain-specific error types (database, archive, eviction)
//! - Process exit code mapping for the command-line boundary
//! - Context information (entry id, task id, free space figures)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for archive-cacher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for archive-cacher
///
/// Each variant carries enough context to produce the descriptive message that
/// the runner reports to its caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "store.database_path")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Archive listing or download error
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Free space is below the floor and nothing is left to purge
    #[error(
        "disk free space is {free_gb:.1} GB, which is below the threshold of {floor_gb} GB; \
         however, no more cached files can be purged"
    )]
    InsufficientSpace {
        /// Free space measured at the cache root, in GB
        free_gb: f64,
        /// Configured free-space floor, in GB
        floor_gb: u64,
    },

    /// Failed to measure free space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// The root path needed to locate cached files is empty
    #[error("{field} is empty for entry {entry_id}, {filename}; unable to manage cached files")]
    MissingCachePath {
        /// Entry whose path field was empty
        entry_id: i64,
        /// Filename of that entry
        filename: String,
        /// Which path field was consulted ("server_path" or "client_path")
        field: &'static str,
    },

    /// The eviction loop exceeded its iteration ceiling
    #[error("eviction loop has run over {iterations} times; there is likely a problem")]
    RunawayEviction {
        /// Iteration ceiling that was exceeded
        iterations: u32,
    },

    /// A remote call did not finish within its timeout
    #[error("{operation} timed out after {seconds} seconds")]
    Timeout {
        /// Name of the call that timed out
        operation: String,
        /// Timeout that elapsed
        seconds: u64,
    },

    /// Processing a leased task failed
    #[error("task {task_id} failed with completion code {code}: {message}")]
    TaskProcessing {
        /// Task that failed
        task_id: i64,
        /// Completion code reported to the store
        code: i32,
        /// Completion message reported to the store
        message: String,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// The caller does not hold the lease it tried to act on
    #[error("task {task_id} is not leased by {processor}")]
    LeaseNotHeld {
        /// Task the caller tried to complete
        task_id: i64,
        /// Processor name the caller presented
        processor: String,
    },
}

/// Archive-related errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive reported that it is offline
    #[error("archive is offline; unable to retrieve data: {0}")]
    Offline(String),

    /// The archive answered with a non-success HTTP status
    #[error("archive returned HTTP {status} for {url}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
    },

    /// The file listing could not be interpreted
    #[error("invalid archive listing: {0}")]
    InvalidListing(String),

    /// A single file could not be downloaded
    #[error("failed to download file {file_id} to {path}: {reason}")]
    DownloadFailed {
        /// Archive file id
        file_id: i64,
        /// Local target path
        path: PathBuf,
        /// The reason the download failed
        reason: String,
    },
}

/// Process exit code for a run that completed or had nothing to do
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for argument errors and unhandled failures
pub const EXIT_UNHANDLED: i32 = -1;
/// Process exit code for a processing failure with a populated error message
pub const EXIT_PROCESSING_FAILED: i32 = -3;

/// Map errors to the process exit codes observed by schedulers
pub trait ToExitCode {
    /// Get the process exit code for this error
    fn exit_code(&self) -> i32;

    /// Get a machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToExitCode for Error {
    fn exit_code(&self) -> i32 {
        match self {
            // Failures raised while evicting or processing tasks
            Error::InsufficientSpace { .. }
            | Error::DiskSpaceCheckFailed(_)
            | Error::MissingCachePath { .. }
            | Error::RunawayEviction { .. }
            | Error::TaskProcessing { .. }
            | Error::Archive(_) => EXIT_PROCESSING_FAILED,

            // Everything else is treated as unhandled
            Error::Config { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Io(_)
            | Error::Network(_)
            | Error::Serialization(_)
            | Error::Timeout { .. }
            | Error::Other(_) => EXIT_UNHANDLED,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(e) => match e {
                DatabaseError::ConnectionFailed(_) => "database_connection_failed",
                DatabaseError::MigrationFailed(_) => "database_migration_failed",
                DatabaseError::QueryFailed(_) => "database_query_failed",
                DatabaseError::NotFound(_) => "not_found",
                DatabaseError::LeaseNotHeld { .. } => "lease_not_held",
            },
            Error::Sqlx(_) => "database_error",
            Error::Archive(e) => match e {
                ArchiveError::Offline(_) => "archive_offline",
                ArchiveError::Http { .. } => "archive_http_error",
                ArchiveError::InvalidListing(_) => "archive_invalid_listing",
                ArchiveError::DownloadFailed { .. } => "archive_download_failed",
            },
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::InsufficientSpace { .. } => "insufficient_space",
            Error::DiskSpaceCheckFailed(_) => "disk_space_check_failed",
            Error::MissingCachePath { .. } => "missing_cache_path",
            Error::RunawayEviction { .. } => "runaway_eviction",
            Error::Timeout { .. } => "timeout",
            Error::TaskProcessing { .. } => "task_processing_failed",
            Error::Other(_) => "internal_error",
        }
    }
}
