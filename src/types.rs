//! Core types for archive-cacher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wrap a raw id
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl PartialEq<i64> for $name {
            fn eq(&self, other: &i64) -> bool {
                self.0 == *other
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

id_newtype!(
    /// Store-assigned identity of a cache entry; never reused
    EntryId
);
id_newtype!(
    /// Identity of a leased cache task (0 means "no task")
    TaskId
);
id_newtype!(
    /// Dataset that groups the entries of one task
    DatasetId
);
id_newtype!(
    /// Archive-side file identity; higher ids are newer revisions
    FileId
);

/// Lifecycle state of a cache entry, as held by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Requested and waiting to be cached
    Queued,
    /// Leased by a processor
    InProgress,
    /// Present in the cache and eligible for eviction
    Cached,
    /// Evicted (terminal)
    Purged,
}

impl CacheState {
    /// Convert integer state code to CacheState
    pub fn from_i32(state: i32) -> Option<Self> {
        match state {
            1 => Some(CacheState::Queued),
            2 => Some(CacheState::InProgress),
            3 => Some(CacheState::Cached),
            5 => Some(CacheState::Purged),
            _ => None,
        }
    }

    /// Convert CacheState to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            CacheState::Queued => 1,
            CacheState::InProgress => 2,
            CacheState::Cached => 3,
            CacheState::Purged => 5,
        }
    }
}

/// Whether the agent addresses cache paths as the local server or a remote client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    /// Running on the machine that hosts the cache; use local drive paths
    Server,
    /// Running elsewhere; use network share paths
    #[default]
    Client,
}

impl Perspective {
    /// Root path of an entry as seen from this perspective
    pub fn root_of<'a>(&self, entry: &'a CacheFileEntry) -> &'a str {
        match self {
            Perspective::Server => &entry.server_path,
            Perspective::Client => &entry.client_path,
        }
    }

    /// Name of the entry field consulted by [`Perspective::root_of`]
    pub fn path_field(&self) -> &'static str {
        match self {
            Perspective::Server => "server_path",
            Perspective::Client => "client_path",
        }
    }
}

/// How the downloader treats files already present in the target directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteMode {
    /// Always replace existing files
    Always,
    /// Replace only when size or checksum differ
    #[default]
    IfChanged,
    /// Never replace existing files
    Never,
}

/// One requested-or-cached file tracked by the task store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFileEntry {
    /// Store-assigned identity
    pub entry_id: EntryId,
    /// Dataset this file belongs to
    pub dataset_id: DatasetId,
    /// Job that produced the file
    pub job: i64,
    /// Cache root as seen by remote clients (network share)
    pub client_path: String,
    /// Cache root as seen by the server (local drive)
    pub server_path: String,
    /// First path segment below the root
    pub parent_path: String,
    /// Dataset directory name
    pub dataset_folder: String,
    /// Results directory name; also the archive sub-directory
    pub results_folder_name: String,
    /// File name
    pub filename: String,
    /// When the file was requested; eviction order key
    pub queued_at: DateTime<Utc>,
    /// Absence in the archive is not an error
    pub optional: bool,
    /// Lifecycle state
    pub state: CacheState,
}

impl CacheFileEntry {
    /// Directory the dataset's files are downloaded into: `root/parent/dataset`
    pub fn dataset_dir(&self, perspective: Perspective) -> PathBuf {
        join_segments(
            Path::new(perspective.root_of(self)),
            &[&self.parent_path, &self.dataset_folder],
        )
    }

    /// Full on-disk path of the file below `root`
    pub fn path_under(&self, root: &Path) -> PathBuf {
        join_segments(
            root,
            &[
                &self.parent_path,
                &self.dataset_folder,
                &self.results_folder_name,
                &self.filename,
            ],
        )
    }

    /// Full on-disk path of the file for a perspective
    pub fn target_path(&self, perspective: Perspective) -> PathBuf {
        self.path_under(Path::new(perspective.root_of(self)))
    }

    /// Path of the file relative to its dataset directory, for messages
    pub fn display_name(&self) -> String {
        join_segments(Path::new(""), &[&self.results_folder_name, &self.filename])
            .display()
            .to_string()
    }
}

/// Append non-empty segments to a base path
fn join_segments(base: &Path, segments: &[&str]) -> PathBuf {
    let mut path = base.to_path_buf();
    for segment in segments {
        let segment = segment.trim_start_matches(['\\', '/']);
        if !segment.is_empty() {
            path.push(segment);
        }
    }
    path
}

/// The unit of work leased from the store
#[derive(Clone, Debug)]
pub struct CacheTask {
    /// Leased task
    pub task_id: TaskId,
    /// Dataset shared by every entry
    pub dataset_id: DatasetId,
    /// Entries to cache
    pub entries: Vec<CacheFileEntry>,
}

/// Archive-side file identity, used only for matching and downloading
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFileRef {
    /// Archive file id
    pub file_id: FileId,
    /// Sub-directory within the dataset
    #[serde(default)]
    pub sub_dir_path: String,
    /// File name
    pub filename: String,
    /// File size in bytes, when known
    #[serde(default, alias = "size")]
    pub size_bytes: Option<u64>,
    /// Hex-encoded SHA-256, when the archive supplies one
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ArchivedFileRef {
    /// Path of the file relative to the download target directory
    pub fn relative_path(&self) -> PathBuf {
        join_segments(Path::new(""), &[&self.sub_dir_path, &self.filename])
    }

    /// This file renamed to the folder and name spelled by `entry`
    ///
    /// Matching ignores case, so the archive's spelling can differ from the
    /// entry's; downloads must land where the entry expects them.
    pub fn placed_for(&self, entry: &CacheFileEntry) -> Self {
        Self {
            sub_dir_path: entry.results_folder_name.clone(),
            filename: entry.filename.clone(),
            ..self.clone()
        }
    }
}

/// Answer to a lease request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskLease {
    /// Whether a task was granted
    pub available: bool,
    /// Granted task, or 0
    pub task_id: TaskId,
    /// Store message
    pub message: String,
}

impl TaskLease {
    /// A lease answer meaning "no task available"
    pub fn none(message: impl Into<String>) -> Self {
        Self {
            available: false,
            task_id: TaskId(0),
            message: message.into(),
        }
    }
}

/// Completion code: every required file was cached
pub const COMPLETION_SUCCESS: i32 = 0;
/// Completion code: the task had no queued files
pub const COMPLETION_NO_FILES: i32 = 1;
/// Completion code: some required files were not found in the archive
pub const COMPLETION_INCOMPLETE: i32 = 2;
/// Completion code reported when processing failed without setting a code
pub const COMPLETION_GENERIC_FAILURE: i32 = -1;

/// Outcome of processing one task, reported back to the store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionResult {
    /// 0 for full success, otherwise a failure code
    pub completion_code: i32,
    /// Human-readable completion message
    pub message: String,
    /// Entries that were matched and handed to the downloader
    pub cached_entry_ids: BTreeSet<EntryId>,
}

impl CompletionResult {
    /// Whether the task completed successfully
    pub fn is_success(&self) -> bool {
        self.completion_code == COMPLETION_SUCCESS
    }

    /// Cached entry ids as the comma-joined list the store expects
    pub fn cached_ids_csv(&self) -> String {
        self.cached_entry_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Events emitted by the agent
///
/// Observers subscribe through [`crate::CacheAgent::subscribe`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Informational status message
    Status {
        /// Message text
        message: String,
    },

    /// Something went wrong but processing continues
    Warning {
        /// Message text
        message: String,
    },

    /// An operation failed
    Error {
        /// Message text
        message: String,
    },

    /// Free space is below the floor and files will be purged
    EvictionRequired {
        /// Measured free space in GB
        free_gb: f64,
        /// Configured floor in GB
        floor_gb: u64,
    },

    /// A purge batch finished
    FilesPurged {
        /// Files actually deleted from disk
        files_deleted: usize,
        /// Bytes reclaimed
        bytes_freed: u64,
        /// Cache root the files were deleted from
        cache_root: PathBuf,
    },

    /// A task was leased from the store
    TaskLeased {
        /// Leased task
        task_id: TaskId,
    },

    /// A task was reported complete
    TaskCompleted {
        /// Completed task
        task_id: TaskId,
        /// Reported completion code
        completion_code: i32,
        /// Reported completion message
        message: String,
    },

    /// The archive reported that it is offline
    ArchiveOffline {
        /// Message from the archive
        message: String,
    },

    /// Download progress for the current task
    Progress {
        /// Files finished so far
        completed: usize,
        /// Files in the batch
        total: usize,
    },
}
