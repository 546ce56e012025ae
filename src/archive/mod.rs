//! Archive client seam
//!
//! The agent needs two things from the content archive: the list of files
//! stored for a dataset, and a way to download a set of those files into a
//! directory. [`ArchiveClient`] captures both; [`HttpArchiveClient`] talks to
//! the archive's HTTP interface.

use crate::error::Result;
use crate::types::{ArchivedFileRef, DatasetId, FileId, OverwriteMode};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

mod http;

pub use http::HttpArchiveClient;

/// Outcome of a download batch
#[must_use]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Files written to disk
    pub downloaded: Vec<FileId>,
    /// Files left alone because the local copy is current
    pub skipped: Vec<FileId>,
    /// Files that could not be downloaded, with the reason
    pub failed: Vec<(FileId, String)>,
    /// Bytes written
    pub bytes_downloaded: u64,
}

impl DownloadReport {
    /// Whether every requested file is now present locally
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Access to the content archive
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Every file the archive holds for `dataset_id`
    async fn find_files_by_dataset_id(&self, dataset_id: DatasetId) -> Result<Vec<ArchivedFileRef>>;

    /// Download `files` below `target_dir`, each at its `sub_dir_path/filename`
    ///
    /// Per-file failures are collected in the report; `Err` is reserved for
    /// failures that stop the whole batch, such as an offline archive.
    async fn download_files(
        &self,
        files: &BTreeMap<FileId, ArchivedFileRef>,
        target_dir: &Path,
        overwrite: OverwriteMode,
    ) -> Result<DownloadReport>;
}
