//! Preview listing of the next dataset's queued files.

use crate::types::{CacheFileEntry, DatasetId, Perspective};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

/// Queued files that the next task would cache, with their target paths
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreviewListing {
    /// Dataset of the listed files, or `None` when nothing is queued
    pub dataset_id: Option<DatasetId>,
    /// Request time of the first listed file
    pub queued_at: Option<DateTime<Utc>>,
    /// `(job, target path)` per queued file
    pub files: Vec<(i64, PathBuf)>,
}

impl PreviewListing {
    /// Build a listing from the entries of the next queued dataset
    pub fn from_entries(entries: &[CacheFileEntry], perspective: Perspective) -> Self {
        let Some(first) = entries.first() else {
            return Self::default();
        };

        Self {
            dataset_id: Some(first.dataset_id),
            queued_at: Some(first.queued_at),
            files: entries
                .iter()
                .map(|entry| (entry.job, entry.target_path(perspective)))
                .collect(),
        }
    }

    /// Whether any file is waiting to be cached
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl fmt::Display for PreviewListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(dataset_id) = self.dataset_id.filter(|_| !self.files.is_empty()) else {
            return writeln!(f, "No files need to be cached");
        };

        writeln!(f, "Files to cache for dataset: {}", dataset_id)?;
        if let Some(queued_at) = self.queued_at {
            writeln!(f, "Queued at: {}", queued_at.format("%Y-%m-%d %H:%M:%S"))?;
        }
        writeln!(f, "Job\tFile_Path")?;
        for (job, path) in &self.files {
            writeln!(f, "{}\t{}", job, path.display())?;
        }
        Ok(())
    }
}
