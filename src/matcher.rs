//! Match requested cache entries against an archive listing.

use crate::types::{ArchivedFileRef, CacheFileEntry, EntryId};
use std::collections::BTreeMap;

/// Result of matching a task's entries against the archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Chosen archive file per matched entry
    pub matches: BTreeMap<EntryId, ArchivedFileRef>,
    /// Required entries with no archive candidate
    pub unmatched_required: Vec<CacheFileEntry>,
    /// Optional entries with no archive candidate
    pub skipped_optional: usize,
}

impl MatchOutcome {
    /// Number of entries that must be cached for the task to succeed
    pub fn expected_count(&self) -> usize {
        self.matches.len() + self.unmatched_required.len()
    }

    /// Whether every required entry found a match
    pub fn is_complete(&self) -> bool {
        self.unmatched_required.is_empty()
    }
}

/// Pair each wanted entry with the newest archive file at the same place
///
/// An archive file matches an entry when its `sub_dir_path` equals the
/// entry's results folder and the file names are equal, both compared
/// ignoring case. Among several matches the highest `file_id` wins.
pub fn match_files(wanted: &[CacheFileEntry], available: &[ArchivedFileRef]) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    for entry in wanted {
        let best = available
            .iter()
            .filter(|file| {
                eq_ignore_case(
                    normalize_dir(&file.sub_dir_path),
                    normalize_dir(&entry.results_folder_name),
                ) && eq_ignore_case(&file.filename, &entry.filename)
            })
            .max_by_key(|file| file.file_id);

        match best {
            Some(file) => {
                outcome.matches.insert(entry.entry_id, file.clone());
            }
            None if entry.optional => {
                tracing::debug!(
                    entry_id = entry.entry_id.0,
                    file = %entry.display_name(),
                    "optional file not found in archive"
                );
                outcome.skipped_optional += 1;
            }
            None => {
                tracing::debug!(
                    entry_id = entry.entry_id.0,
                    dataset_id = entry.dataset_id.0,
                    file = %entry.display_name(),
                    "file not found in archive"
                );
                outcome.unmatched_required.push(entry.clone());
            }
        }
    }

    outcome
}

fn normalize_dir(dir: &str) -> &str {
    dir.trim_matches(['\\', '/'])
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}
