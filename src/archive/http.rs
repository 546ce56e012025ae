//! HTTP archive client.

use super::{ArchiveClient, DownloadReport};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Error, Result};
use crate::types::{ArchivedFileRef, DatasetId, Event, FileId, OverwriteMode};
use async_trait::async_trait;
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use url::Url;

/// What happened to one file of a batch
enum FileOutcome {
    Downloaded(u64),
    Skipped,
}

/// Archive client for the archive's HTTP interface
///
/// Listing: `GET {base}/datasets/{id}/files` returns a JSON array of
/// [`ArchivedFileRef`]. Content: `GET {base}/files/{file_id}` returns the
/// file's bytes. A 503 answer means the archive is offline.
pub struct HttpArchiveClient {
    client: reqwest::Client,
    base_url: Url,
    max_file_count: usize,
    include_all_revisions: bool,
    concurrency: usize,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl HttpArchiveClient {
    /// Create a client from archive settings
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| Error::Config {
            message: format!("invalid archive URL '{}': {}", config.base_url, e),
            key: Some("archive.base_url".to_string()),
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("archive-cacher/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            max_file_count: config.max_file_count,
            include_all_revisions: config.include_all_revisions,
            concurrency: config.concurrent_downloads.max(1),
            event_tx: None,
        })
    }

    /// Publish offline and progress notifications on `event_tx`
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            Error::Archive(ArchiveError::InvalidListing(format!(
                "cannot build archive URL for '{}': {}",
                path, e
            )))
        })
    }

    /// Map non-success answers to archive errors
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                "archive returned 503 Service Unavailable".to_string()
            } else {
                body.trim().to_string()
            };
            tracing::warn!(url = %url, "archive is offline: {}", message);
            self.emit(Event::ArchiveOffline {
                message: message.clone(),
            });
            return Err(Error::Archive(ArchiveError::Offline(message)));
        }

        Err(Error::Archive(ArchiveError::Http {
            status: status.as_u16(),
            url,
        }))
    }

    async fn download_one(
        &self,
        file: &ArchivedFileRef,
        target_dir: &Path,
        overwrite: OverwriteMode,
    ) -> Result<FileOutcome> {
        let path = target_dir.join(file.relative_path());

        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let keep_existing = match overwrite {
            OverwriteMode::Always => false,
            OverwriteMode::Never => exists,
            OverwriteMode::IfChanged => exists && local_copy_is_current(&path, file).await?,
        };
        if keep_existing {
            tracing::debug!(file_id = file.file_id.0, path = %path.display(), "keeping existing file");
            return Ok(FileOutcome::Skipped);
        }

        let url = self.url(&format!("files/{}", file.file_id))?;
        let response = self.client.get(url).send().await?;
        let mut response = self.check_status(response).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&path);
        let mut out = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        let copied: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                hasher.update(&chunk);
                out.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            out.flush().await?;
            Ok(())
        }
        .await;
        drop(out);

        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        if let Some(expected) = &file.sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::Archive(ArchiveError::DownloadFailed {
                    file_id: file.file_id.0,
                    path,
                    reason: format!("SHA-256 mismatch: expected {}, got {}", expected, actual),
                }));
            }
        }

        if exists {
            // Replacing fails on some platforms while the old file is present
            let _ = tokio::fs::remove_file(&path).await;
        }
        tokio::fs::rename(&partial, &path).await?;

        Ok(FileOutcome::Downloaded(written))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Whether an existing local file matches the archive's size and hash
///
/// With neither a size nor a hash to compare, the file is treated as changed.
async fn local_copy_is_current(path: &Path, file: &ArchivedFileRef) -> Result<bool> {
    if file.size_bytes.is_none() && file.sha256.is_none() {
        return Ok(false);
    }

    let metadata = tokio::fs::metadata(path).await?;
    if let Some(size) = file.size_bytes
        && metadata.len() != size
    {
        return Ok(false);
    }

    if let Some(expected) = &file.sha256 {
        let actual = sha256_file(path).await?;
        return Ok(actual.eq_ignore_ascii_case(expected));
    }

    Ok(true)
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut input = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = input.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    async fn find_files_by_dataset_id(&self, dataset_id: DatasetId) -> Result<Vec<ArchivedFileRef>> {
        let mut url = self.url(&format!("datasets/{}/files", dataset_id))?;
        url.query_pairs_mut()
            .append_pair(
                "include_all_revisions",
                if self.include_all_revisions { "true" } else { "false" },
            )
            .append_pair("max_file_count", &self.max_file_count.to_string());

        tracing::debug!(dataset_id = dataset_id.0, url = %url, "listing archive files");

        let response = self.client.get(url).send().await?;
        let response = self.check_status(response).await?;
        let body = response.text().await?;

        let files: Vec<ArchivedFileRef> = serde_json::from_str(&body).map_err(|e| {
            Error::Archive(ArchiveError::InvalidListing(format!(
                "dataset {}: {}",
                dataset_id, e
            )))
        })?;

        tracing::debug!(dataset_id = dataset_id.0, count = files.len(), "archive listing received");
        Ok(files)
    }

    async fn download_files(
        &self,
        files: &BTreeMap<FileId, ArchivedFileRef>,
        target_dir: &Path,
        overwrite: OverwriteMode,
    ) -> Result<DownloadReport> {
        let total = files.len();
        tracing::info!(
            files = total,
            target = %target_dir.display(),
            "downloading files from archive"
        );

        let mut downloads = stream::iter(files.values().cloned())
            .map(|file| {
                async move {
                    let outcome = self.download_one(&file, target_dir, overwrite).await;
                    (file.file_id, outcome)
                }
                .boxed()
            })
            .buffer_unordered(self.concurrency);

        let mut report = DownloadReport::default();
        let mut offline = None;
        let mut completed = 0;

        while let Some((file_id, result)) = downloads.next().await {
            match result {
                Ok(FileOutcome::Downloaded(bytes)) => {
                    report.downloaded.push(file_id);
                    report.bytes_downloaded += bytes;
                }
                Ok(FileOutcome::Skipped) => report.skipped.push(file_id),
                Err(Error::Archive(ArchiveError::Offline(message))) => {
                    offline.get_or_insert(message.clone());
                    report.failed.push((file_id, message));
                }
                Err(e) => {
                    tracing::warn!(file_id = file_id.0, error = %e, "file download failed");
                    report.failed.push((file_id, e.to_string()));
                }
            }
            completed += 1;
            self.emit(Event::Progress { completed, total });
        }

        if let Some(message) = offline {
            return Err(Error::Archive(ArchiveError::Offline(message)));
        }

        report.downloaded.sort();
        report.skipped.sort();
        report.failed.sort_by_key(|(id, _)| *id);

        tracing::info!(
            downloaded = report.downloaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            bytes = report.bytes_downloaded,
            "archive download finished"
        );

        Ok(report)
    }
}
