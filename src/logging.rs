//! Logging setup and durable-log escalation
//!
//! Console (and optional dated file) output goes through `tracing`. Errors
//! that operators need to see later are additionally written to the store's
//! durable log through an [`ErrorBudget`], which caps how many messages one
//! batch or task may escalate.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use crate::store::DurableLog;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Dated log file for `date` inside `dir`
pub fn log_file_path(dir: &Path, date: chrono::NaiveDate) -> PathBuf {
    dir.join(format!("archive-cacher_{}.log", date.format("%Y-%m-%d")))
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. When `config.log_dir` is
/// set, output is also appended to today's dated log file.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config {
            message: format!("invalid log level '{}': {}", config.level, e),
            key: Some("logging.level".to_string()),
        })?;

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = log_file_path(dir, chrono::Local::now().date_naive());
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to initialise logging: {}", e)))
}

/// Severity of an escalated message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Operation failed
    Error,
    /// Something went wrong but work continues
    Warning,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
        }
    }
}

/// Caps the number of messages escalated to the durable log
///
/// Every message is logged through `tracing`; only the first `limit` are also
/// written to the durable log. Create one budget per batch or task.
pub struct ErrorBudget {
    durable: Option<Arc<dyn DurableLog>>,
    posted_by: String,
    limit: u32,
    escalated: u32,
    suppressed: u32,
}

impl ErrorBudget {
    /// New budget writing to `durable` as `posted_by`
    pub fn new(durable: Option<Arc<dyn DurableLog>>, posted_by: impl Into<String>, limit: u32) -> Self {
        Self {
            durable,
            posted_by: posted_by.into(),
            limit,
            escalated: 0,
            suppressed: 0,
        }
    }

    /// Log `message` and escalate it while the budget lasts
    pub async fn report(&mut self, severity: Severity, message: &str) {
        match severity {
            Severity::Error => tracing::error!("{}", message),
            Severity::Warning => tracing::warn!("{}", message),
        }

        let Some(durable) = &self.durable else {
            return;
        };

        if self.escalated >= self.limit {
            if self.suppressed == 0 {
                tracing::warn!(
                    limit = self.limit,
                    "durable log limit reached; further messages are only logged locally"
                );
            }
            self.suppressed += 1;
            return;
        }

        self.escalated += 1;
        if let Err(e) = durable
            .write_log(&self.posted_by, severity.as_str(), message)
            .await
        {
            tracing::warn!(error = %e, "failed to write to durable log");
        }
    }

    /// Shorthand for an error report
    pub async fn error(&mut self, message: &str) {
        self.report(Severity::Error, message).await;
    }

    /// Messages written to the durable log so far
    pub fn escalated(&self) -> u32 {
        self.escalated
    }

    /// Messages that exceeded the budget
    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }
}
