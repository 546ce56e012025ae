//! Command-line entry point for archive-cacher

use archive_cacher::blackout::updates_are_pending;
use archive_cacher::error::{EXIT_PROCESSING_FAILED, EXIT_SUCCESS, EXIT_UNHANDLED};
use archive_cacher::{CacheAgent, Config, Perspective, Result, ToExitCode};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "archive-cacher", version)]
#[command(about = "Cache archived dataset files locally and purge old files when space runs low")]
struct Cli {
    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite task store
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Use server-local cache paths instead of network share paths
    #[arg(long)]
    local: bool,

    /// List the files the next task would cache, then exit without changing anything
    #[arg(long)]
    preview: bool,

    /// Minimum free space on the cache volume in GB (0 disables purging)
    #[arg(long = "fs", value_name = "GB")]
    minimum_free_space_gb: Option<u64>,

    /// Base URL of the archive service
    #[arg(long, value_name = "URL")]
    archive_url: Option<String>,

    /// Also write dated log files to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "archive_cacher=trace"
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Run even inside an operating-system update window
    #[arg(long)]
    ignore_blackout: bool,
}

impl Cli {
    fn into_config(self) -> Result<(Config, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(database) = self.database {
            config.store.database_path = database;
        }
        if self.local {
            config.cache.perspective = Perspective::Server;
        }
        if let Some(gb) = self.minimum_free_space_gb {
            config.cache.minimum_free_space_gb = gb;
        }
        if let Some(url) = self.archive_url {
            config.archive.base_url = url;
        }
        if let Some(dir) = self.log_dir {
            config.logging.log_dir = Some(dir);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.ignore_blackout {
            config.blackout.enabled = false;
        }

        Ok((config, self.preview))
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_UNHANDLED } else { EXIT_SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let (config, preview) = cli.into_config()?;
    archive_cacher::logging::init(&config.logging)?;

    // Blackout only applies to client hosts
    if config.cache.perspective == Perspective::Client
        && config.blackout.enabled
        && let Some(message) = updates_are_pending(chrono::Local::now().naive_local())
    {
        println!("{}", message);
        return Ok(EXIT_SUCCESS);
    }

    let agent = CacheAgent::new(config).await?;
    let report = agent.start(preview).await;
    agent.close().await;

    if let Some(listing) = &report.preview {
        print!("{}", listing);
    }

    match report.error_message {
        None => Ok(EXIT_SUCCESS),
        Some(message) => {
            eprintln!("{}", message);
            Ok(EXIT_PROCESSING_FAILED)
        }
    }
}
