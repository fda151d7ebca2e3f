//! bucketlift command-line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Upload files to a bucket, resuming interrupted multipart uploads.
#[derive(Debug, Parser)]
#[command(name = "bucketlift", version)]
pub struct Args {
    /// Destination bucket.
    #[arg(long)]
    pub bucket: String,

    /// Key prefix prepended to each file name.
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Configuration file (defaults to the platform config directory).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Files to upload.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), files = args.files.len(), "starting bucketlift");

    let (config, config_path) = config::Config::load(args.config.as_deref())?;
    tracing::info!(path = %config_path.display(), base_url = %config.signing.base_url, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(app::run(args, config, config_path))?;

    tracing::info!(
        done = summary.done,
        paused = summary.paused,
        failed = summary.failed,
        canceled = summary.canceled,
        "session finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} upload(s) failed", summary.failed);
    }
    Ok(())
}
