//! Stockpile service entry point.
//!
//! Produces a sequence of small archive artifacts into a directory under a
//! storage quota, a token-bucket production rate and an oldest-first
//! retention policy.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use stockpile::{run_service, Config, QuotaMode};
use tracing::info;

/// Command-line arguments for the stockpile service.
#[derive(Debug, Parser)]
#[command(
    name = "stockpile",
    about = "Produce archive artifacts under quota, rate and retention control"
)]
struct Args {
    /// Port to listen on for the HTTP status server
    #[arg(long, default_value = "9944", env = "STOCKPILE_PORT")]
    port: u16,

    /// Address to listen on for the HTTP status server
    #[arg(long, default_value = "127.0.0.1", env = "STOCKPILE_LISTEN_ADDRESS")]
    listen_address: String,

    /// Path to a TOML configuration file; when given, the producer options
    /// below are taken from the file instead
    #[arg(long, env = "STOCKPILE_CONFIG")]
    config: Option<String>,

    /// Directory to write artifacts into
    #[arg(long, env = "STOCKPILE_OUTPUT_DIR", required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    /// Artifact filename prefix
    #[arg(long, default_value = "artifact-")]
    name_prefix: String,

    /// Artifact filename suffix
    #[arg(long, default_value = ".tar.gz")]
    name_suffix: String,

    /// Artifacts produced per second
    #[arg(long, default_value_t = 1.0)]
    refill_rate_per_sec: f64,

    /// Maximum production burst size
    #[arg(long, default_value_t = 1.0)]
    bucket_capacity: f64,

    /// Storage budget in bytes
    #[arg(long)]
    byte_limit: Option<u64>,

    /// Maximum number of artifacts to keep
    #[arg(long)]
    max_artifact_count: Option<u64>,

    /// Reaction to an exceeded storage budget
    #[arg(long, value_enum, default_value = "backpressure")]
    quota_mode: QuotaMode,

    /// Check the quota every this many artifacts
    #[arg(long, default_value_t = 1)]
    quota_sample_every: u64,

    /// How long backpressure mode may wait for space, in seconds
    #[arg(long)]
    quota_wait_timeout_secs: Option<u64>,

    /// Stop after producing this many artifacts instead of running until
    /// cancelled
    #[arg(long)]
    max_artifacts: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let output_dir = self
            .output_dir
            .ok_or_else(|| anyhow::anyhow!("--output-dir is required unless --config is given"))?;
        let mut config = Config::with_output_dir(output_dir);
        config.name_prefix = self.name_prefix;
        config.name_suffix = self.name_suffix;
        config.refill_rate_per_sec = self.refill_rate_per_sec;
        config.bucket_capacity = self.bucket_capacity;
        config.byte_limit = self.byte_limit;
        config.max_artifact_count = self.max_artifact_count;
        config.quota_mode = self.quota_mode;
        config.quota_sample_every = self.quota_sample_every;
        config.quota_wait_timeout_secs = self.quota_wait_timeout_secs;
        config.max_artifacts = self.max_artifacts;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = if args.verbose {
        "stockpile=debug,info"
    } else {
        "stockpile=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    info!("Starting stockpile service");
    info!("Listen address: {}:{}", args.listen_address, args.port);

    let listen_address = args.listen_address.clone();
    let port = args.port;

    let config = match args.config.clone() {
        Some(path) => Config::load(&path).await?,
        None => args.into_config()?,
    };

    info!("Output directory: {}", config.output_dir.display());
    info!(
        "Rate: {}/s (burst {}), quota mode: {:?}",
        config.refill_rate_per_sec, config.bucket_capacity, config.quota_mode
    );

    run_service(config, &listen_address, port)
        .await
        .map_err(Into::into)
}
