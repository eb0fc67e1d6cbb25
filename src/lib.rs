//! Stockpile: a quota- and rate-bounded archive artifact producer.
//!
//! A single producer task emits numbered `.tar.gz` artifacts into a
//! directory. The sequence survives restarts (the next index is recovered
//! from existing filenames), production is paced by a token bucket, storage
//! stays under a configured budget, and old artifacts are pruned oldest
//! first.

#![deny(missing_docs)]

pub mod allocator;
pub mod config;
pub mod encoder;
pub mod error;
pub mod pattern;
pub mod producer;
pub mod quota;
pub mod ratelimit;
pub mod retention;
pub mod service;
pub mod web;

use prometheus::{register_counter, Counter};

pub use config::{Config, QuotaMode};
pub use error::{ProducerError, Result};

lazy_static::lazy_static! {
    /// Counter for artifacts written since process start.
    pub static ref ARTIFACTS_PRODUCED: Counter = register_counter!(
        "stockpile_artifacts_produced_total",
        "Number of artifacts written"
    ).unwrap();

    /// Counter for artifacts removed by retention enforcement.
    pub static ref ARTIFACTS_EVICTED: Counter = register_counter!(
        "stockpile_artifacts_evicted_total",
        "Number of artifacts removed by retention"
    ).unwrap();

    /// Counter for artifact deletions that failed.
    pub static ref RETENTION_FAILURES: Counter = register_counter!(
        "stockpile_retention_failures_total",
        "Number of artifact deletions that failed"
    ).unwrap();

    /// Counter for artifact write retries after transient I/O errors.
    pub static ref WRITE_RETRIES: Counter = register_counter!(
        "stockpile_write_retries_total",
        "Number of artifact write retries"
    ).unwrap();
}

/// Run the producer service until it drains, is cancelled or fails.
pub async fn run_service(config: Config, listen_addr: &str, port: u16) -> Result<()> {
    use service::ServiceOrchestrator;

    let orchestrator = ServiceOrchestrator::new(config, listen_addr.to_string(), port);
    orchestrator.run().await
}
