//! Producer orchestration.
//!
//! A single task owns the control loop and all mutable state: the token
//! bucket, the next sequence index and the produced count. One producer per
//! directory eliminates index-collision races by construction; a collision
//! on disk therefore signals external interference and is fatal.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::allocator;
use crate::config::{Config, QuotaMode, RetentionLimit};
use crate::encoder::{ArchiveEncoder, ArchiveEntry};
use crate::error::{ProducerError, Result};
use crate::pattern::ArtifactNamePattern;
use crate::quota;
use crate::ratelimit::TokenBucket;
use crate::retention::{EnforceOutcome, Enforcer, FsRetention};
use crate::{ARTIFACTS_EVICTED, ARTIFACTS_PRODUCED, RETENTION_FAILURES, WRITE_RETRIES};

/// Prefix for staging files. Staging names never match the artifact naming
/// grammar, so in-flight writes are invisible to the quota scan and to
/// external observers listing artifacts.
const STAGING_PREFIX: &str = ".stockpile-";

/// Attempts per artifact write before a transient I/O failure escalates.
const WRITE_RETRY_LIMIT: u32 = 3;

/// Base delay between write retries, multiplied by the attempt number.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How long backpressure mode sleeps between enforcement passes while
/// waiting for space.
const QUOTA_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Producer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerState {
    /// Allocating the start index.
    Starting,
    /// Producing artifacts.
    Running,
    /// Cancellation observed, finishing cleanly.
    Draining,
    /// Terminal, clean exit.
    Stopped,
    /// Terminal, carries the triggering error out of [`Producer::run`].
    Failed,
}

/// Shared observability state, written by the producer task and read by the
/// web surface.
#[derive(Debug)]
pub struct ProducerStatus {
    produced: AtomicU64,
    current_index: AtomicU64,
    usage_bytes: AtomicU64,
    state: tokio::sync::RwLock<ProducerState>,
}

/// Point-in-time view of the producer, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Current lifecycle state.
    pub state: ProducerState,
    /// Artifacts produced since startup.
    pub produced_count: u64,
    /// Next sequence index to be written.
    pub current_index: u64,
    /// Artifact bytes in the directory as of the last quota scan.
    pub current_usage_bytes: u64,
}

impl ProducerStatus {
    /// Create status state in `Starting`.
    pub fn new() -> Self {
        Self {
            produced: AtomicU64::new(0),
            current_index: AtomicU64::new(0),
            usage_bytes: AtomicU64::new(0),
            state: tokio::sync::RwLock::new(ProducerState::Starting),
        }
    }

    /// Take a consistent-enough snapshot for observability.
    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: *self.state.read().await,
            produced_count: self.produced.load(Ordering::SeqCst),
            current_index: self.current_index.load(Ordering::SeqCst),
            current_usage_bytes: self.usage_bytes.load(Ordering::SeqCst),
        }
    }

    async fn set_state(&self, state: ProducerState) {
        *self.state.write().await = state;
    }
}

impl Default for ProducerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// The artifact producer state machine.
pub struct Producer {
    config: Arc<Config>,
    encoder: Box<dyn ArchiveEncoder>,
    pattern: ArtifactNamePattern,
    limit: Option<RetentionLimit>,
    enforcer: Box<dyn Enforcer>,
    bucket: TokenBucket,
    status: Arc<ProducerStatus>,
    shutdown_rx: broadcast::Receiver<()>,
    next_index: u64,
    produced: u64,
    cancelled: bool,
}

impl Producer {
    /// Create a producer. Validates the configuration; any failure here is a
    /// `ConfigurationError` before the producer ever runs.
    pub fn new(
        config: Arc<Config>,
        encoder: Box<dyn ArchiveEncoder>,
        status: Arc<ProducerStatus>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        config.validate()?;
        let bucket = TokenBucket::new(config.refill_rate_per_sec, config.bucket_capacity)?;
        let pattern = config.pattern();
        let limit = config.retention_limit();
        Ok(Self {
            config,
            encoder,
            pattern,
            limit,
            enforcer: Box::new(FsRetention),
            bucket,
            status,
            shutdown_rx,
            next_index: 0,
            produced: 0,
            cancelled: false,
        })
    }

    /// Drive the state machine to a terminal state.
    ///
    /// Returns `Ok` on clean cancellation or when the configured artifact
    /// count has been produced; any fatal condition is returned after the
    /// state has transitioned to `Failed`.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        match &result {
            Ok(()) => {
                self.status.set_state(ProducerState::Stopped).await;
                info!("Producer stopped cleanly after {} artifacts", self.produced);
            }
            Err(e) => {
                self.status.set_state(ProducerState::Failed).await;
                error!("Producer failed: {}", e);
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let dir = self.config.output_dir.clone();
        info!("Allocating start index from {}", dir.display());
        self.next_index = allocator::resume_index(&dir, &self.pattern)?;
        self.status
            .current_index
            .store(self.next_index, Ordering::SeqCst);
        self.status.set_state(ProducerState::Running).await;
        info!(
            "Producing into {} from index {}",
            dir.display(),
            self.next_index
        );

        loop {
            if self.shutdown_requested() {
                break;
            }
            if let Some(max) = self.config.max_artifacts {
                if self.produced >= max {
                    info!("Produced the configured {} artifacts, draining", max);
                    break;
                }
            }

            // Rate limit, raced against cancellation. A cancelled wait
            // consumes no token.
            let cancelled = tokio::select! {
                _ = self.bucket.acquire() => false,
                _ = self.shutdown_rx.recv() => true,
            };
            if cancelled {
                self.cancelled = true;
                break;
            }

            // Quota check on its sampling cadence.
            if let Some(limit) = self.limit {
                if self.produced % self.config.quota_sample_every == 0 {
                    self.ensure_capacity(limit).await?;
                    if self.cancelled {
                        break;
                    }
                }
            }

            let entries = [ArchiveEntry::new(
                self.config.entry_name.clone(),
                self.config.entry_content.as_bytes().to_vec(),
            )];
            let bytes = self.encoder.encode(&entries)?;

            let path = dir.join(self.pattern.file_name(self.next_index));
            self.write_artifact(&path, &bytes).await?;

            self.produced += 1;
            self.next_index += 1;
            self.status.produced.store(self.produced, Ordering::SeqCst);
            self.status
                .current_index
                .store(self.next_index, Ordering::SeqCst);
            ARTIFACTS_PRODUCED.inc();
            debug!("Wrote artifact {}", path.display());
        }

        self.status.set_state(ProducerState::Draining).await;
        if let Some(limit) = self.limit {
            // Leave the directory within policy on exit; without this the
            // final write of a bounded run would never be followed by an
            // enforcement pass.
            match self.enforcer.enforce(&dir, &self.pattern, limit) {
                Ok(outcome) => self.note_enforcement(&outcome),
                Err(e) => warn!("Final retention pass failed: {}", e),
            }
            if let Ok(state) = quota::current_usage(&dir, &self.pattern, limit) {
                self.status
                    .usage_bytes
                    .store(state.total_bytes, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Check the quota and react per the configured mode.
    ///
    /// Eviction mode enforces once and proceeds even if residually over
    /// budget. Backpressure mode loops enforcement and waiting until usage
    /// is under budget, failing with `QuotaDeadlock` once the configured
    /// timeout elapses.
    async fn ensure_capacity(&mut self, limit: RetentionLimit) -> Result<()> {
        let state = quota::current_usage(&self.config.output_dir, &self.pattern, limit)?;
        self.status
            .usage_bytes
            .store(state.total_bytes, Ordering::SeqCst);
        if !state.is_over_budget() {
            return Ok(());
        }
        debug!(
            "Over budget: {} bytes across {} artifacts",
            state.total_bytes, state.artifact_count
        );

        match self.config.quota_mode {
            QuotaMode::Eviction => {
                let outcome =
                    self.enforcer
                        .enforce(&self.config.output_dir, &self.pattern, limit)?;
                self.note_enforcement(&outcome);
                self.status.usage_bytes.store(
                    state.total_bytes.saturating_sub(outcome.bytes_freed),
                    Ordering::SeqCst,
                );
                Ok(())
            }
            QuotaMode::Backpressure => {
                let started = Instant::now();
                loop {
                    let outcome =
                        self.enforcer
                            .enforce(&self.config.output_dir, &self.pattern, limit)?;
                    self.note_enforcement(&outcome);
                    if !outcome.still_over_budget {
                        let state =
                            quota::current_usage(&self.config.output_dir, &self.pattern, limit)?;
                        self.status
                            .usage_bytes
                            .store(state.total_bytes, Ordering::SeqCst);
                        return Ok(());
                    }
                    if let Some(timeout) = self.config.quota_wait_timeout_secs {
                        if started.elapsed() >= Duration::from_secs(timeout) {
                            return Err(ProducerError::QuotaDeadlock {
                                waited_secs: started.elapsed().as_secs(),
                            });
                        }
                    }
                    warn!("Still over budget, waiting for space to be freed");
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(QUOTA_RETRY_INTERVAL) => false,
                        _ = self.shutdown_rx.recv() => true,
                    };
                    if cancelled {
                        self.cancelled = true;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn note_enforcement(&self, outcome: &EnforceOutcome) {
        if outcome.removed > 0 {
            ARTIFACTS_EVICTED.inc_by(outcome.removed as f64);
        }
        if outcome.failed > 0 {
            RETENTION_FAILURES.inc_by(outcome.failed as f64);
            let err = ProducerError::Retention(format!(
                "{} deletions failed, over-budget state persists",
                outcome.failed
            ));
            warn!("{}; production continues", err);
        }
    }

    /// Write one artifact atomically, retrying transient I/O failures a
    /// bounded number of times with backoff.
    async fn write_artifact(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match stage_and_persist(&self.config.output_dir, path, bytes) {
                Ok(()) => return Ok(()),
                // A collision means external interference or an allocator
                // bug; never retried, never overwritten.
                Err(e @ ProducerError::IndexCollision { .. }) => return Err(e),
                Err(ProducerError::Io(e)) if attempt < WRITE_RETRY_LIMIT => {
                    WRITE_RETRIES.inc();
                    warn!(
                        "Write attempt {} for {} failed: {}, retrying",
                        attempt,
                        path.display(),
                        e
                    );
                    tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        if self.cancelled {
            return true;
        }
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                self.cancelled = true;
                true
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => {
                self.cancelled = true;
                true
            }
            Err(broadcast::error::TryRecvError::Empty) => false,
        }
    }
}

/// Stage the artifact to a temporary file in the output directory, then move
/// it to its final name with create-exclusive semantics.
///
/// The staging file lives in the same directory so the final rename never
/// crosses filesystems; an observer listing the directory either sees the
/// complete artifact under its final name or nothing at all.
fn stage_and_persist(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)?;
    staging.write_all(bytes)?;
    staging.flush()?;
    match staging.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(ProducerError::IndexCollision {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(ProducerError::Io(e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::TarGzEncoder;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_starts_empty() {
        let status = ProducerStatus::new();
        let snapshot = status.snapshot().await;
        assert_eq!(snapshot.state, ProducerState::Starting);
        assert_eq!(snapshot.produced_count, 0);
        assert_eq!(snapshot.current_index, 0);
        assert_eq!(snapshot.current_usage_bytes, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_running() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_output_dir(dir.path());
        config.refill_rate_per_sec = 0.0;
        let (_tx, rx) = broadcast::channel(1);
        let result = Producer::new(
            Arc::new(config),
            Box::new(TarGzEncoder),
            Arc::new(ProducerStatus::new()),
            rx,
        );
        assert!(matches!(result, Err(ProducerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_directory_fails_at_startup() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_output_dir(dir.path().join("missing"));
        config.refill_rate_per_sec = 1000.0;
        config.max_artifacts = Some(1);
        let (_tx, rx) = broadcast::channel(1);
        let status = Arc::new(ProducerStatus::new());
        let producer = Producer::new(
            Arc::new(config),
            Box::new(TarGzEncoder),
            status.clone(),
            rx,
        )
        .unwrap();

        let result = producer.run().await;
        assert!(matches!(
            result,
            Err(ProducerError::DirectoryUnreadable { .. })
        ));
        assert_eq!(status.snapshot().await.state, ProducerState::Failed);
    }

    /// Enforcer whose deletions always fail, leaving the over-budget state
    /// in place. Stands in for a directory where nothing can be removed.
    struct StuckRetention;

    impl Enforcer for StuckRetention {
        fn enforce(
            &self,
            _dir: &Path,
            _pattern: &ArtifactNamePattern,
            _limit: RetentionLimit,
        ) -> Result<EnforceOutcome> {
            Ok(EnforceOutcome {
                removed: 0,
                bytes_freed: 0,
                failed: 1,
                still_over_budget: true,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_wait_times_out_as_quota_deadlock() {
        let dir = TempDir::new().unwrap();
        // Two artifacts over a one-artifact budget that retention cannot
        // clear: the wait loop must give up at the configured timeout.
        std::fs::write(dir.path().join("artifact-0.tar.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("artifact-1.tar.gz"), b"x").unwrap();

        let mut config = Config::with_output_dir(dir.path());
        config.refill_rate_per_sec = 1000.0;
        config.max_artifact_count = Some(1);
        config.quota_mode = QuotaMode::Backpressure;
        config.quota_wait_timeout_secs = Some(5);
        config.max_artifacts = Some(1);

        let (_tx, rx) = broadcast::channel(1);
        let status = Arc::new(ProducerStatus::new());
        let mut producer = Producer::new(
            Arc::new(config),
            Box::new(TarGzEncoder),
            status.clone(),
            rx,
        )
        .unwrap();
        producer.enforcer = Box::new(StuckRetention);

        let result = producer.run().await;
        assert!(matches!(
            result,
            Err(ProducerError::QuotaDeadlock { waited_secs }) if waited_secs >= 5
        ));
        assert_eq!(status.snapshot().await.state, ProducerState::Failed);
        // Nothing was produced into the over-budget directory.
        assert!(!dir.path().join("artifact-2.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_collision_with_existing_artifact_is_fatal() {
        let dir = TempDir::new().unwrap();
        let bytes = b"not produced by us";
        let file = dir.path().join("artifact-0.tar.gz");
        std::fs::write(&file, bytes).unwrap();

        // Simulate external interference by writing to an index the
        // allocator already handed out.
        let result = stage_and_persist(dir.path(), &file, b"new");
        assert!(matches!(result, Err(ProducerError::IndexCollision { .. })));
        // The original artifact was not overwritten.
        assert_eq!(std::fs::read(&file).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_staging_leaves_no_debris_on_success() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("artifact-0.tar.gz");
        stage_and_persist(dir.path(), &file, b"bytes").unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["artifact-0.tar.gz".to_string()]);
    }
}
