//! Oldest-first retention enforcement.
//!
//! Victims are selected by the sequence index encoded in the filename, not
//! filesystem mtime, which external copies can alter. Lower index means
//! older. Artifacts are removed one at a time, re-checking usage after each
//! removal, stopping as soon as the limit is satisfied.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::RetentionLimit;
use crate::error::{ProducerError, Result};
use crate::pattern::ArtifactNamePattern;

/// Result of one enforcement pass.
#[derive(Debug, Default, Clone)]
pub struct EnforceOutcome {
    /// Artifacts removed (including ones found already gone).
    pub removed: u64,
    /// Bytes freed by the removals.
    pub bytes_freed: u64,
    /// Deletions that failed and were skipped.
    pub failed: u64,
    /// Whether the directory is still over budget after the pass. True only
    /// when deletions failed; a pass that can delete freely always ends at
    /// or under the limit.
    pub still_over_budget: bool,
}

#[derive(Debug)]
struct Victim {
    index: u64,
    path: PathBuf,
    size: u64,
}

/// Enforcement seam for the producer, mirroring the encoder seam: the wait
/// loop only needs "run one pass, tell me the outcome", not the filesystem.
pub trait Enforcer: Send + Sync {
    /// Run one enforcement pass over `dir`.
    fn enforce(
        &self,
        dir: &Path,
        pattern: &ArtifactNamePattern,
        limit: RetentionLimit,
    ) -> Result<EnforceOutcome>;
}

/// The real enforcer, deleting artifacts via [`enforce`].
pub struct FsRetention;

impl Enforcer for FsRetention {
    fn enforce(
        &self,
        dir: &Path,
        pattern: &ArtifactNamePattern,
        limit: RetentionLimit,
    ) -> Result<EnforceOutcome> {
        enforce(dir, pattern, limit)
    }
}

/// Remove oldest artifacts until the directory satisfies `limit`.
///
/// A `NotFound` on deletion is success: the goal that the artifact no longer
/// consumes quota is met, presumably by another tool. Other deletion errors
/// are logged and skipped; the pass continues with the next victim and
/// reports residual over-budget rather than failing the producer. Only an
/// unlistable directory is an error.
pub fn enforce(
    dir: &Path,
    pattern: &ArtifactNamePattern,
    limit: RetentionLimit,
) -> Result<EnforceOutcome> {
    let mut victims = collect_artifacts(dir, pattern)?;
    victims.sort_by_key(|v| v.index);

    let mut total_bytes: u64 = victims.iter().map(|v| v.size).sum();
    let mut count = victims.len() as u64;
    let mut outcome = EnforceOutcome::default();

    for victim in &victims {
        if !limit.is_exceeded(total_bytes, count) {
            break;
        }
        match fs::remove_file(&victim.path) {
            Ok(()) => {
                debug!("Evicted artifact {}", victim.path.display());
                outcome.removed += 1;
                outcome.bytes_freed += victim.size;
                total_bytes = total_bytes.saturating_sub(victim.size);
                count -= 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Already removed externally; the quota goal is met.
                debug!("Artifact {} already gone", victim.path.display());
                outcome.removed += 1;
                total_bytes = total_bytes.saturating_sub(victim.size);
                count -= 1;
            }
            Err(e) => {
                warn!("Failed to evict {}: {}", victim.path.display(), e);
                outcome.failed += 1;
                // Skip this victim; a younger one may still be removable.
            }
        }
    }

    outcome.still_over_budget = limit.is_exceeded(total_bytes, count);
    if outcome.removed > 0 || outcome.failed > 0 {
        info!(
            "Retention pass removed {} artifacts ({} bytes), {} failures{}",
            outcome.removed,
            outcome.bytes_freed,
            outcome.failed,
            if outcome.still_over_budget {
                ", still over budget"
            } else {
                ""
            }
        );
    }
    Ok(outcome)
}

fn collect_artifacts(dir: &Path, pattern: &ArtifactNamePattern) -> Result<Vec<Victim>> {
    let entries = fs::read_dir(dir).map_err(|source| ProducerError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ProducerError::DirectoryUnreadable {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(index) = pattern.parse_index(name) else {
            continue;
        };
        match entry.metadata() {
            Ok(m) if m.is_file() => artifacts.push(Victim {
                index,
                path: entry.path(),
                size: m.len(),
            }),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                // Unsizable but still a deletion candidate.
                warn!("Cannot stat {}: {}", entry.path().display(), e);
                artifacts.push(Victim {
                    index,
                    path: entry.path(),
                    size: 0,
                });
            }
        }
    }
    Ok(artifacts)
}
