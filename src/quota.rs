//! Storage quota measurement.
//!
//! Usage is recomputed from the directory on every call, never cached, so
//! external deletion or addition of artifacts by other tools is tolerated.
//! Only entries matching the artifact naming grammar count; staging files
//! and unrelated files are excluded, which also keeps in-flight partial
//! writes out of the total.

use std::fs;
use std::path::Path;

use tracing::trace;

use crate::config::RetentionLimit;
use crate::error::{ProducerError, Result};
use crate::pattern::ArtifactNamePattern;

/// Measured storage state of the output directory against a limit.
#[derive(Debug, Clone)]
pub struct QuotaState {
    /// Total bytes across all artifacts.
    pub total_bytes: u64,
    /// Number of artifacts present.
    pub artifact_count: u64,
    /// Limit the measurement is judged against.
    pub limit: RetentionLimit,
}

impl QuotaState {
    /// Whether the directory exceeds the configured budget.
    pub fn is_over_budget(&self) -> bool {
        self.limit.is_exceeded(self.total_bytes, self.artifact_count)
    }
}

/// Measure current artifact usage in a directory.
///
/// O(n) in directory entry count; callers are expected to invoke this on a
/// sampling cadence rather than per artifact.
pub fn current_usage(
    dir: &Path,
    pattern: &ArtifactNamePattern,
    limit: RetentionLimit,
) -> Result<QuotaState> {
    let entries = fs::read_dir(dir).map_err(|source| ProducerError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut total_bytes = 0u64;
    let mut artifact_count = 0u64;
    for entry in entries {
        let entry = entry.map_err(|source| ProducerError::DirectoryUnreadable {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if pattern.parse_index(name).is_none() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            // Racing an external deletion: the entry no longer consumes
            // quota, skip it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ProducerError::Io(e)),
        };
        if !metadata.is_file() {
            continue;
        }
        total_bytes += metadata.len();
        artifact_count += 1;
    }

    trace!(
        "Usage in {}: {} bytes across {} artifacts",
        dir.display(),
        total_bytes,
        artifact_count
    );
    Ok(QuotaState {
        total_bytes,
        artifact_count,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pattern() -> ArtifactNamePattern {
        ArtifactNamePattern::new("artifact-", ".tar.gz")
    }

    #[test]
    fn test_counts_only_matching_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("artifact-0.tar.gz"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("artifact-1.tar.gz"), vec![0u8; 20]).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.path().join(".stockpile-staging"), vec![0u8; 1000]).unwrap();

        let state = current_usage(
            dir.path(),
            &pattern(),
            RetentionLimit::MaxTotalBytes(100),
        )
        .unwrap();
        assert_eq!(state.total_bytes, 30);
        assert_eq!(state.artifact_count, 2);
        assert!(!state.is_over_budget());
    }

    #[test]
    fn test_over_budget_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("artifact-0.tar.gz"), vec![0u8; 50]).unwrap();

        let state = current_usage(
            dir.path(),
            &pattern(),
            RetentionLimit::MaxTotalBytes(49),
        )
        .unwrap();
        assert!(state.is_over_budget());

        let state = current_usage(
            dir.path(),
            &pattern(),
            RetentionLimit::MaxTotalBytes(50),
        )
        .unwrap();
        assert!(!state.is_over_budget());
    }

    #[test]
    fn test_count_limit() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("artifact-{}.tar.gz", i)), b"x").unwrap();
        }

        let state = current_usage(
            dir.path(),
            &pattern(),
            RetentionLimit::MaxArtifactCount(3),
        )
        .unwrap();
        assert!(state.is_over_budget());
    }

    #[test]
    fn test_unreadable_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            current_usage(&missing, &pattern(), RetentionLimit::MaxTotalBytes(1)),
            Err(ProducerError::DirectoryUnreadable { .. })
        ));
    }
}
