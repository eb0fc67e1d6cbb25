//! Startup index allocation.
//!
//! The sequence index is persisted implicitly as "highest index implied by
//! existing artifact names". This module recovers it with a single directory
//! scan at startup; afterwards the in-memory index held by the producer is
//! the sole source of truth.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{ProducerError, Result};
use crate::pattern::ArtifactNamePattern;

/// Compute the next safe sequence index for a directory.
///
/// Returns `max(matched indices) + 1`, or `0` if no directory entry matches
/// the artifact naming grammar. Entries that only partially match are
/// ignored. An unlistable directory is fatal to startup and is not retried.
pub fn resume_index(dir: &Path, pattern: &ArtifactNamePattern) -> Result<u64> {
    let entries = fs::read_dir(dir).map_err(|source| ProducerError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut highest: Option<u64> = None;
    for entry in entries {
        let entry = entry.map_err(|source| ProducerError::DirectoryUnreadable {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = pattern.parse_index(name) {
            highest = Some(highest.map_or(index, |h| h.max(index)));
        }
    }

    let next = match highest {
        // An artifact at u64::MAX leaves no next index to hand out.
        Some(h) => h.checked_add(1).ok_or_else(|| {
            ProducerError::Configuration(format!("artifact index space exhausted at {}", h))
        })?,
        None => 0,
    };
    debug!("Resuming at index {} (highest existing: {:?})", next, highest);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pattern() -> ArtifactNamePattern {
        ArtifactNamePattern::new("artifact-", ".tar.gz")
    }

    #[test]
    fn test_empty_directory_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resume_index(dir.path(), &pattern()).unwrap(), 0);
    }

    #[test]
    fn test_resumes_after_highest_index() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            std::fs::write(dir.path().join(format!("artifact-{}.tar.gz", i)), b"x").unwrap();
        }
        assert_eq!(resume_index(dir.path(), &pattern()).unwrap(), 10);
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("artifact-3.tar.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("artifact-x.tar.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(resume_index(dir.path(), &pattern()).unwrap(), 4);
    }

    #[test]
    fn test_gap_does_not_matter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("artifact-0.tar.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("artifact-7.tar.gz"), b"x").unwrap();
        assert_eq!(resume_index(dir.path(), &pattern()).unwrap(), 8);
    }

    #[test]
    fn test_exhausted_index_space_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(format!("artifact-{}.tar.gz", u64::MAX)),
            b"x",
        )
        .unwrap();
        assert!(matches!(
            resume_index(dir.path(), &pattern()),
            Err(ProducerError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        match resume_index(&missing, &pattern()) {
            Err(ProducerError::DirectoryUnreadable { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected DirectoryUnreadable, got {:?}", other.map(|_| ())),
        }
    }
}
