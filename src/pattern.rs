//! Artifact naming grammar.
//!
//! Artifact filenames follow `prefix + decimal digits + suffix`. The digit
//! group is the sequence index; everything else in the directory is treated
//! as an unrelated file and ignored.

/// Naming pattern shared by the allocator, quota monitor and retention
/// policy, so all three agree on what counts as an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactNamePattern {
    prefix: String,
    suffix: String,
}

impl ArtifactNamePattern {
    /// Create a pattern from a filename prefix and suffix.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Parse the sequence index out of a filename.
    ///
    /// Returns `None` for names that do not match the grammar, including
    /// digit groups that overflow `u64`. Partial matches are not errors; the
    /// directory may contain unrelated files.
    pub fn parse_index(&self, name: &str) -> Option<u64> {
        let digits = name
            .strip_prefix(&self.prefix)?
            .strip_suffix(&self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Render the filename for a sequence index.
    pub fn file_name(&self, index: u64) -> String {
        format!("{}{}{}", self.prefix, index, self.suffix)
    }
}
