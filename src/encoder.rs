//! Archive encoding.
//!
//! The producer treats the container format as an external collaborator: one
//! operation that turns a list of named entries into bytes. The default
//! implementation builds a gzipped tar archive fully in memory.

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{ProducerError, Result};

/// A named entry to place inside an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Entry name within the archive.
    pub name: String,
    /// Entry content.
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    /// Create an entry from a name and content.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Codec collaborator: builds one archive in memory from an ordered sequence
/// of entries. Deterministic for fixed input.
pub trait ArchiveEncoder: Send + Sync {
    /// Encode the entries into a complete archive.
    fn encode(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>>;
}

/// Gzipped tar implementation of [`ArchiveEncoder`].
#[derive(Debug, Default)]
pub struct TarGzEncoder;

impl ArchiveEncoder for TarGzEncoder {
    fn encode(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let gz = GzEncoder::new(&mut bytes, Compression::default());
        let mut builder = tar::Builder::new(gz);

        for entry in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(entry.content.len() as u64);
            header.set_mode(0o644);
            // Fixed mtime keeps output deterministic for fixed input.
            header.set_mtime(0);
            builder
                .append_data(&mut header, &entry.name, entry.content.as_slice())
                .map_err(|e| ProducerError::Encoding(e.to_string()))?;
        }

        let gz = builder
            .into_inner()
            .map_err(|e| ProducerError::Encoding(e.to_string()))?;
        gz.finish()
            .map_err(|e| ProducerError::Encoding(e.to_string()))?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn decode(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (name, content)
            })
            .collect()
    }

    #[test]
    fn test_round_trip_single_entry() {
        let encoder = TarGzEncoder;
        let bytes = encoder
            .encode(&[ArchiveEntry::new("william.txt", "William")])
            .unwrap();

        let entries = decode(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "william.txt");
        assert_eq!(entries[0].1, b"William");
    }

    #[test]
    fn test_deterministic_for_fixed_input() {
        let encoder = TarGzEncoder;
        let entries = [ArchiveEntry::new("william.txt", "William")];
        let first = encoder.encode(&entries).unwrap();
        let second = encoder.encode(&entries).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_preserves_entry_order() {
        let encoder = TarGzEncoder;
        let bytes = encoder
            .encode(&[
                ArchiveEntry::new("b.txt", "bee"),
                ArchiveEntry::new("a.txt", "ay"),
            ])
            .unwrap();

        let entries = decode(&bytes);
        assert_eq!(entries[0].0, "b.txt");
        assert_eq!(entries[1].0, "a.txt");
    }
}
