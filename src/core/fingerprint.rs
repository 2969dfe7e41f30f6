//! Native build fingerprints
//!
//! Maps the SHA-256 of a native binary to a version label so the active build
//! can be reported even when the binary cannot report it reliably itself.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Label reported for hashes missing from the table
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Content hash of a native binary and its version label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFingerprint {
    pub hash: [u8; 32],
    pub label: String,
}

impl VersionFingerprint {
    /// Lowercase hex rendering of the hash
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Whether the hash matched a known build
    pub fn is_known(&self) -> bool {
        self.label != UNKNOWN_LABEL
    }
}

/// Immutable hash → label table
#[derive(Debug, Default, Clone)]
pub struct FingerprintTable {
    labels: HashMap<[u8; 32], String>,
}

impl FingerprintTable {
    /// Build a table from (hex hash, label) pairs; malformed hashes are skipped
    pub fn from_entries<I, H, L>(entries: I) -> Self
    where
        I: IntoIterator<Item = (H, L)>,
        H: AsRef<str>,
        L: Into<String>,
    {
        let mut labels = HashMap::new();
        for (hash, label) in entries {
            let mut digest = [0u8; 32];
            match hex::decode_to_slice(hash.as_ref().trim(), &mut digest) {
                Ok(()) => {
                    labels.insert(digest, label.into());
                }
                Err(e) => {
                    debug!(hash = hash.as_ref(), error = %e, "Skipping malformed fingerprint");
                }
            }
        }
        Self { labels }
    }

    /// Label for a hash, `"Unknown"` when absent
    pub fn label_for(&self, hash: &[u8; 32]) -> &str {
        self.labels
            .get(hash)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn sha256_of_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Streamed SHA-256 of everything a reader yields, as lowercase hex
pub fn sha256_hex_of_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<String> {
    sha256_of_reader(reader).map(hex::encode)
}

/// Fingerprint a file
///
/// Returns `None` when the file is missing or unreadable; fingerprinting is
/// then simply skipped.
pub fn compute_version_fingerprint(
    table: &FingerprintTable,
    path: &Path,
) -> Option<VersionFingerprint> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping fingerprint");
            return None;
        }
    };

    match sha256_of_reader(&mut file) {
        Ok(hash) => Some(VersionFingerprint {
            hash,
            label: table.label_for(&hash).to_string(),
        }),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping fingerprint");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_hash_reports_label() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.so");
        std::fs::write(&path, b"abc").unwrap();

        let table = FingerprintTable::from_entries([(ABC, "3.46.1")]);
        let fingerprint = compute_version_fingerprint(&table, &path).unwrap();

        assert_eq!(fingerprint.hash_hex(), ABC);
        assert_eq!(fingerprint.label, "3.46.1");
        assert!(fingerprint.is_known());
    }

    #[test]
    fn test_unknown_hash_reports_unknown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.so");
        std::fs::write(&path, b"something else").unwrap();

        let table = FingerprintTable::from_entries([(ABC, "3.46.1")]);
        let fingerprint = compute_version_fingerprint(&table, &path).unwrap();

        assert_eq!(fingerprint.label, UNKNOWN_LABEL);
        assert!(!fingerprint.is_known());
    }

    #[test]
    fn test_missing_file_skips() {
        let table = FingerprintTable::default();
        assert!(compute_version_fingerprint(&table, Path::new("/no/such/lib.so")).is_none());
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let table = FingerprintTable::from_entries([("zz", "bad"), (ABC, "good")]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_hex_of_reader() {
        let hash = sha256_hex_of_reader(&mut &b"abc"[..]).unwrap();
        assert_eq!(hash, ABC);
    }
}
