//! SHA-256 verification of downloaded artifacts.
//!
//! The hub listing carries an expected digest for LFS-backed files; after a
//! transfer completes we can confirm the bytes on disk match it. Hashing a
//! multi-gigabyte file is blocking work, so callers run these through
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::error::{DownloadError, DownloadResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the SHA-256 checksum of a file.
///
/// Returns the lowercase hexadecimal digest of the file contents.
pub fn calculate_file_checksum(path: &Path) -> DownloadResult<String> {
    let mut file = File::open(path).map_err(|e| DownloadError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| DownloadError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches an expected SHA-256 digest.
///
/// # Errors
///
/// [`DownloadError::ChecksumMismatch`] when the digests differ, or a read
/// error if the file cannot be hashed.
pub fn verify_checksum(path: &Path, expected: &str) -> DownloadResult<()> {
    let actual = calculate_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            filename: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
