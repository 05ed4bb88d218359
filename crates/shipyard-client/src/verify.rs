use std::fs::File;
use std::io;
use std::path::Path;

use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};

use crate::error::UpdateError;

/// Lowercase hex SHA-256 of the file at `path`.
pub fn file_digest(path: &Path) -> Result<String, UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compare hex digests case-insensitively.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    constant_time_eq(
        actual.to_ascii_lowercase().as_bytes(),
        expected.trim().to_ascii_lowercase().as_bytes(),
    )
}

/// True if the file's SHA-256 equals `expected`. A mismatch is `Ok(false)`;
/// errors are reserved for I/O failures.
pub fn verify_file(path: &Path, expected: &str) -> Result<bool, UpdateError> {
    Ok(digests_match(&file_digest(path)?, expected))
}
