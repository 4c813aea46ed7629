use crate::error::{Result, StowageError};
use md5::Digest;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-file bound on content hashing during enumeration.
pub const HASH_TIMEOUT: Duration = Duration::from_secs(30);

fn stream_file<P: AsRef<Path>>(path: P, mut update: impl FnMut(&[u8])) -> Result<()> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        log::error!("Failed to open file for hashing: {}: {}", path.display(), e);
        e
    })?;

    let mut reader = BufReader::new(file);
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        update(&buffer[..bytes_read]);
    }
    Ok(())
}

pub fn compute_blake3_hash<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    stream_file(path, |chunk| {
        hasher.update(chunk);
    })?;
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn compute_md5_hash<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut hasher = md5::Md5::new();
    stream_file(path, |chunk| hasher.update(chunk))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash `path` matching the algorithm implied by `expected`'s length
/// (64 hex chars: BLAKE3, 32: MD5).
pub fn hash_like<P: AsRef<Path>>(path: P, expected: &str) -> Result<String> {
    match expected.len() {
        64 => compute_blake3_hash(path),
        32 => compute_md5_hash(path),
        other => Err(StowageError::Migration(format!(
            "Invalid hash length: {}",
            other
        ))),
    }
}

pub fn verify_destination<P: AsRef<Path>>(path: P, expected_hash: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = hash_like(path, expected_hash)?;

    if !actual.eq_ignore_ascii_case(expected_hash) {
        return Err(StowageError::HashMismatch {
            path: path.display().to_string(),
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok(())
}

/// BLAKE3 on the blocking pool, bounded by `timeout`. Timeouts, read errors
/// and cancellation all yield `None`.
pub async fn blake3_with_timeout(
    path: PathBuf,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<String> {
    let display = path.display().to_string();
    let task = tokio::task::spawn_blocking(move || compute_blake3_hash(&path));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        joined = tokio::time::timeout(timeout, task) => match joined {
            Ok(Ok(Ok(hash))) => Some(hash),
            Ok(Ok(Err(e))) => {
                log::warn!("Hashing failed for {}: {}", display, e);
                None
            }
            Ok(Err(e)) => {
                log::warn!("Hash task failed for {}: {}", display, e);
                None
            }
            Err(_) => {
                log::warn!("Hashing timed out after {:?} for {}", timeout, display);
                None
            }
        },
    }
}
