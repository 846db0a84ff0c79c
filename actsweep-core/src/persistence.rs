//! Atomic file writes with a bounded retry.
//!
//! Checkpoints are rewritten every epoch, so a write must never leave a
//! readable-but-truncated file at its canonical path: data goes to a `.tmp`
//! sibling, is synced, and is then renamed over the target.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often, and after what pause, a failed write is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            pause: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A policy that surfaces the first failure.
    pub fn none() -> Self {
        Self {
            retries: 0,
            pause: Duration::ZERO,
        }
    }
}

/// The temporary sibling used while `path` is being written.
///
/// The suffix is appended to the full file name so that `run_mid.ckpt` and
/// `run_final.ckpt` never share a temporary file.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("unnamed"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling, syncs it, then renames it over the target.
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = temp_path(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// [`atomic_write`] with a bounded retry on I/O failure.
pub fn atomic_write_with_retry(path: &Path, data: &[u8], policy: RetryPolicy) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        match atomic_write(path, data) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "Write failed, retrying"
                );
                std::thread::sleep(policy.pause);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("seed-0").join("run_final.ckpt");

        atomic_write(&path, b"{}").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_mid.ckpt");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert!(!temp_path(&path).exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_temp_paths_do_not_collide() {
        let mid = temp_path(Path::new("/out/run_mid.ckpt"));
        let fin = temp_path(Path::new("/out/run_final.ckpt"));
        assert_ne!(mid, fin);
        assert_eq!(mid, PathBuf::from("/out/run_mid.ckpt.tmp"));
    }

    #[test]
    fn test_retry_surfaces_persistent_failure() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be replaced by a file rename.
        let target = dir.path().join("occupied");
        std::fs::create_dir_all(target.join("child")).unwrap();

        let policy = RetryPolicy {
            retries: 1,
            pause: Duration::from_millis(1),
        };
        assert!(atomic_write_with_retry(&target, b"data", policy).is_err());
        assert!(!temp_path(&target).exists());
    }
}
