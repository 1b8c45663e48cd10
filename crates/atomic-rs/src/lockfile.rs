//! Advisory file locking for host-wide state files.
//!
//! The install ledger and the engine mount registry are rewritten in full
//! on every change. Two invocations of the tool racing on the same host
//! would otherwise lose each other's updates, so each read-modify-write
//! cycle runs under an exclusive POSIX `fcntl` lock held on a sibling
//! `.lock` file.
//!
//! The lock is advisory: it only coordinates processes that take it.
//!
//! # Example
//!
//! ```no_run
//! use atomic_rs::lockfile::LockFile;
//!
//! let lockfile = LockFile::open("/etc/atomic.d/install.lock")?;
//! let guard = lockfile.lock()?;
//! // ... read, modify and write the protected file ...
//! drop(guard);
//! # Ok::<(), atomic_rs::lockfile::LockError>(())
//! ```

use std::fs::OpenOptions;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use rustix::fs::{FlockOperation, fcntl_lock};

/// Error types for lock file operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// I/O error while opening the lock file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The lock operation itself failed.
    #[error("lock operation failed: {0}")]
    LockFailed(#[from] rustix::io::Errno),
}

/// Result type for lock file operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// An exclusive, process-wide lock backed by a file.
#[derive(Debug)]
pub struct LockFile {
    fd: OwnedFd,
}

/// RAII guard for an exclusive lock.
///
/// The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lockfile: &'a LockFile,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = fcntl_lock(self.lockfile.fd.as_fd(), FlockOperation::Unlock);
    }
}

impl LockFile {
    /// Open or create a lock file at the specified path.
    ///
    /// The parent directory must already exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self { fd: file.into() })
    }

    /// Acquire the exclusive lock, blocking until available.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        fcntl_lock(self.fd.as_fd(), FlockOperation::LockExclusive)?;
        Ok(LockGuard { lockfile: self })
    }
}
