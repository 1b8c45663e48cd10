//! Privilege detection for operations that mount filesystems.
//!
//! Staging root filesystems needs to create mounts on the host, which is
//! only possible with administrative privilege:
//!
//! - **Effective UID 0**: root can mount anything
//! - **Having `CAP_SYS_ADMIN`**: a non-root process with this capability in
//!   its effective set may also mount
//!
//! The check is a snapshot of the current process credentials. Callers take
//! it once, when a session starts, rather than before every mount.

use rustix::process::geteuid;
use rustix::thread::{CapabilitySet, capabilities};

use crate::error::{AtomicError, Result};

/// Check whether the current process may create mounts.
///
/// # Example
///
/// ```
/// use atomic_rs::privilege::can_mount;
///
/// if can_mount() {
///     println!("running with mount privilege");
/// }
/// ```
pub fn can_mount() -> bool {
    if geteuid().is_root() {
        return true;
    }

    match capabilities(None) {
        Ok(caps) => caps.effective.contains(CapabilitySet::SYS_ADMIN),
        Err(e) => {
            tracing::debug!("unable to read process capabilities: {}", e);
            false
        }
    }
}

/// Fail with [`AtomicError::PermissionDenied`] unless `privileged` is set.
pub fn require(privileged: bool, operation: &str) -> Result<()> {
    if privileged {
        Ok(())
    } else {
        Err(AtomicError::PermissionDenied {
            operation: operation.to_string(),
        })
    }
}
