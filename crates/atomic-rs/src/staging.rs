//! Staging of root filesystems for scanning.
//!
//! A [`Stager`] mounts the root filesystem of every target under a private,
//! time-stamped directory:
//!
//! ```text
//! <staging_root>/
//! └── 2024-05-01-12-30-00-123456/   # session root, exposed at /scanin
//!     ├── <image id>/               # mounted image rootfs
//!     └── <container id>/           # mounted container rootfs
//! ```
//!
//! The resulting [`StagingSession`] owns those paths. [`StagingSession::unstage`]
//! unmounts and removes exactly what the session created, tolerates paths
//! that were already unmounted or removed, and may be called any number of
//! times. A session dropped without being unstaged unstages itself.
//!
//! Mountpoints are removed with a non-recursive remove, so a mount that
//! failed to detach is reported instead of having its contents deleted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::engine::{Engine, MountOptions, ObjectRef};
use crate::error::{AtomicError, Result};
use crate::privilege;
use crate::resolve::ResolvedTarget;

/// Subdirectory holding the filesystem on drivers that need a bind step.
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// Format of session directory names (and scan result directories).
pub const SESSION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%6f";

/// Mounts targets into a new [`StagingSession`].
#[derive(Debug)]
pub struct Stager<'a> {
    engine: &'a dyn Engine,
    staging_root: PathBuf,
    privileged: bool,
    options: MountOptions,
}

impl<'a> Stager<'a> {
    /// Create a stager whose privilege reflects the current process.
    pub fn new<P: Into<PathBuf>>(engine: &'a dyn Engine, staging_root: P) -> Self {
        Self {
            engine,
            staging_root: staging_root.into(),
            privileged: privilege::can_mount(),
            options: MountOptions::default(),
        }
    }

    /// Override the detected privilege.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Mount options used for every target (read-only by default).
    pub fn with_options(mut self, options: MountOptions) -> Self {
        self.options = options;
        self
    }

    /// Mount every target under a fresh session root.
    ///
    /// If any mount fails, everything mounted so far is unstaged and the
    /// session directories are removed before the error is returned as
    /// [`AtomicError::Stage`].
    pub fn stage(&self, targets: &[ResolvedTarget]) -> Result<StagingSession<'a>> {
        privilege::require(self.privileged, "scan")?;
        let needs_bind = self.engine.info()?.needs_rootfs_bind();

        let stamp = Local::now().format(SESSION_TIMESTAMP_FORMAT).to_string();
        let root_dir = self.staging_root.join(&stamp);
        std::fs::create_dir_all(&self.staging_root)?;
        std::fs::create_dir(&root_dir)?;
        tracing::debug!("created {}", root_dir.display());

        let mut session = StagingSession {
            engine: self.engine,
            root_dir,
            stamp,
            mounts: Vec::with_capacity(targets.len()),
            preserve: false,
            torn_down: false,
        };

        for target in targets {
            if let Err(e) = session.mount_one(&target.object, &self.options, needs_bind) {
                tracing::debug!("staging '{}' failed, rolling back", target.matched_token);
                if let Err(cleanup) = session.unstage() {
                    tracing::warn!("rollback of {} incomplete: {}", session.root_dir.display(), cleanup);
                }
                return Err(AtomicError::Stage {
                    target: target.matched_token.clone(),
                    source: Box::new(e),
                });
            }
        }

        tracing::info!(
            "staged {} target(s) under {}",
            session.mounts.len(),
            session.root_dir.display()
        );
        Ok(session)
    }
}

/// One mounted target.
#[derive(Debug, Clone)]
pub struct StagedMount {
    pub object: ObjectRef,
    pub path: PathBuf,
    /// Whether a `rootfs` bind sits on top of the mount.
    pub bound: bool,
}

/// Mounts and directories created by one [`Stager::stage`] call.
#[derive(Debug)]
pub struct StagingSession<'a> {
    engine: &'a dyn Engine,
    root_dir: PathBuf,
    stamp: String,
    mounts: Vec<StagedMount>,
    preserve: bool,
    torn_down: bool,
}

impl StagingSession<'_> {
    /// The session root containing one directory per target.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The session's directory name.
    pub fn timestamp(&self) -> &str {
        &self.stamp
    }

    pub fn mounts(&self) -> &[StagedMount] {
        &self.mounts
    }

    /// Mountpoint of the object with the given ID.
    pub fn mountpoint(&self, id: &str) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|m| m.object.id == id)
            .map(|m| m.path.as_path())
    }

    /// Keep the session directories on unstage (mounts are still removed).
    pub fn set_preserve(&mut self, preserve: bool) {
        self.preserve = preserve;
    }

    fn mount_one(&mut self, object: &ObjectRef, options: &MountOptions, needs_bind: bool) -> Result<()> {
        let path = self.root_dir.join(&object.id);
        std::fs::create_dir(&path)?;
        tracing::debug!("created {}", path.display());
        self.mounts.push(StagedMount {
            object: object.clone(),
            path: path.clone(),
            bound: false,
        });

        self.engine.mount(object, &path, options)?;
        tracing::debug!("mounted {} {} at {}", object.kind, object.short_id(), path.display());
        if needs_bind {
            self.engine.bind_mount(&path.join(ROOTFS_SUBDIR), &path)?;
            if let Some(last) = self.mounts.last_mut() {
                last.bound = true;
            }
        }
        Ok(())
    }

    /// Unmount every target and remove the session directories.
    ///
    /// Safe to call repeatedly. Every mount is attempted even if an earlier
    /// one fails; the first failure is returned.
    pub fn unstage(&mut self) -> Result<()> {
        let mut first_error: Option<AtomicError> = None;
        let mut note = |e: AtomicError| {
            tracing::warn!("{}", e);
            first_error.get_or_insert(e);
        };

        for mount in self.mounts.iter().rev() {
            let layers = if mount.bound { 2 } else { 1 };
            for _ in 0..layers {
                match self.engine.unmount(&mount.path) {
                    Ok(true) => tracing::debug!("unmounted {}", mount.path.display()),
                    Ok(false) => {}
                    Err(e) => note(e),
                }
            }
        }

        if !self.preserve {
            for mount in self.mounts.iter().rev() {
                if let Err(e) = remove_dir_if_present(&mount.path) {
                    note(e);
                }
            }
            if let Err(e) = remove_dir_if_present(&self.root_dir) {
                note(e);
            }
        } else {
            tracing::info!("preserving {}", self.root_dir.display());
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.torn_down = true;
                Ok(())
            }
        }
    }
}

impl Drop for StagingSession<'_> {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.unstage() {
                tracing::warn!("failed to unstage {}: {}", self.root_dir.display(), e);
            }
        }
    }
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_dir(path) {
        Ok(()) => {
            tracing::debug!("removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(std::io::Error::new(
            e.kind(),
            format!("unable to remove {}: {}", path.display(), e),
        )
        .into()),
    }
}

/// Mount a single object at a caller-chosen mountpoint.
///
/// Applies the same privilege check and storage driver handling as
/// [`Stager::stage`].
pub fn mount_target(
    engine: &dyn Engine,
    target: &ObjectRef,
    mountpoint: &Path,
    options: &MountOptions,
    privileged: bool,
) -> Result<()> {
    privilege::require(privileged, "mount")?;
    let needs_bind = engine.info()?.needs_rootfs_bind();
    engine.mount(target, mountpoint, options)?;
    if needs_bind {
        if let Err(e) = engine.bind_mount(&mountpoint.join(ROOTFS_SUBDIR), mountpoint) {
            if let Err(cleanup) = engine.unmount(mountpoint) {
                tracing::warn!("unable to unmount {}: {}", mountpoint.display(), cleanup);
            }
            return Err(e);
        }
    }
    tracing::info!("mounted {} {} at {}", target.kind, target.short_id(), mountpoint.display());
    Ok(())
}

/// Undo [`mount_target`]. Returns `false` when nothing was mounted.
pub fn unmount_target(engine: &dyn Engine, mountpoint: &Path, privileged: bool) -> Result<bool> {
    privilege::require(privileged, "unmount")?;
    let needs_bind = engine.info()?.needs_rootfs_bind();
    let mut unmounted = engine.unmount(mountpoint)?;
    if needs_bind && unmounted {
        unmounted = engine.unmount(mountpoint)?;
    }
    Ok(unmounted)
}
