//! Host-wide record of the engine mounts behind caller mountpoints.
//!
//! `podman image mount` keeps an image mounted in podman's own storage until
//! a matching `podman image unmount`. What the user sees is only the bind
//! mount at their mountpoint, so the object behind every mountpoint is
//! recorded here. A later `atomic-rs unmount`, running in a different
//! process, looks the mountpoint up and releases podman's mount.
//!
//! The registry is a JSON object in `<state dir>/mounts.json`:
//!
//! ```json
//! {
//!   "/mnt/nginx": { "id": "4bb46517cac3...", "kind": "image", "depth": 1 }
//! }
//! ```
//!
//! `depth` counts the mounts stacked on the mountpoint (2 when a `rootfs`
//! bind sits on top). Updates follow the install ledger's scheme: an
//! exclusive lock on `mounts.json.lock`, then a temporary file renamed over
//! the registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::{Deserialize, Serialize};

use super::{ObjectKind, ObjectRef};
use crate::error::Result;
use crate::lockfile::LockFile;

const FILE_NAME: &str = "mounts.json";
const LOCK_NAME: &str = "mounts.json.lock";

/// The object mounted at one mountpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub id: String,
    pub kind: ObjectKind,
    pub depth: usize,
}

type Records = BTreeMap<String, MountRecord>;

#[derive(Debug, Clone)]
pub struct MountRegistry {
    dir: PathBuf,
}

/// Registry key for a mountpoint; the same directory must map to the same
/// key however the caller spelled it.
fn key(mountpoint: &Path) -> String {
    std::fs::canonicalize(mountpoint)
        .unwrap_or_else(|_| mountpoint.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

impl MountRegistry {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// All records; a missing or malformed registry reads as empty.
    fn load(&self) -> Records {
        let path = self.dir.join(FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::debug!("ignoring malformed mount registry {}: {}", path.display(), e);
                Records::new()
            }),
            Err(_) => Records::new(),
        }
    }

    /// Run `f` over the records under the lock and persist the result.
    fn update<T>(&self, f: impl FnOnce(&mut Records) -> T) -> Result<T> {
        let dir = Dir::create_ambient_dir_all(&self.dir, ambient_authority())
            .and_then(|()| Dir::open_ambient_dir(&self.dir, ambient_authority()))?;
        let lockfile = LockFile::open(self.dir.join(LOCK_NAME))?;
        let _guard = lockfile.lock()?;

        let mut records = self.load();
        let result = f(&mut records);

        let json = serde_json::to_string_pretty(&records)?;
        let temp_name = format!(".{}.{}.tmp", FILE_NAME, std::process::id());
        dir.write(&temp_name, json.as_bytes())?;
        if let Err(e) = dir.rename(&temp_name, &dir, FILE_NAME) {
            let _ = dir.remove_file(&temp_name);
            return Err(e.into());
        }
        Ok(result)
    }

    /// Record a fresh mount of `target`, replacing any stale record.
    pub fn insert(&self, mountpoint: &Path, target: &ObjectRef) -> Result<()> {
        let record = MountRecord {
            id: target.id.clone(),
            kind: target.kind,
            depth: 1,
        };
        self.update(|records| {
            records.insert(key(mountpoint), record);
        })
    }

    /// Count one more mount stacked on a recorded mountpoint.
    pub fn push(&self, mountpoint: &Path) -> Result<()> {
        self.update(|records| {
            if let Some(record) = records.get_mut(&key(mountpoint)) {
                record.depth += 1;
            }
        })
    }

    /// Count one mount removed. Returns the record once the last one is gone.
    pub fn pop(&self, mountpoint: &Path) -> Result<Option<MountRecord>> {
        let key = key(mountpoint);
        if !self.load().contains_key(&key) {
            return Ok(None);
        }
        self.update(|records| {
            let record = records.get_mut(&key)?;
            record.depth = record.depth.saturating_sub(1);
            if record.depth == 0 {
                records.remove(&key)
            } else {
                None
            }
        })
    }
}
