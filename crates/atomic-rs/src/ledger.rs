//! The install ledger.
//!
//! `atomic-rs install` records every image it installs in a small JSON file
//! (by default `/etc/atomic.d/install`), keyed by image ID:
//!
//! ```json
//! {
//!   "abc123...": {
//!     "installed": true,
//!     "date": "2024-05-01 12:30:00.123456",
//!     "image_name": "registry.example.com/rsyslog"
//!   }
//! }
//! ```
//!
//! `atomic-rs run` consults it so that an image declaring an `INSTALL` label
//! is not run before it was installed.
//!
//! Reads never fail: a missing or malformed ledger reads as empty. Every
//! update is a read-modify-write under an exclusive lock on `<ledger>.lock`,
//! and the new content is written to a temporary file that is then renamed
//! over the ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{AtomicError, Result};
use crate::lockfile::LockFile;

/// Format of [`InstallRecord::date`].
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Metadata stored for one installed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub installed: bool,
    /// Local time of the install.
    pub date: String,
    /// The name the image was installed under.
    pub image_name: String,
}

type Entries = BTreeMap<String, InstallRecord>;

/// Handle to a ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn split(&self) -> Result<(&Path, &str)> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid ledger path {}", self.path.display()),
                )
            })?;
        Ok((parent, file_name))
    }

    /// Load all entries; anything unreadable yields an empty ledger.
    pub fn load(&self) -> Entries {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::debug!("ignoring malformed ledger {}: {}", self.path.display(), e);
                Entries::new()
            }),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!("unable to read ledger {}: {}", self.path.display(), e);
                }
                Entries::new()
            }
        }
    }

    /// All entries, ordered by image ID.
    pub fn entries(&self) -> Vec<(String, InstallRecord)> {
        self.load().into_iter().collect()
    }

    pub fn get(&self, image_id: &str) -> Option<InstallRecord> {
        self.load().remove(image_id)
    }

    pub fn has_record(&self, image_id: &str) -> bool {
        self.load().contains_key(image_id)
    }

    /// Write entries atomically via a temporary file in the same directory.
    fn save(&self, dir: &Dir, file_name: &str, entries: &Entries) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let temp_name = format!(".{}.{}.tmp", file_name, std::process::id());
        dir.write(&temp_name, json.as_bytes())?;
        if let Err(e) = dir.rename(&temp_name, dir, file_name) {
            let _ = dir.remove_file(&temp_name);
            return Err(e.into());
        }
        Ok(())
    }

    /// Record `image_id` as installed under `image_name`, replacing any
    /// earlier record.
    pub fn record(&self, image_id: &str, image_name: &str) -> Result<InstallRecord> {
        let (parent, file_name) = self.split()?;
        let dir = Dir::create_ambient_dir_all(parent, ambient_authority())
            .and_then(|()| Dir::open_ambient_dir(parent, ambient_authority()))?;
        let lockfile = LockFile::open(self.lock_path())?;
        let _guard = lockfile.lock()?;

        let mut entries = self.load();
        let record = InstallRecord {
            installed: true,
            date: Local::now().format(DATE_FORMAT).to_string(),
            image_name: image_name.to_string(),
        };
        entries.insert(image_id.to_string(), record.clone());
        self.save(&dir, file_name, &entries)?;
        tracing::debug!("recorded install of {} in {}", image_id, self.path.display());
        Ok(record)
    }

    /// Drop the record for `image_id`.
    ///
    /// Returns whether a record existed. Nothing is written when it did not.
    pub fn forget(&self, image_id: &str) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let (parent, file_name) = self.split()?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
        let lockfile = LockFile::open(self.lock_path())?;
        let _guard = lockfile.lock()?;

        let mut entries = self.load();
        if entries.remove(image_id).is_none() {
            return Ok(false);
        }
        self.save(&dir, file_name, &entries)?;
        tracing::debug!("removed install record of {}", image_id);
        Ok(true)
    }
}

/// Refuse to run an image that declares an `INSTALL` label but was never
/// installed, unless `nocheck` is set.
pub fn check_install(
    ledger: &Ledger,
    image_id: &str,
    image_name: &str,
    has_install_label: bool,
    nocheck: bool,
) -> Result<()> {
    if nocheck || !has_install_label || ledger.has_record(image_id) {
        return Ok(());
    }
    Err(AtomicError::NotInstalled {
        image: image_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_forget() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("atomic.d/install"));
        assert!(!ledger.has_record("abc123"));

        let record = ledger.record("abc123", "rsyslog").unwrap();
        assert!(record.installed);
        assert!(ledger.has_record("abc123"));
        assert_eq!(ledger.get("abc123").unwrap().image_name, "rsyslog");

        ledger.record("def456", "sssd").unwrap();
        assert_eq!(ledger.entries().len(), 2);

        assert!(ledger.forget("abc123").unwrap());
        assert!(!ledger.has_record("abc123"));
        assert!(ledger.has_record("def456"));
        assert!(!ledger.forget("abc123").unwrap());
    }

    #[test]
    fn test_record_upserts() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("install"));
        ledger.record("abc123", "old").unwrap();
        ledger.record("abc123", "new").unwrap();
        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(ledger.get("abc123").unwrap().image_name, "new");
    }

    #[test]
    fn test_forget_missing_file_does_not_write() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("install"));
        assert!(!ledger.forget("abc123").unwrap());
        assert!(!dir.path().join("install").exists());
        assert!(!dir.path().join("install.lock").exists());
    }

    #[test]
    fn test_malformed_reads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install");
        std::fs::write(&path, "not json").unwrap();
        let ledger = Ledger::new(&path);
        assert!(ledger.entries().is_empty());

        ledger.record("abc123", "rsyslog").unwrap();
        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["abc123"]["installed"], true);
        assert_eq!(on_disk["abc123"]["image_name"], "rsyslog");
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("install"));
        ledger.record("abc123", "rsyslog").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[test]
    fn test_check_install() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("install"));

        assert!(check_install(&ledger, "abc123", "app", false, false).is_ok());
        assert!(check_install(&ledger, "abc123", "app", true, true).is_ok());
        let err = check_install(&ledger, "abc123", "app", true, false).unwrap_err();
        assert!(matches!(err, AtomicError::NotInstalled { ref image } if image == "app"));

        ledger.record("abc123", "app").unwrap();
        assert!(check_install(&ledger, "abc123", "app", true, false).is_ok());
    }
}
