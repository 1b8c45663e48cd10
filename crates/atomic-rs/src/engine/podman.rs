//! Engine implementation backed by the `podman` CLI.
//!
//! Listing and inspection parse podman's JSON output. Mounting asks podman to
//! mount the object in its own storage (`podman image mount` / `podman
//! mount`) and then bind-mounts that directory onto the requested mountpoint,
//! so the caller controls where the root filesystem appears. Unmounting
//! reverses both steps.
//!
//! Mount and unmount usually happen in different processes, so the object
//! behind each mountpoint is kept in a file-backed registry under the state
//! directory rather than in memory.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use rustix::mount::{MountFlags, UnmountFlags, mount_bind, mount_remount, unmount};
use serde_json::Value;

use super::registry::MountRegistry;
use super::{Engine, EngineInfo, MountOptions, ObjectKind, ObjectRef, ScanInvocation};
use crate::error::{AtomicError, Result};

/// Default directory of the mount registry.
pub const DEFAULT_STATE_DIR: &str = "/run/atomic";

/// Engine driving a podman-compatible CLI.
#[derive(Debug)]
pub struct PodmanEngine {
    binary: PathBuf,
    /// Objects mounted through any instance by host mountpoint.
    mounts: MountRegistry,
}

impl PodmanEngine {
    /// Create an engine using the given CLI binary.
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
            mounts: MountRegistry::new(DEFAULT_STATE_DIR),
        }
    }

    /// Keep the mount registry in `dir` instead of [`DEFAULT_STATE_DIR`].
    pub fn with_state_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.mounts = MountRegistry::new(dir);
        self
    }

    fn describe<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = self.binary.display().to_string();
        for arg in args {
            command.push(' ');
            command.push_str(&arg.as_ref().to_string_lossy());
        }
        command
    }

    /// Run the CLI and return its stdout.
    fn output<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<OsStr>,
    {
        tracing::trace!("running {}", self.describe(args.clone()));
        let output = Command::new(&self.binary)
            .args(args.clone())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                AtomicError::EngineUnavailable(format!(
                    "failed to execute {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(AtomicError::EngineCommand {
                command: self.describe(args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn json<I, S>(&self, args: I) -> Result<Value>
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<OsStr>,
    {
        let stdout = self.output(args)?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    fn inspect_kind(&self, kind: ObjectKind, id: &str) -> Result<Value> {
        let noun = match kind {
            ObjectKind::Image => "image",
            ObjectKind::Container => "container",
        };
        let value = match self.json([noun, "inspect", id]) {
            Ok(value) => value,
            Err(AtomicError::EngineCommand { stderr, .. })
                if stderr.to_ascii_lowercase().contains("no such") =>
            {
                return Err(AtomicError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e),
        };
        // inspect always returns an array, one entry per argument
        match value {
            Value::Array(mut items) if !items.is_empty() => Ok(items.swap_remove(0)),
            _ => Err(AtomicError::NotFound(id.to_string())),
        }
    }

    /// Release podman's own mount of an object.
    fn release(&self, kind: ObjectKind, id: &str) {
        let result = match kind {
            ObjectKind::Image => self.output(["image", "unmount", id]),
            ObjectKind::Container => self.output(["unmount", id]),
        };
        match result {
            Ok(_) => tracing::debug!("released {} {}", kind, super::truncate_id(id)),
            Err(e) => tracing::warn!("failed to release {} {}: {}", kind, super::truncate_id(id), e),
        }
    }

    /// Account for one unmount at `mountpoint`, releasing podman's mount
    /// once the bottom of the stack is gone.
    fn forget_mount(&self, mountpoint: &Path) -> Result<()> {
        if let Some(record) = self.mounts.pop(mountpoint)? {
            self.release(record.kind, &record.id);
        }
        Ok(())
    }
}

/// First list of strings found under any of `keys`.
fn string_list(entry: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| entry.get(*key).and_then(Value::as_array))
        .next()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn object_id(entry: &Value) -> Option<&str> {
    entry
        .get("Id")
        .or_else(|| entry.get("ID"))
        .and_then(Value::as_str)
}

/// Parse `podman images --format json` output.
fn parse_images(value: &Value) -> Vec<ObjectRef> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let id = object_id(entry)?;
                    Some(ObjectRef::image(id, string_list(entry, &["Names", "RepoTags"])))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `podman ps --format json` output.
fn parse_containers(value: &Value) -> Vec<ObjectRef> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let id = object_id(entry)?;
                    Some(ObjectRef::container(id, string_list(entry, &["Names"])))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Storage driver from `podman info` (or docker-style `Driver`).
fn parse_driver(info: &Value) -> String {
    info.pointer("/store/graphDriverName")
        .or_else(|| info.get("Driver"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn is_not_mounted(errno: rustix::io::Errno) -> bool {
    errno == rustix::io::Errno::INVAL || errno == rustix::io::Errno::NOENT
}

impl Engine for PodmanEngine {
    fn ping(&self) -> Result<()> {
        match self.output(["version", "--format", "json"]) {
            Ok(_) => Ok(()),
            Err(AtomicError::EngineCommand { stderr, .. }) => {
                Err(AtomicError::EngineUnavailable(stderr))
            }
            Err(e) => Err(e),
        }
    }

    fn info(&self) -> Result<EngineInfo> {
        let raw = self.json(["info", "--format", "json"])?;
        Ok(EngineInfo {
            driver: parse_driver(&raw),
            raw,
        })
    }

    fn list_images(&self, all: bool) -> Result<Vec<ObjectRef>> {
        let mut args = vec!["images", "--format", "json"];
        if all {
            args.push("--all");
        }
        Ok(parse_images(&self.json(args)?))
    }

    fn list_containers(&self, all: bool) -> Result<Vec<ObjectRef>> {
        let mut args = vec!["ps", "--format", "json"];
        if all {
            args.push("--all");
        }
        Ok(parse_containers(&self.json(args)?))
    }

    fn inspect_image(&self, id: &str) -> Result<Value> {
        self.inspect_kind(ObjectKind::Image, id)
    }

    fn inspect_container(&self, id: &str) -> Result<Value> {
        self.inspect_kind(ObjectKind::Container, id)
    }

    fn mount(&self, target: &ObjectRef, mountpoint: &Path, options: &MountOptions) -> Result<()> {
        let stdout = match target.kind {
            ObjectKind::Image => self.output(["image", "mount", target.id.as_str()])?,
            ObjectKind::Container => self.output(["mount", target.id.as_str()])?,
        };
        let source = PathBuf::from(String::from_utf8_lossy(&stdout).trim());
        tracing::debug!(
            "{} {} is mounted at {}",
            target.kind,
            target.short_id(),
            source.display()
        );

        if let Err(e) = mount_bind(&source, mountpoint) {
            self.release(target.kind, &target.id);
            return Err(std::io::Error::from(e).into());
        }
        if let Err(e) = self.mounts.insert(mountpoint, target) {
            if let Err(cleanup) = unmount(mountpoint, UnmountFlags::empty()) {
                tracing::warn!("unable to unmount {}: {}", mountpoint.display(), cleanup);
            }
            self.release(target.kind, &target.id);
            return Err(e);
        }

        let mut flags = MountFlags::BIND;
        if options.read_only {
            flags |= MountFlags::RDONLY;
        }
        if let Err(e) = mount_remount(mountpoint, flags, options.extra.join(",").as_str()) {
            if let Err(cleanup) = self.unmount(mountpoint) {
                tracing::warn!("unable to unmount {}: {}", mountpoint.display(), cleanup);
            }
            return Err(std::io::Error::from(e).into());
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<bool> {
        match unmount(mountpoint, UnmountFlags::empty()) {
            Ok(()) => {}
            Err(e) if is_not_mounted(e) => return Ok(false),
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
        self.forget_mount(mountpoint)?;
        Ok(true)
    }

    fn bind_mount(&self, source: &Path, mountpoint: &Path) -> Result<()> {
        mount_bind(source, mountpoint).map_err(std::io::Error::from)?;
        if let Err(e) = self.mounts.push(mountpoint) {
            if let Err(cleanup) = unmount(mountpoint, UnmountFlags::empty()) {
                tracing::warn!("unable to unmount {}: {}", mountpoint.display(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn stop(&self, target: &ObjectRef) -> Result<()> {
        self.output(["stop", target.id.as_str()])?;
        Ok(())
    }

    fn remove(&self, target: &ObjectRef, force: bool) -> Result<()> {
        let verb = match target.kind {
            ObjectKind::Image => "rmi",
            ObjectKind::Container => "rm",
        };
        let mut args = vec![verb];
        if force {
            args.push("--force");
        }
        args.push(target.id.as_str());
        self.output(args)?;
        Ok(())
    }

    fn run_scanner(&self, invocation: &ScanInvocation) -> Result<Option<i32>> {
        let args = invocation.run_args();
        tracing::info!("{}", self.describe(&args));
        let status = Command::new(&self.binary)
            .args(&args)
            .status()
            .map_err(|e| {
                AtomicError::EngineUnavailable(format!(
                    "failed to execute {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A stand-in `podman` that appends its arguments to `podman.log` and
    /// claims every object is mounted at a path that does not exist.
    fn stub_podman(dir: &Path) -> (PathBuf, PathBuf) {
        let binary = dir.join("podman");
        let log = dir.join("podman.log");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\necho /nonexistent/merged\n",
            log.display()
        );
        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        (binary, log)
    }

    fn calls(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_images() {
        let value = json!([
            {"Id": "abc123", "Names": ["docker.io/library/nginx:latest"]},
            {"Id": "sha256:def456", "RepoTags": ["localhost/app:1"]},
            {"Id": "dangling", "Names": null},
            {"NoId": true}
        ]);
        let images = parse_images(&value);
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].repo_tags, ["docker.io/library/nginx:latest"]);
        assert_eq!(images[1].id, "def456");
        assert_eq!(images[1].repo_tags, ["localhost/app:1"]);
        assert!(images[2].repo_tags.is_empty());
        assert!(images.iter().all(ObjectRef::is_image));
    }

    #[test]
    fn test_parse_containers() {
        let value = json!([{"Id": "c1", "Names": ["web"], "Image": "nginx"}]);
        let containers = parse_containers(&value);
        assert_eq!(containers.len(), 1);
        assert!(containers[0].is_container());
        assert_eq!(containers[0].names, ["web"]);
    }

    #[test]
    fn test_parse_driver() {
        assert_eq!(
            parse_driver(&json!({"store": {"graphDriverName": "overlay"}})),
            "overlay"
        );
        assert_eq!(parse_driver(&json!({"Driver": "devicemapper"})), "devicemapper");
        assert_eq!(parse_driver(&json!({})), "");
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let engine = PodmanEngine::new("/nonexistent/podman");
        assert!(matches!(
            engine.ping(),
            Err(AtomicError::EngineUnavailable(_))
        ));
    }

    #[test]
    fn test_unmount_unmounted_path_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = PodmanEngine::new("podman");
        // EINVAL (not a mountpoint) as root, EPERM otherwise
        match engine.unmount(dir.path()) {
            Ok(mounted) => assert!(!mounted),
            Err(AtomicError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied)
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_failed_bind_releases_engine_mount() {
        let dir = TempDir::new().unwrap();
        let (binary, log) = stub_podman(dir.path());
        let engine = PodmanEngine::new(binary).with_state_dir(dir.path().join("state"));

        let image = ObjectRef::image("abc123", ["x:latest"]);
        let missing = dir.path().join("missing");
        assert!(engine.mount(&image, &missing, &MountOptions::default()).is_err());

        assert_eq!(calls(&log), ["image mount abc123", "image unmount abc123"]);
        assert_eq!(engine.mounts.pop(&missing).unwrap(), None);
    }

    #[test]
    fn test_failed_container_bind_releases_engine_mount() {
        let dir = TempDir::new().unwrap();
        let (binary, log) = stub_podman(dir.path());
        let engine = PodmanEngine::new(binary).with_state_dir(dir.path().join("state"));

        let container = ObjectRef::container("c0ffee", ["web"]);
        assert!(engine
            .mount(&container, &dir.path().join("missing"), &MountOptions::default())
            .is_err());
        assert_eq!(calls(&log), ["mount c0ffee", "unmount c0ffee"]);
    }

    #[test]
    fn test_release_in_later_process() {
        let dir = TempDir::new().unwrap();
        let (binary, log) = stub_podman(dir.path());
        let state = dir.path().join("state");
        let mountpoint = dir.path().join("mnt");
        std::fs::create_dir(&mountpoint).unwrap();

        // The mounting process records the image and a rootfs bind on top.
        {
            let mounting = PodmanEngine::new(&binary).with_state_dir(&state);
            mounting
                .mounts
                .insert(&mountpoint, &ObjectRef::image("abc123", ["x:latest"]))
                .unwrap();
            mounting.mounts.push(&mountpoint).unwrap();
        }

        // A fresh instance has nothing in memory and still finds it.
        let unmounting = PodmanEngine::new(&binary).with_state_dir(&state);
        unmounting.forget_mount(&mountpoint).unwrap();
        assert!(calls(&log).is_empty());
        unmounting.forget_mount(&mountpoint).unwrap();
        assert_eq!(calls(&log), ["image unmount abc123"]);

        // Nothing left to release.
        unmounting.forget_mount(&mountpoint).unwrap();
        assert_eq!(calls(&log).len(), 1);
    }
}
