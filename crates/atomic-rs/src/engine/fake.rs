//! In-memory engine for tests.
//!
//! [`FakeEngine`] holds images and containers in memory. Mounts are real
//! directories on disk: mounting writes a marker file into the mountpoint and
//! unmounting removes it, so callers that delete mountpoints with a
//! non-recursive remove behave exactly as they would against a real engine.
//!
//! # Example
//!
//! ```
//! use atomic_rs::engine::Engine;
//! use atomic_rs::engine::fake::FakeEngine;
//!
//! let engine = FakeEngine::new()
//!     .with_image("abc123", &["nginx:latest"])
//!     .with_container("fff999", &["web"]);
//! assert_eq!(engine.list_images(false)?.len(), 1);
//! # Ok::<(), atomic_rs::AtomicError>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Value, json};

use super::{Engine, EngineInfo, MountOptions, ObjectKind, ObjectRef, ScanInvocation};
use crate::error::{AtomicError, Result};

/// Marker file written into every fake mountpoint.
pub const MOUNT_MARKER: &str = ".fake-rootfs";

type ScanHook = Box<dyn Fn(&ScanInvocation) -> Option<i32> + Send>;

/// One staged mount as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    /// Object ID, or `None` for a bind mount.
    pub object_id: Option<String>,
    pub options: Option<MountOptions>,
}

#[derive(Default)]
struct State {
    images: Vec<(ObjectRef, Value)>,
    containers: Vec<(ObjectRef, Value)>,
    driver: String,
    unreachable: bool,
    failing_mounts: BTreeSet<String>,
    failing_binds: bool,
    mounts: BTreeMap<PathBuf, Vec<FakeMount>>,
    invocations: Vec<ScanInvocation>,
    stopped: Vec<String>,
    removed: Vec<String>,
    scan_hook: Option<ScanHook>,
}

/// An engine that keeps everything in memory.
pub struct FakeEngine {
    state: Mutex<State>,
}

impl std::fmt::Debug for FakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("FakeEngine")
            .field("images", &state.images.len())
            .field("containers", &state.containers.len())
            .field("mounts", &state.mounts.len())
            .finish()
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// Create an empty, reachable engine using the `overlay` driver.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                driver: "overlay".to_string(),
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an image with the given `repo:tag` names.
    pub fn with_image(self, id: &str, repo_tags: &[&str]) -> Self {
        self.with_labeled_image(id, repo_tags, &[])
    }

    /// Add an image carrying `Config.Labels`.
    pub fn with_labeled_image(self, id: &str, repo_tags: &[&str], labels: &[(&str, &str)]) -> Self {
        let object = ObjectRef::image(id, repo_tags.iter().copied());
        let labels: serde_json::Map<String, Value> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        let inspect = json!({
            "Id": object.id,
            "RepoTags": object.repo_tags,
            "Config": { "Labels": labels, "Cmd": ["/bin/sh"] },
        });
        self.state().images.push((object, inspect));
        self
    }

    /// Add a container with the given names.
    pub fn with_container(self, id: &str, names: &[&str]) -> Self {
        self.with_container_of(id, names, "")
    }

    /// Add a stopped container created from `image`.
    ///
    /// When `image` is the exact `repo:tag` of an image already added, the
    /// container records that image's ID and inherits its labels.
    pub fn with_container_of(self, id: &str, names: &[&str], image: &str) -> Self {
        let object = ObjectRef::container(id, names.iter().copied());
        let mut state = self.state();
        let source = state
            .images
            .iter()
            .find(|(o, _)| o.repo_tags.iter().any(|t| t == image));
        let mut inspect = json!({
            "Id": object.id,
            "Names": object.names,
            "ImageName": image,
            "State": { "Running": false },
            "Config": {
                "Labels": source.and_then(|(_, i)| i.pointer("/Config/Labels").cloned()),
                "Cmd": ["/bin/sh"],
                "AttachStdin": false,
                "AttachStdout": false,
                "AttachStderr": false,
            },
        });
        if let Some((image, _)) = source {
            inspect["Image"] = Value::String(image.id.clone());
        }
        state.containers.push((object, inspect));
        drop(state);
        self
    }

    fn update_container(&self, id: &str, f: impl FnOnce(&mut Value)) {
        if let Some((_, inspect)) = self.state().containers.iter_mut().find(|(o, _)| o.id == id) {
            f(inspect);
        }
    }

    /// Mark a container as running.
    pub fn running(self, id: &str) -> Self {
        self.update_container(id, |inspect| inspect["State"]["Running"] = Value::Bool(true));
        self
    }

    /// Mark a container as created with stdin, stdout and stderr attached.
    pub fn interactive(self, id: &str) -> Self {
        self.update_container(id, |inspect| {
            for key in ["AttachStdin", "AttachStdout", "AttachStderr"] {
                inspect["Config"][key] = Value::Bool(true);
            }
        });
        self
    }

    /// Record `parent` as the parent layer of image `id`.
    pub fn with_parent(self, id: &str, parent: &str) -> Self {
        if let Some((_, inspect)) = self.state().images.iter_mut().find(|(o, _)| o.id == id) {
            inspect["Parent"] = Value::String(parent.to_string());
        }
        self
    }

    /// Report the given storage driver from [`Engine::info`].
    pub fn with_driver(self, driver: &str) -> Self {
        self.state().driver = driver.to_string();
        self
    }

    /// Make every call fail with `EngineUnavailable`.
    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    /// Make mounting the given object fail.
    pub fn fail_mount(self, id: &str) -> Self {
        self.state().failing_mounts.insert(id.to_string());
        self
    }

    /// Make every bind mount fail.
    pub fn fail_bind(self) -> Self {
        self.state().failing_binds = true;
        self
    }

    /// Run `hook` in place of the scanner; its return value is the exit code.
    ///
    /// Without a hook the scanner exits 0 and writes nothing.
    pub fn on_scan<F>(self, hook: F) -> Self
    where
        F: Fn(&ScanInvocation) -> Option<i32> + Send + 'static,
    {
        self.state().scan_hook = Some(Box::new(hook));
        self
    }

    /// Paths currently mounted, with the number of stacked mounts on each.
    pub fn mounted(&self) -> BTreeMap<PathBuf, usize> {
        self.state()
            .mounts
            .iter()
            .map(|(path, stack)| (path.clone(), stack.len()))
            .collect()
    }

    /// The mount stack at `path`, bottom first.
    pub fn mounts_at(&self, path: &Path) -> Vec<FakeMount> {
        self.state().mounts.get(path).cloned().unwrap_or_default()
    }

    /// Every scanner invocation so far.
    pub fn invocations(&self) -> Vec<ScanInvocation> {
        self.state().invocations.clone()
    }

    /// Containers stopped so far, in order.
    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    /// IDs removed so far, in order.
    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state().unreachable {
            return Err(AtomicError::EngineUnavailable(
                "fake engine is unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn inspect_kind(&self, kind: ObjectKind, id: &str) -> Result<Value> {
        self.check_reachable()?;
        let state = self.state();
        let objects = match kind {
            ObjectKind::Image => &state.images,
            ObjectKind::Container => &state.containers,
        };
        objects
            .iter()
            .find(|(object, _)| object.id == id)
            .map(|(_, inspect)| inspect.clone())
            .ok_or_else(|| AtomicError::NotFound(id.to_string()))
    }
}

impl Engine for FakeEngine {
    fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    fn info(&self) -> Result<EngineInfo> {
        self.check_reachable()?;
        let driver = self.state().driver.clone();
        Ok(EngineInfo {
            raw: json!({ "Driver": driver, "Name": "fake" }),
            driver,
        })
    }

    fn list_images(&self, _all: bool) -> Result<Vec<ObjectRef>> {
        self.check_reachable()?;
        Ok(self.state().images.iter().map(|(o, _)| o.clone()).collect())
    }

    fn list_containers(&self, _all: bool) -> Result<Vec<ObjectRef>> {
        self.check_reachable()?;
        Ok(self
            .state()
            .containers
            .iter()
            .map(|(o, _)| o.clone())
            .collect())
    }

    fn inspect_image(&self, id: &str) -> Result<Value> {
        self.inspect_kind(ObjectKind::Image, id)
    }

    fn inspect_container(&self, id: &str) -> Result<Value> {
        self.inspect_kind(ObjectKind::Container, id)
    }

    fn mount(&self, target: &ObjectRef, mountpoint: &Path, options: &MountOptions) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state();
        if state.failing_mounts.contains(&target.id) {
            return Err(AtomicError::EngineCommand {
                command: format!("mount {}", target.id),
                stderr: "simulated mount failure".to_string(),
            });
        }
        if !mountpoint.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("mountpoint {} does not exist", mountpoint.display()),
            )
            .into());
        }
        std::fs::write(mountpoint.join(MOUNT_MARKER), &target.id)?;
        state
            .mounts
            .entry(mountpoint.to_path_buf())
            .or_default()
            .push(FakeMount {
                object_id: Some(target.id.clone()),
                options: Some(options.clone()),
            });
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<bool> {
        let mut state = self.state();
        let Some(stack) = state.mounts.get_mut(mountpoint) else {
            return Ok(false);
        };
        stack.pop();
        if stack.is_empty() {
            state.mounts.remove(mountpoint);
            match std::fs::remove_file(mountpoint.join(MOUNT_MARKER)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn bind_mount(&self, source: &Path, mountpoint: &Path) -> Result<()> {
        tracing::debug!("fake bind {} -> {}", source.display(), mountpoint.display());
        let mut state = self.state();
        if state.failing_binds {
            return Err(AtomicError::EngineCommand {
                command: format!("bind {}", source.display()),
                stderr: "simulated bind failure".to_string(),
            });
        }
        state
            .mounts
            .entry(mountpoint.to_path_buf())
            .or_default()
            .push(FakeMount {
                object_id: None,
                options: None,
            });
        Ok(())
    }

    fn stop(&self, target: &ObjectRef) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state();
        let (_, inspect) = state
            .containers
            .iter_mut()
            .find(|(o, _)| o.id == target.id)
            .ok_or_else(|| AtomicError::NotFound(target.id.clone()))?;
        inspect["State"]["Running"] = Value::Bool(false);
        state.stopped.push(target.id.clone());
        Ok(())
    }

    fn remove(&self, target: &ObjectRef, _force: bool) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state();
        let objects = match target.kind {
            ObjectKind::Image => &mut state.images,
            ObjectKind::Container => &mut state.containers,
        };
        let before = objects.len();
        objects.retain(|(o, _)| o.id != target.id);
        if objects.len() == before {
            return Err(AtomicError::NotFound(target.id.clone()));
        }
        state.removed.push(target.id.clone());
        Ok(())
    }

    fn run_scanner(&self, invocation: &ScanInvocation) -> Result<Option<i32>> {
        self.check_reachable()?;
        let mut state = self.state();
        state.invocations.push(invocation.clone());
        let code = match &state.scan_hook {
            Some(hook) => hook(invocation),
            None => Some(0),
        };
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mount_and_unmount_marker() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new().with_image("abc123", &["nginx:latest"]);
        let image = engine.list_images(false).unwrap().remove(0);

        engine
            .mount(&image, dir.path(), &MountOptions::default())
            .unwrap();
        assert!(dir.path().join(MOUNT_MARKER).exists());
        assert_eq!(engine.mounted().len(), 1);

        assert!(engine.unmount(dir.path()).unwrap());
        assert!(!dir.path().join(MOUNT_MARKER).exists());
        assert!(!engine.unmount(dir.path()).unwrap());
    }

    #[test]
    fn test_unreachable() {
        let engine = FakeEngine::new().unreachable();
        assert!(matches!(
            engine.ping(),
            Err(AtomicError::EngineUnavailable(_))
        ));
        assert!(engine.list_images(false).is_err());
    }

    #[test]
    fn test_inspect_missing_is_not_found() {
        let engine = FakeEngine::new();
        assert!(matches!(
            engine.inspect_image("nope"),
            Err(AtomicError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_records_id() {
        let engine = FakeEngine::new().with_container("c1", &["web"]);
        let container = engine.list_containers(true).unwrap().remove(0);
        engine.remove(&container, true).unwrap();
        assert_eq!(engine.removed(), ["c1"]);
        assert!(engine.list_containers(true).unwrap().is_empty());
        assert!(engine.remove(&container, true).is_err());
    }

    #[test]
    fn test_container_inherits_image() {
        let engine = FakeEngine::new()
            .with_labeled_image("abc123", &["rsyslog:latest"], &[("STOP", "kill NAME")])
            .with_container_of("c1", &["logger"], "rsyslog:latest")
            .with_container_of("c2", &["orphan"], "gone:latest")
            .running("c1");

        let inspect = engine.inspect_container("c1").unwrap();
        assert_eq!(inspect["Image"], "abc123");
        assert_eq!(inspect["Config"]["Labels"]["STOP"], "kill NAME");
        assert_eq!(inspect["State"]["Running"], true);
        assert!(engine.inspect_container("c2").unwrap().get("Image").is_none());

        let container = engine.list_containers(true).unwrap().remove(0);
        engine.stop(&container).unwrap();
        assert_eq!(engine.stopped(), ["c1"]);
        assert_eq!(engine.inspect_container("c1").unwrap()["State"]["Running"], false);
    }
}
