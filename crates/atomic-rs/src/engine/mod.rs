//! Container engine capability interface.
//!
//! Everything in this crate that needs the container engine takes a
//! `&dyn Engine`. Two implementations are provided:
//!
//! - [`PodmanEngine`](podman::PodmanEngine) drives the `podman` CLI and
//!   performs the host-side bind mounts used for staging.
//! - [`FakeEngine`](fake::FakeEngine) keeps images, containers and mounts in
//!   memory and is used by the test suites.
//!
//! The data returned by an engine is a snapshot: [`ObjectRef`] values are
//! plain data and never refresh themselves.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod fake;
pub mod podman;
mod registry;

/// Storage driver that exposes an image's filesystem under a `rootfs` subpath.
pub const DEVICEMAPPER_DRIVER: &str = "devicemapper";

/// Tag placeholder reported by engines for untagged images.
pub const NONE_TAG: &str = "<none>";

/// Whether an object is an image or a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Image,
    Container,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Image => f.write_str("image"),
            ObjectKind::Container => f.write_str("container"),
        }
    }
}

/// An image or container as listed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    /// Full object ID, without any `sha256:` prefix.
    pub id: String,
    /// Image or container.
    pub kind: ObjectKind,
    /// `repo:tag` names, in engine order (images only).
    pub repo_tags: Vec<String>,
    /// Container names, in engine order (containers only).
    pub names: Vec<String>,
}

impl ObjectRef {
    /// Create an image reference.
    pub fn image<I, S>(id: &str, repo_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: normalize_id(id).to_string(),
            kind: ObjectKind::Image,
            repo_tags: repo_tags.into_iter().map(Into::into).collect(),
            names: Vec::new(),
        }
    }

    /// Create a container reference.
    pub fn container<I, S>(id: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: normalize_id(id).to_string(),
            kind: ObjectKind::Container,
            repo_tags: Vec::new(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == ObjectKind::Image
    }

    pub fn is_container(&self) -> bool {
        self.kind == ObjectKind::Container
    }

    /// Truncated ID for display.
    pub fn short_id(&self) -> &str {
        truncate_id(&self.id)
    }

    /// Whether this image has at least one real `repo:tag`.
    pub fn has_tags(&self) -> bool {
        self.repo_tags
            .first()
            .is_some_and(|tag| !tag.contains(NONE_TAG))
    }
}

/// Strip a leading `sha256:` digest algorithm from an object ID.
pub fn normalize_id(id: &str) -> &str {
    id.strip_prefix("sha256:").unwrap_or(id)
}

/// Truncate an ID to 12 characters for display.
///
/// # Examples
///
/// ```
/// use atomic_rs::engine::truncate_id;
///
/// assert_eq!(truncate_id("abc123def456789"), "abc123def456");
/// assert_eq!(truncate_id("short"), "short");
/// ```
pub fn truncate_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Global engine information.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    /// Storage driver name (e.g. `overlay`, `devicemapper`).
    pub driver: String,
    /// The engine's complete info document.
    pub raw: serde_json::Value,
}

impl EngineInfo {
    /// Whether mounts on this driver need an extra bind of the `rootfs` subpath.
    pub fn needs_rootfs_bind(&self) -> bool {
        self.driver == DEVICEMAPPER_DRIVER
    }
}

/// Options for mounting an object's root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Mount read-only.
    pub read_only: bool,
    /// Options passed through to the mount as-is.
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            extra: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated option list such as `ro,nodev`.
    ///
    /// `ro` and `rw` select the access mode (read-only unless `rw` is the
    /// last one given); everything else is passed through.
    pub fn parse(options: &str) -> Self {
        let mut parsed = Self::default();
        for opt in options.split(',').filter(|o| !o.is_empty()) {
            match opt {
                "ro" => parsed.read_only = true,
                "rw" => parsed.read_only = false,
                other => parsed.extra.push(other.to_string()),
            }
        }
        parsed
    }
}

/// A single external scanner run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanInvocation {
    /// Staging root, exposed to the scanner read-only at `/scanin`.
    pub input_dir: PathBuf,
    /// Results directory, exposed writable at `/scanout`.
    pub output_dir: PathBuf,
    /// Extra engine arguments from configuration.
    pub engine_args: Vec<String>,
    /// Scanner image.
    pub image: String,
    /// Arguments for the scanner image.
    pub args: Vec<String>,
}

impl ScanInvocation {
    /// Mount point of the staging root inside the scanner.
    pub const INPUT_MOUNT: &'static str = "/scanin";
    /// Mount point of the results directory inside the scanner.
    pub const OUTPUT_MOUNT: &'static str = "/scanout";

    /// Engine arguments following the `run` verb.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            "/etc/localtime:/etc/localtime:ro".to_string(),
            "-v".to_string(),
            format!("{}:{}:ro", self.input_dir.display(), Self::INPUT_MOUNT),
            "-v".to_string(),
            format!("{}:{}", self.output_dir.display(), Self::OUTPUT_MOUNT),
        ];
        args.extend(self.engine_args.iter().cloned());
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Capabilities the core needs from a container engine.
pub trait Engine: fmt::Debug {
    /// Check that the engine is reachable.
    ///
    /// Fails with [`AtomicError::EngineUnavailable`](crate::AtomicError::EngineUnavailable).
    fn ping(&self) -> Result<()>;

    /// Global engine information.
    fn info(&self) -> Result<EngineInfo>;

    /// List images; `all` includes intermediate images.
    fn list_images(&self, all: bool) -> Result<Vec<ObjectRef>>;

    /// List containers; `all` includes stopped containers.
    fn list_containers(&self, all: bool) -> Result<Vec<ObjectRef>>;

    /// Full inspect document for an image, or `NotFound`.
    fn inspect_image(&self, id: &str) -> Result<serde_json::Value>;

    /// Full inspect document for a container, or `NotFound`.
    fn inspect_container(&self, id: &str) -> Result<serde_json::Value>;

    /// Mount the root filesystem of `target` at `mountpoint`.
    fn mount(&self, target: &ObjectRef, mountpoint: &Path, options: &MountOptions) -> Result<()>;

    /// Unmount whatever is mounted at `mountpoint`.
    ///
    /// Returns `false` when nothing was mounted there.
    fn unmount(&self, mountpoint: &Path) -> Result<bool>;

    /// Bind-mount `source` over `mountpoint`.
    fn bind_mount(&self, source: &Path, mountpoint: &Path) -> Result<()>;

    /// Stop a running container.
    fn stop(&self, target: &ObjectRef) -> Result<()>;

    /// Remove an image or container.
    fn remove(&self, target: &ObjectRef, force: bool) -> Result<()>;

    /// Run the scanner synchronously and return its exit code
    /// (`None` when it was killed by a signal).
    fn run_scanner(&self, invocation: &ScanInvocation) -> Result<Option<i32>>;

    /// Inspect either kind of object.
    fn inspect(&self, target: &ObjectRef) -> Result<serde_json::Value> {
        match target.kind {
            ObjectKind::Image => self.inspect_image(&target.id),
            ObjectKind::Container => self.inspect_container(&target.id),
        }
    }
}

/// Labels from an inspect document's `Config.Labels`.
pub fn labels_of(inspect: &serde_json::Value) -> std::collections::BTreeMap<String, String> {
    inspect
        .pointer("/Config/Labels")
        .and_then(|labels| labels.as_object())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
