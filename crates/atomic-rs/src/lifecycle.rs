//! Label-driven install, run, stop and uninstall.
//!
//! Images describe how they want to be installed, run, stopped and
//! uninstalled through the `INSTALL`, `RUN`, `STOP` and `UNINSTALL` labels.
//! Each label holds a command line using the placeholders `IMAGE` and `NAME`:
//!
//! ```text
//! LABEL INSTALL="podman run --rm --privileged -v /:/host -e NAME=NAME IMAGE /bin/install.sh"
//! ```
//!
//! This module turns a label (or a built-in default when the label is
//! absent) into a [`LabelCommand`]: a concrete argument vector plus the
//! environment it should run with. Placeholders are substituted per
//! argument; nothing is ever passed through a shell.
//!
//! `run` and `stop` act on an existing container named `NAME` when there is
//! one: a running container gets an `exec`, a stopped one is started again.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use serde::Serialize;
use serde_json::Value;

use crate::engine::{Engine, ObjectRef, labels_of, normalize_id};
use crate::error::{AtomicError, Result};
use crate::ledger::{Ledger, check_install};
use crate::resolve::resolve;
use crate::snapshot::Snapshot;

/// Placeholder for the image reference.
pub const IMAGE_PLACEHOLDER: &str = "IMAGE";
/// Placeholder for the container name.
pub const NAME_PLACEHOLDER: &str = "NAME";

/// Install an image: a privileged container with the host mounted at `/host`.
pub const INSTALL_ARGS: &[&str] = &[
    "run",
    "-t",
    "-i",
    "--rm",
    "--privileged",
    "-v",
    "/:/host",
    "--net=host",
    "--ipc=host",
    "--pid=host",
    "-e",
    "HOST=/host",
    "-e",
    "NAME=${NAME}",
    "-e",
    "IMAGE=${IMAGE}",
    "-e",
    "CONFDIR=/host/etc/${NAME}",
    "-e",
    "LOGDIR=/host/var/log/${NAME}",
    "-e",
    "DATADIR=/host/var/lib/${NAME}",
    "--name",
    "${NAME}",
    "${IMAGE}",
];

/// Super-privileged container sharing the host's namespaces.
pub const SPC_ARGS: &[&str] = &[
    "run",
    "-t",
    "-i",
    "--rm",
    "--privileged",
    "-v",
    "/:/host",
    "-v",
    "/run:/run",
    "-v",
    "/etc/localtime:/etc/localtime",
    "--net=host",
    "--ipc=host",
    "--pid=host",
    "-e",
    "HOST=/host",
    "-e",
    "NAME=${NAME}",
    "-e",
    "IMAGE=${IMAGE}",
    "${IMAGE}",
];

/// Plain named container.
pub const RUN_ARGS: &[&str] = &["run", "-t", "-i", "--name", "${NAME}", "${IMAGE}"];

/// Run a command in an existing container.
pub const EXEC_ARGS: &[&str] = &["exec", "-t", "-i", "${NAME}"];

/// Start an existing container in the background.
pub const START_ARGS: &[&str] = &["start", "${NAME}"];

/// Start an existing interactive container attached to the terminal.
pub const START_ATTACHED_ARGS: &[&str] = &["start", "-i", "-a", "${NAME}"];

/// Command used when an image has no `Cmd`.
const DEFAULT_CMD: &str = "/bin/sh";

/// An argument vector with `IMAGE`/`NAME` placeholders.
///
/// # Examples
///
/// ```
/// use atomic_rs::lifecycle::CommandTemplate;
///
/// let template = CommandTemplate::from_label("podman run -e NAME=NAME --name NAME IMAGE");
/// assert_eq!(
///     template.substitute("rsyslog:latest", "rsyslog"),
///     ["podman", "run", "-e", "NAME=rsyslog", "--name", "rsyslog", "rsyslog:latest"]
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandTemplate {
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a label value on whitespace.
    pub fn from_label(value: &str) -> Self {
        Self::new(value.split_whitespace())
    }

    /// A built-in template run with `binary`.
    pub fn builtin(binary: &Path, args: &[&str]) -> Self {
        let mut template = Self::new([binary.display().to_string()]);
        template.extend(args.iter().copied());
        template
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn extend<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    /// Replace placeholders argument by argument.
    ///
    /// An argument that is exactly `IMAGE` or `NAME` becomes the value,
    /// `IMAGE=IMAGE` and `NAME=NAME` keep their key, and `${IMAGE}` and
    /// `${NAME}` are replaced anywhere inside an argument.
    pub fn substitute(&self, image: &str, name: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                IMAGE_PLACEHOLDER => image.to_string(),
                NAME_PLACEHOLDER => name.to_string(),
                "IMAGE=IMAGE" => format!("IMAGE={image}"),
                "NAME=NAME" => format!("NAME={name}"),
                other => other.replace("${IMAGE}", image).replace("${NAME}", name),
            })
            .collect()
    }
}

/// A fully substituted command ready to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelCommand {
    pub argv: Vec<String>,
    /// Variables added to the caller's environment.
    pub env: BTreeMap<String, String>,
}

impl LabelCommand {
    /// A [`Command`] for this argv, or `None` when it is empty.
    pub fn command(&self) -> Option<Command> {
        let (program, args) = self.argv.split_first()?;
        let mut command = Command::new(program);
        command.args(args).envs(&self.env);
        Some(command)
    }
}

impl std::fmt::Display for LabelCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// A container that already carries the requested name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExistingContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Created from a different image than the one the image name resolves
    /// to now.
    pub outdated: bool,
}

/// Commands planned by [`Lifecycle::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    /// Commands to execute in order. Empty when the container is already
    /// running and there is nothing to execute in it.
    pub commands: Vec<LabelCommand>,
    pub existing: Option<ExistingContainer>,
}

/// Work planned by [`Lifecycle::uninstall`], finished by
/// [`Lifecycle::complete_uninstall`] once `command` has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UninstallPlan {
    pub image: ObjectRef,
    /// The image's `UNINSTALL` command, if it declares one.
    pub command: Option<LabelCommand>,
    /// Remove the image itself (the container name equals the image name).
    pub remove_image: bool,
}

/// Work planned by [`Lifecycle::stop`], finished by
/// [`Lifecycle::complete_stop`] once `command` has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopPlan {
    /// The `STOP` label command, if declared.
    pub command: Option<LabelCommand>,
    /// Running container to stop afterwards.
    pub running: Option<ObjectRef>,
}

/// Version of one image layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerVersion {
    pub id: String,
    /// `Name-Version-Release` from the layer's labels, without dangling
    /// dashes; empty when none of them are set.
    pub version: String,
    /// First `repo:tag` of the layer, if it is tagged.
    pub tag: Option<String>,
}

/// A layer for which a local image with the same `Name` label has a newer
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedLayer {
    pub layer: LayerVersion,
    /// ID of the newest local image with the layer's name.
    pub available_id: String,
    pub available: String,
}

/// Look up a label as given, lowercase, capitalized or uppercase.
pub fn find_label<'l>(labels: &'l BTreeMap<String, String>, label: &str) -> Option<&'l str> {
    let mut chars = label.chars();
    let capitalized: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    [
        label.to_string(),
        label.to_lowercase(),
        capitalized,
        label.to_uppercase(),
    ]
    .iter()
    .find_map(|candidate| labels.get(candidate))
    .map(String::as_str)
}

/// Container name derived from an image reference: the last path
/// component without its tag, suffixed `-spc` for super-privileged runs.
///
/// # Examples
///
/// ```
/// use atomic_rs::lifecycle::default_name;
///
/// assert_eq!(default_name("registry.example.com/rhel7/rsyslog:7.2", false), "rsyslog");
/// assert_eq!(default_name("fedora", true), "fedora-spc");
/// ```
pub fn default_name(image: &str, spc: bool) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    let base = last.split(':').next().unwrap_or(last);
    if spc {
        format!("{base}-spc")
    } else {
        base.to_string()
    }
}

/// The image's parent layer, if any.
fn parent_of(inspect: &Value) -> Option<String> {
    inspect
        .get("Parent")
        .and_then(Value::as_str)
        .filter(|parent| !parent.is_empty())
        .map(|parent| normalize_id(parent).to_string())
}

fn config_cmd(inspect: &Value) -> Vec<String> {
    inspect
        .pointer("/Config/Cmd")
        .and_then(Value::as_array)
        .map(|cmd| {
            cmd.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .filter(|cmd| !cmd.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_CMD.to_string()])
}

/// `Name-Version-Release`, trimmed of leading and trailing dashes.
fn nvr(labels: &BTreeMap<String, String>) -> String {
    let part = |label: &str| find_label(labels, label).unwrap_or_default();
    format!("{}-{}-{}", part("Name"), part("Version"), part("Release"))
        .trim_matches('-')
        .to_string()
}

/// Order two `Name-Version-Release` strings. Runs of digits compare as
/// numbers, so `app-10-1` is newer than `app-9-1`.
fn compare_versions(a: &str, b: &str) -> Ordering {
    fn segments(version: &str) -> Vec<&str> {
        let mut segments = Vec::new();
        let mut start = 0;
        let mut digits = None;
        for (i, c) in version.char_indices() {
            let is_digit = c.is_ascii_digit();
            if digits.is_some_and(|d| d != is_digit) {
                segments.push(&version[start..i]);
                start = i;
            }
            digits = Some(is_digit);
        }
        if start < version.len() {
            segments.push(&version[start..]);
        }
        segments
    }

    let (a, b) = (segments(a), segments(b));
    for (x, y) in a.iter().zip(&b) {
        let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn is_interactive(inspect: &Value) -> bool {
    ["AttachStdin", "AttachStdout", "AttachStderr"].iter().all(|key| {
        inspect
            .get("Config")
            .and_then(|config| config.get(*key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    })
}

fn is_running(inspect: &Value) -> bool {
    inspect
        .pointer("/State/Running")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// The container in `snapshot` with the given name.
fn find_container<'s>(snapshot: &'s Snapshot, name: &str) -> Option<&'s ObjectRef> {
    snapshot
        .containers
        .iter()
        .find(|c| c.names.iter().any(|n| n.trim_start_matches('/') == name))
}

/// The invoking user's IDs, as recorded by sudo or the audit login UID.
fn sudo_env() -> [(String, String); 2] {
    let uid = std::env::var("SUDO_UID").unwrap_or_else(|_| {
        std::fs::read_to_string("/proc/self/loginuid")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|uid| *uid != u32::MAX)
            .map(|uid| uid.to_string())
            .unwrap_or_else(|| "0".to_string())
    });
    let gid = std::env::var("SUDO_GID")
        .unwrap_or_else(|_| rustix::process::getgid().as_raw().to_string());
    [("SUDO_UID".to_string(), uid), ("SUDO_GID".to_string(), gid)]
}

/// Plans install, run and uninstall commands for images.
#[derive(Debug)]
pub struct Lifecycle<'a> {
    engine: &'a dyn Engine,
    ledger: &'a Ledger,
    binary: &'a Path,
}

impl<'a> Lifecycle<'a> {
    /// `binary` is the engine CLI the built-in templates run.
    pub fn new(engine: &'a dyn Engine, ledger: &'a Ledger, binary: &'a Path) -> Self {
        Self {
            engine,
            ledger,
            binary,
        }
    }

    fn resolve_image(&self, token: &str, snapshot: &Snapshot) -> Result<(ObjectRef, BTreeMap<String, String>, Value)> {
        let target = resolve(token, snapshot)?;
        if !target.object.is_image() {
            return Err(AtomicError::NotFound(token.to_string()));
        }
        let inspect = self.engine.inspect_image(&target.object.id)?;
        let labels = labels_of(&inspect);
        Ok((target.object, labels, inspect))
    }

    fn finish(&self, template: &CommandTemplate, image: &str, name: &str) -> LabelCommand {
        let mut env: BTreeMap<String, String> = sudo_env().into_iter().collect();
        env.insert(NAME_PLACEHOLDER.to_string(), name.to_string());
        env.insert(IMAGE_PLACEHOLDER.to_string(), image.to_string());
        LabelCommand {
            argv: template.substitute(image, name),
            env,
        }
    }

    fn label_template(labels: &BTreeMap<String, String>, label: &str) -> Option<CommandTemplate> {
        find_label(labels, label)
            .map(CommandTemplate::from_label)
            .filter(|t| !t.is_empty())
    }

    /// Plan the install command without recording anything.
    pub fn plan_install(
        &self,
        snapshot: &Snapshot,
        image: &str,
        name: Option<&str>,
        extra_args: &[String],
    ) -> Result<(ObjectRef, LabelCommand)> {
        let (object, labels, _) = self.resolve_image(image, snapshot)?;
        let mut template = Self::label_template(&labels, "INSTALL")
            .unwrap_or_else(|| CommandTemplate::builtin(self.binary, INSTALL_ARGS));
        template.extend(extra_args.iter().cloned());

        let name = name.map_or_else(|| default_name(image, false), str::to_string);
        Ok((object, self.finish(&template, image, &name)))
    }

    /// Plan the install command and record the image in the ledger.
    pub fn install(
        &self,
        snapshot: &Snapshot,
        image: &str,
        name: Option<&str>,
        extra_args: &[String],
    ) -> Result<LabelCommand> {
        let (object, command) = self.plan_install(snapshot, image, name, extra_args)?;
        self.ledger.record(&object.id, image)?;
        tracing::info!("recorded install of {} ({})", image, object.short_id());
        Ok(command)
    }

    /// Plan the run command.
    ///
    /// When a container named `name` exists it is reused: a running one gets
    /// `command` executed in it, a stopped one is started (and `command`
    /// executed once it is up). Otherwise a new container is created from
    /// the `RUN` label or the built-in template, which fails with
    /// [`AtomicError::NotInstalled`] when the image has an `INSTALL` label
    /// but no ledger record, unless `nocheck` is set.
    pub fn run(
        &self,
        snapshot: &Snapshot,
        image: &str,
        name: Option<&str>,
        command: &[String],
        spc: bool,
        nocheck: bool,
    ) -> Result<RunPlan> {
        let name = name.map_or_else(|| default_name(image, spc), str::to_string);
        if let Some(container) = find_container(snapshot, &name) {
            return self.rerun(snapshot, image, &name, container, command);
        }

        let (object, labels, inspect) = self.resolve_image(image, snapshot)?;
        check_install(
            self.ledger,
            &object.id,
            image,
            find_label(&labels, "INSTALL").is_some(),
            nocheck,
        )?;

        let label = if spc { None } else { Self::label_template(&labels, "RUN") };
        let template = match label {
            Some(mut template) => {
                template.extend(command.iter().cloned());
                template
            }
            None => {
                let defaults = if spc { SPC_ARGS } else { RUN_ARGS };
                let mut template = CommandTemplate::builtin(self.binary, defaults);
                if command.is_empty() {
                    template.extend(config_cmd(&inspect));
                } else {
                    template.extend(command.iter().cloned());
                }
                template
            }
        };

        Ok(RunPlan {
            commands: vec![self.finish(&template, image, &name)],
            existing: None,
        })
    }

    fn rerun(
        &self,
        snapshot: &Snapshot,
        image: &str,
        name: &str,
        container: &ObjectRef,
        command: &[String],
    ) -> Result<RunPlan> {
        let inspect = self.engine.inspect_container(&container.id)?;
        let created_from = inspect.get("Image").and_then(Value::as_str).map(normalize_id);
        let outdated = match resolve(image, snapshot) {
            Ok(target) if target.object.is_image() => {
                created_from.is_some_and(|id| id != target.object.id)
            }
            _ => false,
        };
        if outdated {
            tracing::warn!(
                "container '{name}' uses an older version of '{image}'; to use the newer \
                 image, run 'atomic-rs uninstall --name {name} {image}' and run it again"
            );
        }

        let running = is_running(&inspect);
        let interactive = is_interactive(&inspect);
        let builtin = |args: &[&str], extra: &[String]| {
            let mut template = CommandTemplate::builtin(self.binary, args);
            template.extend(extra.iter().cloned());
            self.finish(&template, image, name)
        };

        let commands = match (running, command.is_empty()) {
            (true, false) => vec![builtin(EXEC_ARGS, command)],
            (true, true) if interactive => vec![builtin(EXEC_ARGS, &config_cmd(&inspect))],
            (true, true) => Vec::new(),
            (false, false) => vec![builtin(START_ARGS, &[]), builtin(EXEC_ARGS, command)],
            (false, true) if interactive => vec![builtin(START_ATTACHED_ARGS, &[])],
            (false, true) => vec![builtin(START_ARGS, &[])],
        };
        tracing::debug!(
            "reusing container {} ({}running)",
            container.short_id(),
            if running { "" } else { "not " }
        );

        Ok(RunPlan {
            commands,
            existing: Some(ExistingContainer {
                id: container.id.clone(),
                name: name.to_string(),
                running,
                outdated,
            }),
        })
    }

    /// Plan an uninstall.
    ///
    /// With `force`, every container created from the image is removed.
    /// The container named `name` is stopped and removed in any case;
    /// failures there are only logged. Nothing is forgotten until
    /// [`complete_uninstall`](Self::complete_uninstall).
    pub fn uninstall(
        &self,
        snapshot: &Snapshot,
        image: &str,
        name: Option<&str>,
        extra_args: &[String],
        force: bool,
    ) -> Result<UninstallPlan> {
        let (object, labels, _) = self.resolve_image(image, snapshot)?;
        let name = name.map_or_else(|| default_name(image, false), str::to_string);

        let mut removed = Vec::new();
        if force {
            for container in self.containers_of(snapshot, &object, image)? {
                tracing::info!("removing container {}", container.short_id());
                self.engine.remove(container, true)?;
                removed.push(container.id.as_str());
            }
        }
        if let Some(container) = find_container(snapshot, &name) {
            if !removed.contains(&container.id.as_str()) {
                self.discard_container(container);
            }
        }

        let command = Self::label_template(&labels, "UNINSTALL").map(|mut template| {
            template.extend(extra_args.iter().cloned());
            self.finish(&template, image, &name)
        });

        Ok(UninstallPlan {
            image: object,
            command,
            remove_image: name == image,
        })
    }

    /// Remove the image if planned and forget its install record.
    pub fn complete_uninstall(&self, plan: &UninstallPlan) -> Result<()> {
        if plan.remove_image {
            tracing::info!("removing image {}", plan.image.short_id());
            self.engine.remove(&plan.image, false)?;
        }
        if self.ledger.forget(&plan.image.id)? {
            tracing::info!("removed install record of {}", plan.image.short_id());
        }
        Ok(())
    }

    /// Stop (if running) and remove a container, logging any failure.
    fn discard_container(&self, container: &ObjectRef) {
        let running = self
            .engine
            .inspect_container(&container.id)
            .is_ok_and(|inspect| is_running(&inspect));
        if running {
            if let Err(e) = self.engine.stop(container) {
                tracing::warn!("unable to stop container {}: {}", container.short_id(), e);
            }
        }
        match self.engine.remove(container, false) {
            Ok(()) => tracing::info!("removed container {}", container.short_id()),
            Err(e) => tracing::warn!("unable to remove container {}: {}", container.short_id(), e),
        }
    }

    /// Plan a stop of the container named `name` (default: derived from
    /// `image`).
    ///
    /// The `STOP` label is read from the container, or from the image when
    /// no such container exists.
    pub fn stop(
        &self,
        snapshot: &Snapshot,
        image: &str,
        name: Option<&str>,
        extra_args: &[String],
    ) -> Result<StopPlan> {
        let name = name.map_or_else(|| default_name(image, false), str::to_string);
        let (labels, running) = match find_container(snapshot, &name) {
            Some(container) => {
                let inspect = self.engine.inspect_container(&container.id)?;
                let running = is_running(&inspect).then(|| container.clone());
                (labels_of(&inspect), running)
            }
            None => {
                let (_, labels, _) = self.resolve_image(image, snapshot)?;
                (labels, None)
            }
        };

        let command = Self::label_template(&labels, "STOP").map(|mut template| {
            template.extend(extra_args.iter().cloned());
            self.finish(&template, image, &name)
        });
        Ok(StopPlan { command, running })
    }

    /// Stop the container if it was running when planned.
    pub fn complete_stop(&self, plan: &StopPlan) -> Result<()> {
        if let Some(container) = &plan.running {
            self.engine.stop(container)?;
            tracing::info!("stopped container {}", container.short_id());
        }
        Ok(())
    }

    /// Labels of an image.
    pub fn info(&self, snapshot: &Snapshot, image: &str) -> Result<BTreeMap<String, String>> {
        let (_, labels, _) = self.resolve_image(image, snapshot)?;
        Ok(labels)
    }

    /// Version of an image and, with `recurse`, of every parent layer.
    pub fn version(&self, snapshot: &Snapshot, image: &str, recurse: bool) -> Result<Vec<LayerVersion>> {
        let (object, labels, inspect) = self.resolve_image(image, snapshot)?;
        let mut layers = vec![Self::layer_version(snapshot, &object.id, &labels)];

        let mut parent = recurse.then(|| parent_of(&inspect)).flatten();
        while let Some(id) = parent {
            if layers.iter().any(|layer| layer.id == id) {
                break;
            }
            let inspect = self.engine.inspect_image(&id)?;
            layers.push(Self::layer_version(snapshot, &id, &labels_of(&inspect)));
            parent = parent_of(&inspect);
        }
        Ok(layers)
    }

    /// Layers of an image that newer local images supersede.
    ///
    /// Walks the parent chain; consecutive layers sharing a `Name` label are
    /// checked once, against every tagged local image carrying that name.
    pub fn verify(&self, snapshot: &Snapshot, image: &str) -> Result<Vec<OutdatedLayer>> {
        let (object, labels, inspect) = self.resolve_image(image, snapshot)?;
        let mut chain = vec![(object.id.clone(), labels)];
        let mut parent = parent_of(&inspect);
        while let Some(id) = parent {
            if chain.iter().any(|(seen, _)| *seen == id) {
                break;
            }
            let inspect = self.engine.inspect_image(&id)?;
            parent = parent_of(&inspect);
            chain.push((id, labels_of(&inspect)));
        }

        let mut available = Vec::new();
        for candidate in snapshot.images.iter().filter(|i| i.has_tags()) {
            let inspect = match self.engine.inspect_image(&candidate.id) {
                Ok(inspect) => inspect,
                Err(AtomicError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let labels = labels_of(&inspect);
            if let Some(name) = find_label(&labels, "Name") {
                available.push((candidate.id.clone(), name.to_string(), nvr(&labels)));
            }
        }

        let mut outdated = Vec::new();
        let mut previous: Option<&str> = None;
        for (id, labels) in &chain {
            let name = find_label(labels, "Name").unwrap_or_default();
            if previous == Some(name) {
                continue;
            }
            previous = Some(name);
            if name.is_empty() {
                continue;
            }
            let current = nvr(labels);
            let newest = available
                .iter()
                .filter(|(_, candidate, _)| candidate == name)
                .max_by(|a, b| compare_versions(&a.2, &b.2));
            if let Some((available_id, _, version)) = newest {
                if compare_versions(version, &current) == Ordering::Greater {
                    tracing::debug!("layer {} ({}) is superseded by {}", id, current, version);
                    outdated.push(OutdatedLayer {
                        layer: Self::layer_version(snapshot, id, labels),
                        available_id: available_id.clone(),
                        available: version.clone(),
                    });
                }
            }
        }
        Ok(outdated)
    }

    fn layer_version(snapshot: &Snapshot, id: &str, labels: &BTreeMap<String, String>) -> LayerVersion {
        let tag = snapshot
            .images
            .iter()
            .find(|image| image.id == id && image.has_tags())
            .and_then(|image| image.repo_tags.first().cloned());
        LayerVersion {
            id: id.to_string(),
            version: nvr(labels),
            tag,
        }
    }

    /// Containers in `snapshot` created from `image`.
    fn containers_of<'s>(&self, snapshot: &'s Snapshot, image: &ObjectRef, token: &str) -> Result<Vec<&'s ObjectRef>> {
        let mut reference = token.to_string();
        if !reference.rsplit('/').next().unwrap_or(&reference).contains(':') {
            reference.push_str(":latest");
        }

        let mut matched = Vec::new();
        for container in &snapshot.containers {
            let inspect = match self.engine.inspect_container(&container.id) {
                Ok(inspect) => inspect,
                Err(AtomicError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let by_id = inspect
                .get("Image")
                .and_then(Value::as_str)
                .is_some_and(|id| normalize_id(id) == image.id);
            let by_name = inspect
                .get("ImageName")
                .or_else(|| inspect.pointer("/Config/Image"))
                .and_then(Value::as_str)
                .is_some_and(|name| name == reference || image.repo_tags.iter().any(|t| t == name));
            if by_id || by_name {
                matched.push(container);
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use tempfile::TempDir;

    const PODMAN: &str = "/usr/bin/podman";

    fn engine() -> FakeEngine {
        FakeEngine::new()
            .with_labeled_image(
                "aaa111",
                &["registry.example.com/rhel7/rsyslog:latest"],
                &[
                    ("INSTALL", "podman run --rm -e NAME=NAME IMAGE /bin/install.sh"),
                    ("run", "podman run -d --name NAME IMAGE"),
                    ("Uninstall", "podman run --rm IMAGE /bin/uninstall.sh"),
                ],
            )
            .with_labeled_image("bbb222", &["fedora:latest"], &[])
            .with_container_of("c1", &["logger"], "registry.example.com/rhel7/rsyslog:latest")
            .with_container_of("c2", &["other"], "fedora:latest")
    }

    #[test]
    fn test_substitute() {
        let template = CommandTemplate::new(["IMAGE", "NAME", "IMAGE=IMAGE", "NAME=NAME", "--name=${NAME}", "IMAGES"]);
        assert_eq!(
            template.substitute("img", "n"),
            ["img", "n", "IMAGE=img", "NAME=n", "--name=n", "IMAGES"]
        );
    }

    #[test]
    fn test_substitution_never_splits_values() {
        let template = CommandTemplate::from_label("run IMAGE");
        assert_eq!(template.substitute("a b; rm -rf /", "n"), ["run", "a b; rm -rf /"]);
    }

    #[test]
    fn test_find_label_variants() {
        let labels = BTreeMap::from([
            ("run".to_string(), "r".to_string()),
            ("Uninstall".to_string(), "u".to_string()),
        ]);
        assert_eq!(find_label(&labels, "RUN"), Some("r"));
        assert_eq!(find_label(&labels, "UNINSTALL"), Some("u"));
        assert_eq!(find_label(&labels, "INSTALL"), None);
    }

    #[test]
    fn test_install_uses_label_and_records() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let cmd = lifecycle
            .install(&snapshot, "rsyslog", None, &["--debug".to_string()])
            .unwrap();
        assert_eq!(
            cmd.argv,
            ["podman", "run", "--rm", "-e", "NAME=rsyslog", "rsyslog", "/bin/install.sh", "--debug"]
        );
        assert_eq!(cmd.env["NAME"], "rsyslog");
        assert_eq!(cmd.env["IMAGE"], "rsyslog");
        assert!(cmd.env.contains_key("SUDO_UID"));
        assert!(ledger.has_record("aaa111"));
    }

    #[test]
    fn test_plan_install_default_template() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let (object, cmd) = lifecycle
            .plan_install(&snapshot, "fedora", Some("fed"), &[])
            .unwrap();
        assert_eq!(object.id, "bbb222");
        assert_eq!(cmd.argv[0], PODMAN);
        assert!(cmd.argv.contains(&"CONFDIR=/host/etc/fed".to_string()));
        assert_eq!(cmd.argv.last().unwrap(), "fedora");
        assert!(!ledger.has_record("bbb222"));
    }

    #[test]
    fn test_run_requires_install() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let err = lifecycle
            .run(&snapshot, "rsyslog", None, &[], false, false)
            .unwrap_err();
        assert!(matches!(err, AtomicError::NotInstalled { .. }));

        let plan = lifecycle
            .run(&snapshot, "rsyslog", None, &[], false, true)
            .unwrap();
        assert!(plan.existing.is_none());
        assert_eq!(plan.commands[0].argv, ["podman", "run", "-d", "--name", "rsyslog", "rsyslog"]);
    }

    #[test]
    fn test_run_defaults() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle
            .run(&snapshot, "fedora", None, &[], false, false)
            .unwrap();
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(
            plan.commands[0].argv,
            [PODMAN, "run", "-t", "-i", "--name", "fedora", "fedora", "/bin/sh"]
        );

        let plan = lifecycle
            .run(&snapshot, "fedora", None, &["ls".to_string()], true, false)
            .unwrap();
        let cmd = &plan.commands[0];
        assert!(cmd.argv.contains(&"NAME=fedora-spc".to_string()));
        assert_eq!(cmd.argv.last().unwrap(), "ls");
    }

    #[test]
    fn test_uninstall_force_removes_containers() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));
        ledger.record("aaa111", "rsyslog").unwrap();

        let plan = lifecycle
            .uninstall(&snapshot, "rsyslog", None, &[], true)
            .unwrap();
        let cmd = plan.command.as_ref().unwrap();
        assert_eq!(cmd.argv, ["podman", "run", "--rm", "rsyslog", "/bin/uninstall.sh"]);
        assert_eq!(engine.removed(), ["c1"]);
        // Still recorded until the command has run.
        assert!(ledger.has_record("aaa111"));

        assert!(plan.remove_image);
        lifecycle.complete_uninstall(&plan).unwrap();
        assert_eq!(engine.removed(), ["c1", "aaa111"]);
        assert!(!ledger.has_record("aaa111"));

        let plan = lifecycle
            .uninstall(&snapshot, "fedora", Some("fed"), &[], false)
            .unwrap();
        assert!(plan.command.is_none());
        assert!(!plan.remove_image);
    }

    #[test]
    fn test_container_is_not_an_image() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        assert!(matches!(
            lifecycle.plan_install(&snapshot, "logger", None, &[]),
            Err(AtomicError::NotFound(_))
        ));
    }

    #[test]
    fn test_label_command_display() {
        let cmd = LabelCommand {
            argv: vec!["podman".into(), "run".into(), "fedora".into()],
            env: BTreeMap::new(),
        };
        assert_eq!(cmd.to_string(), "podman run fedora");
        assert!(cmd.command().is_some());
        assert!(LabelCommand { argv: vec![], env: BTreeMap::new() }.command().is_none());
    }

    fn fedora_with_container() -> FakeEngine {
        FakeEngine::new()
            .with_labeled_image(
                "bbb222",
                &["fedora:latest"],
                &[("STOP", "podman exec NAME /bin/shutdown.sh")],
            )
            .with_image("ccc333", &["fedora:30"])
            .with_container_of("c3", &["/fedora"], "fedora:latest")
    }

    #[test]
    fn test_run_starts_stopped_container() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle
            .run(&snapshot, "fedora:latest", None, &[], false, false)
            .unwrap();
        let existing = plan.existing.unwrap();
        assert_eq!(existing.id, "c3");
        assert!(!existing.running);
        assert!(!existing.outdated);
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].argv, [PODMAN, "start", "fedora"]);

        let plan = lifecycle
            .run(&snapshot, "fedora:latest", None, &["ls".to_string()], false, false)
            .unwrap();
        let argvs: Vec<_> = plan.commands.iter().map(|c| c.argv.clone()).collect();
        assert_eq!(
            argvs,
            [
                vec![PODMAN, "start", "fedora"],
                vec![PODMAN, "exec", "-t", "-i", "fedora", "ls"],
            ]
        );
    }

    #[test]
    fn test_run_interactive_container() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container().interactive("c3");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle
            .run(&snapshot, "fedora:latest", None, &[], false, false)
            .unwrap();
        assert_eq!(plan.commands[0].argv, [PODMAN, "start", "-i", "-a", "fedora"]);

        let engine = fedora_with_container().interactive("c3").running("c3");
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));
        let plan = lifecycle
            .run(&snapshot, "fedora:latest", None, &[], false, false)
            .unwrap();
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].argv, [PODMAN, "exec", "-t", "-i", "fedora", "/bin/sh"]);
    }

    #[test]
    fn test_run_running_container() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container().running("c3");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle
            .run(&snapshot, "fedora:latest", None, &[], false, false)
            .unwrap();
        assert!(plan.commands.is_empty());
        assert!(plan.existing.unwrap().running);

        let plan = lifecycle
            .run(&snapshot, "fedora:latest", None, &["top".to_string()], false, false)
            .unwrap();
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].argv, [PODMAN, "exec", "-t", "-i", "fedora", "top"]);
    }

    #[test]
    fn test_run_flags_outdated_container() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container().with_container_of("c4", &["old"], "fedora:30");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle
            .run(&snapshot, "fedora:latest", Some("old"), &[], false, false)
            .unwrap();
        let existing = plan.existing.unwrap();
        assert_eq!(existing.id, "c4");
        assert!(existing.outdated);
        assert_eq!(plan.commands[0].argv, [PODMAN, "start", "old"]);
    }

    #[test]
    fn test_uninstall_removes_named_container() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container().running("c3");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));
        ledger.record("bbb222", "fedora:latest").unwrap();

        let plan = lifecycle
            .uninstall(&snapshot, "fedora:latest", Some("fedora"), &[], false)
            .unwrap();
        assert_eq!(engine.stopped(), ["c3"]);
        assert_eq!(engine.removed(), ["c3"]);
        assert!(!plan.remove_image);

        lifecycle.complete_uninstall(&plan).unwrap();
        assert_eq!(engine.removed(), ["c3"]);
        assert!(!ledger.has_record("bbb222"));
    }

    #[test]
    fn test_forced_uninstall_removes_named_container_once() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        lifecycle
            .uninstall(&snapshot, "fedora:latest", Some("fedora"), &[], true)
            .unwrap();
        assert_eq!(engine.removed(), ["c3"]);
        assert!(engine.stopped().is_empty());
    }

    #[test]
    fn test_stop_runs_label_then_stops() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container().running("c3");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle.stop(&snapshot, "fedora:latest", Some("fedora"), &[]).unwrap();
        assert_eq!(
            plan.command.as_ref().unwrap().argv,
            ["podman", "exec", "fedora", "/bin/shutdown.sh"]
        );
        assert_eq!(plan.running.as_ref().unwrap().id, "c3");
        assert!(engine.stopped().is_empty());

        lifecycle.complete_stop(&plan).unwrap();
        assert_eq!(engine.stopped(), ["c3"]);
    }

    #[test]
    fn test_stop_without_container_uses_image() {
        let dir = TempDir::new().unwrap();
        let engine = fedora_with_container();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let plan = lifecycle.stop(&snapshot, "fedora:latest", Some("absent"), &[]).unwrap();
        assert!(plan.command.is_some());
        assert!(plan.running.is_none());
        lifecycle.complete_stop(&plan).unwrap();
        assert!(engine.stopped().is_empty());

        assert!(matches!(
            lifecycle.stop(&snapshot, "nothing", None, &[]),
            Err(AtomicError::NotFound(_))
        ));
    }

    #[test]
    fn test_info_lists_labels() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let labels = lifecycle.info(&snapshot, "rsyslog").unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["run"], "podman run -d --name NAME IMAGE");
        assert!(lifecycle.info(&snapshot, "fedora").unwrap().is_empty());
    }

    #[test]
    fn test_version_follows_parents() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new()
            .with_labeled_image(
                "ddd444",
                &["registry.example.com/app:2"],
                &[("Name", "app"), ("Version", "2.0"), ("Release", "3")],
            )
            .with_labeled_image("eee555", &["<none>:<none>"], &[("Name", "base")])
            .with_image("fff666", &["registry.example.com/os:1"])
            .with_parent("ddd444", "sha256:eee555")
            .with_parent("eee555", "fff666");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let layers = lifecycle.version(&snapshot, "app", false).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].version, "app-2.0-3");
        assert_eq!(layers[0].tag.as_deref(), Some("registry.example.com/app:2"));

        let layers = lifecycle.version(&snapshot, "app", true).unwrap();
        let ids: Vec<_> = layers.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["ddd444", "eee555", "fff666"]);
        assert_eq!(layers[1].version, "base");
        assert_eq!(layers[1].tag, None);
        assert_eq!(layers[2].version, "");
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("app-10-1", "app-9-1"), Ordering::Greater);
        assert_eq!(compare_versions("app-2.0-3", "app-2.0-3"), Ordering::Equal);
        assert_eq!(compare_versions("app-2.0", "app-2.0-1"), Ordering::Less);
        assert_eq!(compare_versions("app-2.0b-1", "app-2.0a-1"), Ordering::Greater);
    }

    #[test]
    fn test_verify_reports_superseded_base() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new()
            .with_labeled_image(
                "ddd444",
                &["registry.example.com/app:2"],
                &[("Name", "app"), ("Version", "2.0"), ("Release", "3")],
            )
            .with_labeled_image(
                "eee555",
                &["registry.example.com/base:9"],
                &[("Name", "base"), ("Version", "9"), ("Release", "1")],
            )
            .with_labeled_image(
                "fff666",
                &["registry.example.com/base:10"],
                &[("Name", "base"), ("Version", "10"), ("Release", "1")],
            )
            .with_parent("ddd444", "eee555");
        let ledger = Ledger::new(dir.path().join("install"));
        let snapshot = Snapshot::capture(&engine).unwrap();
        let lifecycle = Lifecycle::new(&engine, &ledger, Path::new(PODMAN));

        let outdated = lifecycle.verify(&snapshot, "app").unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].layer.id, "eee555");
        assert_eq!(outdated[0].layer.version, "base-9-1");
        assert_eq!(outdated[0].available, "base-10-1");
        assert_eq!(outdated[0].available_id, "fff666");

        assert!(lifecycle.verify(&snapshot, "registry.example.com/base:10").unwrap().is_empty());
    }
}
