//! Configuration parsing for atomic-rs.
//!
//! Configuration is a TOML file naming the host-wide state locations, the
//! container engine binary, and the scanners available to `atomic-rs scan`.
//!
//! # Discovery
//!
//! [`Config::discover()`] looks in the following order:
//! 1. `$ATOMIC_CONFIG`
//! 2. `/etc/atomic.toml`
//!
//! A missing default file yields the built-in defaults; there is always a
//! usable configuration, just possibly without any scanners.
//!
//! # Configuration Structure
//!
//! ```toml
//! default_scanner = "openscap"
//!
//! [paths]
//! results_root = "/var/lib/atomic"
//! staging_root = "/run/atomic"
//! install_ledger = "/etc/atomic.d/install"
//!
//! [engine]
//! binary = "podman"
//!
//! [scanners.openscap]
//! image_name = "openscap"
//! scanner_args = ["oscapd-evaluate", "scan", "--targets", "chroots-in-dir", "-j1"]
//! engine_args = []
//! ```
//!
//! Scanner sections are kept as raw TOML and validated when looked up with
//! [`Config::scanner()`], so a malformed entry only affects that scanner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AtomicError, Result};

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "ATOMIC_CONFIG";

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/atomic.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Scanner used when none is given on the command line.
    #[serde(default)]
    pub default_scanner: Option<String>,

    /// Host-wide state locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Container engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Scanner sections keyed by scanner name.
    #[serde(default)]
    pub scanners: BTreeMap<String, toml::Value>,
}

/// Locations of host-wide mutable state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Root under which each scan writes `<scanner>/<timestamp>/`.
    pub results_root: PathBuf,

    /// Root under which each scan creates its private staging session.
    pub staging_root: PathBuf,

    /// The install ledger file.
    pub install_ledger: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("/var/lib/atomic"),
            staging_root: PathBuf::from("/run/atomic"),
            install_ledger: PathBuf::from("/etc/atomic.d/install"),
        }
    }
}

/// Container engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Engine CLI binary (name looked up in `$PATH`, or absolute path).
    pub binary: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("podman"),
        }
    }
}

/// A validated scanner definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Scanner name as configured.
    pub name: String,
    /// Image to run the scanner from.
    pub image_name: String,
    /// Arguments passed to the scanner image.
    pub scanner_args: Vec<String>,
    /// Extra engine arguments inserted before the image name.
    pub engine_args: Vec<String>,
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a file that must exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Discover configuration from `$ATOMIC_CONFIG` or the default location.
    ///
    /// An explicitly named file must exist; a missing default file yields
    /// [`Config::default()`].
    pub fn discover() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(path);
        }

        match std::fs::read_to_string(DEFAULT_CONFIG_PATH) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the scanner to use: the given name, else `default_scanner`.
    pub fn scanner_name<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str> {
        requested
            .or(self.default_scanner.as_deref())
            .ok_or_else(|| AtomicError::ConfigInvalid {
                scanner: String::new(),
                reason: "no scanner given and no default_scanner configured".to_string(),
            })
    }

    /// Look up and validate a scanner definition.
    ///
    /// Fails with [`AtomicError::ConfigInvalid`] when the scanner is not
    /// configured, `image_name` is missing or not a string, `scanner_args`
    /// is missing or not a list of strings, or `engine_args` is present but
    /// not a list of strings.
    pub fn scanner(&self, name: &str) -> Result<ScannerConfig> {
        let invalid = |reason: String| AtomicError::ConfigInvalid {
            scanner: name.to_string(),
            reason,
        };

        let section = self
            .scanners
            .get(name)
            .ok_or_else(|| invalid(format!("no [scanners.{name}] section")))?
            .as_table()
            .ok_or_else(|| invalid(format!("[scanners.{name}] must be a table")))?;

        let image_name = match section.get("image_name") {
            Some(toml::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(_) => return Err(invalid("image_name must be a non-empty string".to_string())),
            None => return Err(invalid("image_name is not defined".to_string())),
        };

        let scanner_args = match section.get("scanner_args") {
            Some(value) => string_list(value)
                .ok_or_else(|| invalid("scanner_args must be a list of strings".to_string()))?,
            None => return Err(invalid("scanner_args is not defined".to_string())),
        };

        let engine_args = match section.get("engine_args") {
            Some(value) => string_list(value)
                .ok_or_else(|| invalid("engine_args must be a list of strings".to_string()))?,
            None => Vec::new(),
        };

        Ok(ScannerConfig {
            name: name.to_string(),
            image_name,
            scanner_args,
            engine_args,
        })
    }
}

fn string_list(value: &toml::Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}
