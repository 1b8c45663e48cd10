//! Test fixtures for isolated hosts.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;

use atomic_rs::engine::fake::FakeEngine;
use atomic_rs::{Config, Ledger, ScanInvocation};

/// ID of the `nginx:latest` image in [`TestHost::engine`].
pub const NGINX_ID: &str = "4bb46517cac397bdb0bab6eba09b0e1f8e90ddd17cf99662997c3253531136f8";
/// ID of the `redis:7` image in [`TestHost::engine`].
pub const REDIS_ID: &str = "7614ae9453d1d87e740a2056257a6de7135c84037c367e1fffa92ae922784631";

/// Scanner configuration every [`TestHost`] starts with.
const CONFIG: &str = r#"
default_scanner = "fake"

[scanners.fake]
image_name = "registry.example.com/scanner:latest"
scanner_args = ["scan", "--targets", "chroots-in-dir"]
engine_args = ["--net=none"]

[scanners.broken]
scanner_args = ["scan"]
"#;

/// A host whose state directories live in a temporary directory.
///
/// Results, staging sessions and the install ledger are all redirected
/// below the temporary root, which is removed when the host is dropped.
pub struct TestHost {
    _temp_dir: TempDir,
    root_path: PathBuf,
    config: Config,
}

impl TestHost {
    /// Create a host with a `fake` (default) and a `broken` scanner.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let root_path = temp_dir.path().to_path_buf();

        let mut config = Config::from_toml(CONFIG)?;
        config.paths.results_root = root_path.join("var/lib/atomic");
        config.paths.staging_root = root_path.join("run/atomic");
        config.paths.install_ledger = root_path.join("etc/atomic.d/install");

        Ok(Self {
            _temp_dir: temp_dir,
            root_path,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn staging_root(&self) -> &Path {
        &self.config.paths.staging_root
    }

    /// A fresh in-memory engine holding the host's two images,
    /// `docker.io/library/nginx:latest` and `docker.io/library/redis:7`.
    ///
    /// Tests add whatever else they need with the [`FakeEngine`] builders.
    pub fn engine(&self) -> FakeEngine {
        FakeEngine::new()
            .with_image(NGINX_ID, &["docker.io/library/nginx:latest"])
            .with_image(REDIS_ID, &["docker.io/library/redis:7"])
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(&self.config.paths.install_ledger)
    }

    /// Number of sessions left under the staging root.
    pub fn staging_sessions(&self) -> std::io::Result<usize> {
        match std::fs::read_dir(self.staging_root()) {
            Ok(entries) => Ok(entries.count()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Write a scanner report for `id` the way a chroot scanner lays it out:
/// `<output>/<id>/json`, naming the target by its path under `/scanin`.
pub fn write_report(invocation: &ScanInvocation, id: &str, mut report: Value) -> std::io::Result<()> {
    if let Some(fields) = report.as_object_mut() {
        fields.insert("UUID".to_string(), Value::String(format!("/scanin/{id}")));
    }
    let dir = invocation.output_dir.join(id);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("json"), serde_json::to_vec_pretty(&report)?)
}
