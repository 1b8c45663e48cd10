//! Scan orchestration.
//!
//! A scan runs through a fixed sequence of steps:
//!
//! 1. **Build targets**: validate the scanner configuration, capture a
//!    [`Snapshot`] and resolve the selection into a deduplicated target list.
//! 2. **Stage**: mount every target under one [`StagingSession`].
//! 3. **Invoke**: run the scanner image once over the whole batch, with the
//!    staging root at `/scanin` and a fresh results directory at `/scanout`.
//! 4. **Correlate**: read the per-target reports and write `environment.json`.
//! 5. **Teardown**: unstage, whatever happened after step 2.
//!
//! There is no retry; every run stages into a new session.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::{Config, ScannerConfig};
use crate::engine::{Engine, ObjectRef, ScanInvocation};
use crate::error::{AtomicError, Result};
use crate::privilege;
use crate::report::{RenderedReport, ReportStatus, correlate, record_environment};
use crate::resolve::{ResolvedTarget, resolve_all};
use crate::snapshot::Snapshot;
use crate::staging::{Stager, StagingSession};

/// What to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// User-supplied identifiers, resolved one by one.
    Targets(Vec<String>),
    AllImages,
    AllContainers,
    /// Every container, then every image.
    All,
}

/// Outcome of a completed scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRunResult {
    pub scanner: String,
    /// Where the scanner wrote its reports.
    pub results_dir: PathBuf,
    /// The (already torn down) staging session root.
    pub staging_dir: PathBuf,
    pub targets: Vec<ResolvedTarget>,
    pub reports: Vec<RenderedReport>,
    pub environment_file: PathBuf,
}

impl ScanRunResult {
    /// Whether no target had vulnerabilities.
    pub fn is_clean(&self) -> bool {
        self.reports
            .iter()
            .all(|r| r.status != ReportStatus::Vulnerable)
    }
}

/// Runs scans against one engine and configuration.
#[derive(Debug)]
pub struct ScanOrchestrator<'a> {
    engine: &'a dyn Engine,
    config: &'a Config,
    privileged: bool,
    debug: bool,
}

impl<'a> ScanOrchestrator<'a> {
    pub fn new(engine: &'a dyn Engine, config: &'a Config) -> Self {
        Self {
            engine,
            config,
            privileged: privilege::can_mount(),
            debug: false,
        }
    }

    /// Override the detected privilege.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Keep the staging directories after the scan.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Turn a selection into the list of targets to stage.
    pub fn build_targets(&self, selection: &Selection, snapshot: &Snapshot) -> Result<Vec<ResolvedTarget>> {
        let targets = match selection {
            Selection::Targets(tokens) => resolve_all(tokens.as_slice(), snapshot)?,
            Selection::AllImages => by_id(snapshot.images.iter()),
            Selection::AllContainers => by_id(snapshot.containers.iter()),
            Selection::All => by_id(snapshot.all()),
        };
        if targets.is_empty() {
            return Err(AtomicError::NoTargets);
        }
        Ok(targets)
    }

    /// Run a complete scan with the named (or default) scanner.
    pub fn run(&self, selection: &Selection, scanner: Option<&str>) -> Result<ScanRunResult> {
        let name = self.config.scanner_name(scanner)?;
        let scanner = self.config.scanner(name)?;

        let snapshot = Snapshot::capture(self.engine)?;
        let targets = self.build_targets(selection, &snapshot)?;
        tracing::info!("scanning {} target(s) with {}", targets.len(), scanner.name);

        let mut session = Stager::new(self.engine, &self.config.paths.staging_root)
            .with_privileged(self.privileged)
            .stage(&targets)?;
        session.set_preserve(self.debug);

        let outcome = self.invoke_and_correlate(&scanner, &session, &targets, &snapshot);
        let teardown = session.unstage();

        let (results_dir, reports, environment_file) = match (outcome, teardown) {
            (Ok(done), Ok(())) => done,
            (Err(e), teardown) => {
                if let Err(cleanup) = teardown {
                    tracing::warn!("teardown after failed scan: {}", cleanup);
                }
                return Err(e);
            }
            (Ok(_), Err(e)) => return Err(e),
        };

        tracing::info!("scan results are in {}", results_dir.display());
        Ok(ScanRunResult {
            scanner: scanner.name,
            results_dir,
            staging_dir: session.root_dir().to_path_buf(),
            targets,
            reports,
            environment_file,
        })
    }

    fn invoke_and_correlate(
        &self,
        scanner: &ScannerConfig,
        session: &StagingSession<'_>,
        targets: &[ResolvedTarget],
        snapshot: &Snapshot,
    ) -> Result<(PathBuf, Vec<RenderedReport>, PathBuf)> {
        let results_dir = self
            .config
            .paths
            .results_root
            .join(&scanner.name)
            .join(session.timestamp());
        std::fs::create_dir_all(&results_dir)?;

        let invocation = ScanInvocation {
            input_dir: session.root_dir().to_path_buf(),
            output_dir: results_dir.clone(),
            engine_args: scanner.engine_args.clone(),
            image: scanner.image_name.clone(),
            args: scanner.scanner_args.clone(),
        };
        let code = self.engine.run_scanner(&invocation)?;
        if code != Some(0) {
            return Err(AtomicError::ScanToolFailed {
                scanner: scanner.name.clone(),
                code,
            });
        }

        let scan_content: BTreeMap<String, String> = targets
            .iter()
            .map(|t| (t.object.id.clone(), t.matched_token.clone()))
            .collect();
        let reports = correlate(&results_dir, &scan_content, snapshot)?;
        let environment_file = record_environment(self.engine, snapshot, &results_dir)?;
        Ok((results_dir, reports, environment_file))
    }
}

/// Targets selected wholesale are known by their IDs.
fn by_id<'o>(objects: impl Iterator<Item = &'o ObjectRef>) -> Vec<ResolvedTarget> {
    objects
        .map(|object| ResolvedTarget {
            object: object.clone(),
            matched_token: object.id.clone(),
        })
        .collect()
}
