#![forbid(unsafe_code)]
//! Label-driven lifecycle management and scanning for container images and
//! containers.
//!
//! This library sits on top of a container engine and adds three things:
//!
//! - **Target resolution**: map a user-supplied string (an ID prefix, a
//!   `registry/repo:tag` glob, or a container name) to exactly one image or
//!   container, reporting every candidate when it is ambiguous.
//! - **Scanning**: mount the root filesystems of a batch of targets, run an
//!   external scanner image over them once, and correlate its per-target
//!   reports back to the names the user asked for.
//! - **Install ledger**: remember which images were installed so that `run`
//!   can refuse images that declare an `INSTALL` step that never happened.
//!
//! # Example
//!
//! ```no_run
//! use atomic_rs::engine::podman::PodmanEngine;
//! use atomic_rs::{Config, ScanOrchestrator, Selection};
//!
//! let config = Config::discover()?;
//! let engine = PodmanEngine::new(&config.engine.binary);
//! let result = ScanOrchestrator::new(&engine, &config)
//!     .run(&Selection::AllImages, Some("openscap"))?;
//! for report in &result.reports {
//!     print!("{}", report.text);
//! }
//! # Ok::<(), atomic_rs::AtomicError>(())
//! ```
//!
//! # Architecture
//!
//! Everything that talks to the engine takes a `&dyn Engine`; the
//! [`engine::fake::FakeEngine`] implementation keeps state in memory for
//! tests. Engine state is read once per operation into a [`Snapshot`] which
//! is passed explicitly to resolution and correlation and never refreshed
//! implicitly.
//!
//! Host-wide state lives in plain files: staging sessions under
//! `/run/atomic`, scan results under `/var/lib/atomic`, and the install
//! ledger at `/etc/atomic.d/install`. All three locations are configurable.

// Configuration and errors
pub mod config;
pub mod error;
pub mod lockfile;

// Engine access
pub mod engine;
pub mod privilege;
pub mod snapshot;

// Target resolution
pub mod reference;
pub mod resolve;

// Scanning
pub mod report;
pub mod scan;
pub mod staging;

// Install state and label commands
pub mod ledger;
pub mod lifecycle;

// Re-export commonly used types
pub use config::{Config, ScannerConfig};
pub use engine::{Engine, EngineInfo, MountOptions, ObjectKind, ObjectRef, ScanInvocation};
pub use error::{AtomicError, Result};
pub use ledger::{InstallRecord, Ledger, check_install};
pub use lifecycle::{
    CommandTemplate, ExistingContainer, LabelCommand, LayerVersion, Lifecycle, OutdatedLayer,
    RunPlan, StopPlan, UninstallPlan,
};
pub use reference::{CompoundName, match_images};
pub use report::{RenderedReport, ReportStatus, VulnerabilityReport, correlate, record_environment};
pub use resolve::{ResolvedTarget, resolve, resolve_all};
pub use scan::{ScanOrchestrator, ScanRunResult, Selection};
pub use snapshot::Snapshot;
pub use staging::{StagedMount, Stager, StagingSession, mount_target, unmount_target};
