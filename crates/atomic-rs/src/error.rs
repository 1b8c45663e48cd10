//! Error types for the atomic-rs library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, AtomicError>`.
//!
//! # Error Categories
//!
//! - **Resolution**: [`AmbiguousImage`], [`AmbiguousContainer`], [`NotFound`]
//! - **Staging**: [`PermissionDenied`], [`Stage`]
//! - **Scanning**: [`ConfigInvalid`], [`ScanToolFailed`], [`NoTargets`]
//! - **Engine**: [`EngineUnavailable`], [`EngineCommand`]
//! - **Lifecycle**: [`NotInstalled`]
//! - **System errors**: [`Io`], [`JsonParse`], [`ConfigParse`], [`Lock`]
//!
//! Every variant carries enough context to refine the input without reading
//! logs: ambiguity errors list all candidates, configuration errors name the
//! scanner and the offending key, and scanner failures carry the exit code.
//!
//! [`AmbiguousImage`]: AtomicError::AmbiguousImage
//! [`AmbiguousContainer`]: AtomicError::AmbiguousContainer
//! [`NotFound`]: AtomicError::NotFound
//! [`PermissionDenied`]: AtomicError::PermissionDenied
//! [`Stage`]: AtomicError::Stage
//! [`ConfigInvalid`]: AtomicError::ConfigInvalid
//! [`ScanToolFailed`]: AtomicError::ScanToolFailed
//! [`NoTargets`]: AtomicError::NoTargets
//! [`EngineUnavailable`]: AtomicError::EngineUnavailable
//! [`EngineCommand`]: AtomicError::EngineCommand
//! [`NotInstalled`]: AtomicError::NotInstalled
//! [`Io`]: AtomicError::Io
//! [`JsonParse`]: AtomicError::JsonParse
//! [`ConfigParse`]: AtomicError::ConfigParse
//! [`Lock`]: AtomicError::Lock

use crate::lockfile::LockError;

/// Result type alias for operations that may return an AtomicError.
pub type Result<T> = std::result::Result<T, AtomicError>;

/// Error types for resolution, staging, scanning and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum AtomicError {
    /// More than one image matched the token.
    #[error(
        "found multiple images matching '{token}':\n    {}\nRefine your search to narrow results.",
        .candidates.join("\n    ")
    )]
    AmbiguousImage {
        token: String,
        candidates: Vec<String>,
    },

    /// More than one container matched the token.
    #[error(
        "found multiple containers matching '{token}':\n    {}\nRefine your search to narrow results.",
        .candidates.join("\n    ")
    )]
    AmbiguousContainer {
        token: String,
        candidates: Vec<String>,
    },

    /// Neither an image nor a container matched the token.
    #[error("unable to associate '{0}' with a container or image")]
    NotFound(String),

    /// The operation requires administrative privilege.
    #[error("{operation} must be run as root")]
    PermissionDenied { operation: String },

    /// Staging a single target failed; everything staged before it was rolled back.
    #[error("failed to stage '{target}': {source}")]
    Stage {
        target: String,
        #[source]
        source: Box<AtomicError>,
    },

    /// The scanner configuration is missing or has the wrong shape.
    #[error("invalid configuration for scanner '{scanner}': {reason}")]
    ConfigInvalid { scanner: String, reason: String },

    /// The external scanner exited unsuccessfully.
    #[error("scanner '{scanner}' failed: {}", describe_exit(.code))]
    ScanToolFailed { scanner: String, code: Option<i32> },

    /// A scan selection resolved to nothing.
    #[error("no images or containers to scan")]
    NoTargets,

    /// The container engine could not be reached.
    #[error("unable to communicate with the container engine: {0}")]
    EngineUnavailable(String),

    /// An engine command ran but reported failure.
    #[error("`{command}` failed: {stderr}")]
    EngineCommand { command: String, stderr: String },

    /// The image has an INSTALL label but was never installed.
    #[error(
        "'{image}' has an INSTALL label, which suggests you should run 'atomic-rs install' \
         first, but no record of a prior install was found. Either run 'atomic-rs install' \
         or rerun 'atomic-rs run' with the --nocheck option."
    )]
    NotInstalled { image: String },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// The configuration file is not valid TOML.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Ledger lock file error.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

fn describe_exit(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl AtomicError {
    /// Candidates listed by an ambiguity error, if this is one.
    pub fn candidates(&self) -> Option<&[String]> {
        match self {
            AtomicError::AmbiguousImage { candidates, .. }
            | AtomicError::AmbiguousContainer { candidates, .. } => Some(candidates),
            _ => None,
        }
    }
}
