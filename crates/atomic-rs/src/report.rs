//! Scanner report parsing, correlation and rendering.
//!
//! Scanners write one report per target somewhere below the results
//! directory, each in a file named `json`. A report identifies its target by
//! `UUID`, whose basename is the image or container ID:
//!
//! ```json
//! {
//!   "UUID": "/scanin/abc123",
//!   "Successful": "TRUE",
//!   "Vulnerabilities": [
//!     {"Title": "CVE-2024-0001", "Severity": "Important", "Custom": {"Package": "openssl"}}
//!   ]
//! }
//! ```
//!
//! [`correlate`] maps every report back to the token the user scanned it
//! under and renders a plain-text summary. [`record_environment`] writes the
//! engine state the scan ran against next to the reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::engine::{Engine, ObjectRef, normalize_id, truncate_id};
use crate::error::{AtomicError, Result};
use crate::snapshot::Snapshot;

/// Name of every per-target report file.
pub const REPORT_FILE_NAME: &str = "json";

/// Name of the environment snapshot written per scan.
pub const ENVIRONMENT_FILE_NAME: &str = "environment.json";

/// Indentation of vulnerability titles and severities.
const DETAIL_INDENT: usize = 5;
/// Indentation of the outermost custom field level.
const CUSTOM_INDENT: usize = 7;

/// One scanner report.
#[derive(Debug, Clone, Deserialize)]
pub struct VulnerabilityReport {
    /// Path-like identity whose basename is the target ID.
    #[serde(rename = "UUID")]
    pub target_id: String,

    /// Whether the scanner supports this target.
    #[serde(rename = "Successful", deserialize_with = "deserialize_flag")]
    pub successful: bool,

    #[serde(rename = "Vulnerabilities", default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

/// A single finding.
#[derive(Debug, Clone, Deserialize)]
pub struct Vulnerability {
    #[serde(rename = "Title", default)]
    pub title: String,

    #[serde(rename = "Severity", default)]
    pub severity: String,

    /// Scanner-specific structured details.
    #[serde(rename = "Custom", default)]
    pub custom: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

/// Scanners write `"TRUE"`/`"FALSE"`; plain booleans are accepted too.
fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => !s.trim().eq_ignore_ascii_case("false"),
    })
}

impl VulnerabilityReport {
    /// Parse a report file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// The target ID named by `UUID`.
    pub fn identity(&self) -> &str {
        let trimmed = self.target_id.trim_end_matches('/');
        let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
        normalize_id(base)
    }
}

/// Outcome for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// The scanner cannot scan this kind of target.
    Unsupported,
    /// At least one vulnerability was found.
    Vulnerable,
    Passed,
}

/// A report correlated with the scanned targets.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedReport {
    pub target_id: String,
    /// Name the user knows the target by.
    pub display_name: String,
    pub status: ReportStatus,
    pub vulnerabilities: usize,
    /// Location of the report file.
    pub path: PathBuf,
    /// Human-readable summary.
    pub text: String,
}

/// Name to show for the target with `id`.
///
/// A target scanned under a name is shown under that name. One scanned by
/// ID is shown by its `repo:tag` list when it is a tagged image, otherwise
/// by its truncated ID.
pub fn display_name(id: &str, token: Option<&str>, snapshot: &Snapshot) -> String {
    if let Some(token) = token {
        if !id.starts_with(normalize_id(token)) {
            return token.to_string();
        }
    }
    match snapshot.find(id) {
        Some(object) if object.is_image() && object.has_tags() => object.repo_tags.join(", "),
        _ => truncate_id(id).to_string(),
    }
}

/// Render nested custom fields, one entry per line.
///
/// Mapping entries print as `key: value`, or `key:` followed by the nested
/// block two columns deeper. Scalar sequence items print at the current
/// indentation.
pub fn render_custom(value: &Value, indent: usize, out: &mut String) {
    let space = " ".repeat(indent);
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if nested.is_object() || nested.is_array() {
                    let _ = writeln!(out, "{space}{key}:");
                    render_custom(nested, indent + 2, out);
                } else {
                    let _ = writeln!(out, "{space}{key}: {}", scalar(nested));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                if item.is_object() || item.is_array() {
                    render_custom(item, indent + 2, out);
                } else {
                    let _ = writeln!(out, "{space}{}", scalar(item));
                }
            }
        }
        Value::Null => {}
        other => {
            let _ = writeln!(out, "{space}{}", scalar(other));
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// Render one report under `display`.
pub fn render(report: &VulnerabilityReport, display: &str) -> (ReportStatus, String) {
    let detail = " ".repeat(DETAIL_INDENT);
    let mut text = format!("{display} ({})\n", truncate_id(report.identity()));

    let status = if !report.successful {
        let _ = writeln!(text, "{detail}{display} is not supported for this scan.");
        ReportStatus::Unsupported
    } else if !report.vulnerabilities.is_empty() {
        text.push_str("The following issues were found:\n");
        for vulnerability in &report.vulnerabilities {
            let _ = writeln!(text, "{detail}{}", vulnerability.title);
            let _ = writeln!(text, "{detail}Severity: {}", vulnerability.severity);
            if has_content(&vulnerability.custom) {
                render_custom(&vulnerability.custom, CUSTOM_INDENT, &mut text);
            }
            text.push('\n');
        }
        ReportStatus::Vulnerable
    } else {
        let _ = writeln!(text, "{display} passed the scan");
        ReportStatus::Passed
    };
    (status, text)
}

/// Find, parse and render every report below `results_dir`.
///
/// `scan_content` maps each scanned ID to the token it was requested by.
/// Reports are returned in path order.
pub fn correlate(
    results_dir: &Path,
    scan_content: &BTreeMap<String, String>,
    snapshot: &Snapshot,
) -> Result<Vec<RenderedReport>> {
    let mut reports = Vec::new();
    for entry in WalkDir::new(results_dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || entry.file_name() != REPORT_FILE_NAME {
            continue;
        }

        let report = VulnerabilityReport::from_path(entry.path())?;
        let id = report.identity().to_string();
        let token = scan_content.get(&id).map(String::as_str);
        if token.is_none() {
            tracing::warn!("report {} names unknown target {}", entry.path().display(), id);
        }
        let display = display_name(&id, token, snapshot);
        let (status, text) = render(&report, &display);
        reports.push(RenderedReport {
            target_id: id,
            display_name: display,
            status,
            vulnerabilities: report.vulnerabilities.len(),
            path: entry.path().to_path_buf(),
            text,
        });
    }
    tracing::debug!("correlated {} report(s) in {}", reports.len(), results_dir.display());
    Ok(reports)
}

/// Environment the scan ran against.
#[derive(Debug, Serialize)]
struct Environment {
    info: Value,
    images: Vec<Value>,
    containers: Vec<Value>,
}

/// Write engine info and every snapshot object's inspect document to
/// `environment.json` in `results_dir`.
///
/// Objects removed since the snapshot was taken are skipped.
pub fn record_environment(engine: &dyn Engine, snapshot: &Snapshot, results_dir: &Path) -> Result<PathBuf> {
    let inspect_all = |objects: &[ObjectRef]| -> Result<Vec<Value>> {
        let mut inspected = Vec::with_capacity(objects.len());
        for object in objects {
            match engine.inspect(object) {
                Ok(value) => inspected.push(value),
                Err(AtomicError::NotFound(_)) => {
                    tracing::warn!("{} {} disappeared during the scan", object.kind, object.short_id());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(inspected)
    };

    let environment = Environment {
        info: engine.info()?.raw,
        images: inspect_all(&snapshot.images)?,
        containers: inspect_all(&snapshot.containers)?,
    };

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    environment.serialize(&mut serializer)?;

    let path = results_dir.join(ENVIRONMENT_FILE_NAME);
    std::fs::write(&path, buf)?;
    Ok(path)
}
