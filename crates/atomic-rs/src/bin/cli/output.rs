//! Output formatting utilities for the CLI.
//!
//! Every listing command supports human-readable table output and
//! machine-parseable JSON, selected with `--format`. Entry types derive
//! both `Serialize` (JSON) and `Facet` (tables, see [`super::table`]).

use clap::ValueEnum;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use facet::Facet;
use serde::Serialize;

use atomic_rs::engine::truncate_id;
use atomic_rs::{InstallRecord, LayerVersion, ObjectRef, ReportStatus, ResolvedTarget, ScanRunResult};

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-parseable JSON format.
    Json,
}

/// Image list entry, one per `repo:tag`.
#[derive(Debug, Serialize, Facet)]
pub struct ImageListEntry {
    pub repository: String,
    pub tag: String,
    /// Truncated image ID (12 characters).
    pub id: String,
    pub full_id: String,
    /// Untagged, and so removed by `images --prune`.
    pub dangling: bool,
}

impl ImageListEntry {
    /// Entries for an image; an untagged image gets a single `<none>` row.
    pub fn from_image(image: &ObjectRef) -> Vec<Self> {
        let entry = |repository: &str, tag: &str| Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            id: truncate_id(&image.id).to_string(),
            full_id: image.id.clone(),
            dangling: !image.has_tags(),
        };
        if image.repo_tags.is_empty() {
            return vec![entry("<none>", "<none>")];
        }
        image
            .repo_tags
            .iter()
            .map(|repo_tag| {
                let (repository, tag) = split_repo_tag(repo_tag);
                entry(repository, tag)
            })
            .collect()
    }
}

/// Container list entry.
#[derive(Debug, Serialize, Facet)]
pub struct ContainerListEntry {
    pub id: String,
    pub full_id: String,
    pub names: String,
}

impl From<&ObjectRef> for ContainerListEntry {
    fn from(container: &ObjectRef) -> Self {
        Self {
            id: truncate_id(&container.id).to_string(),
            full_id: container.id.clone(),
            names: container
                .names
                .iter()
                .map(|n| n.trim_start_matches('/'))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// One resolved token. The ID stays untruncated; scripts feed it back to
/// the engine.
#[derive(Debug, Serialize, Facet)]
pub struct ResolveEntry {
    pub token: String,
    pub kind: String,
    pub id: String,
}

impl From<&ResolvedTarget> for ResolveEntry {
    fn from(target: &ResolvedTarget) -> Self {
        Self {
            token: target.matched_token.clone(),
            kind: target.object.kind.to_string(),
            id: target.object.id.clone(),
        }
    }
}

/// One install ledger record.
#[derive(Debug, Serialize, Facet)]
pub struct LedgerEntry {
    pub id: String,
    pub full_id: String,
    pub image_name: String,
    pub date: String,
}

impl From<(String, InstallRecord)> for LedgerEntry {
    fn from((id, record): (String, InstallRecord)) -> Self {
        Self {
            id: truncate_id(&id).to_string(),
            full_id: id,
            image_name: record.image_name,
            date: record.date,
        }
    }
}

/// One image label, for `info`.
#[derive(Debug, Serialize, Facet)]
pub struct LabelEntry {
    pub label: String,
    pub value: String,
}

/// One layer of `version` output.
#[derive(Debug, Serialize, Facet)]
pub struct VersionEntry {
    pub id: String,
    pub full_id: String,
    pub version: String,
    pub tag: Option<String>,
}

impl From<LayerVersion> for VersionEntry {
    fn from(layer: LayerVersion) -> Self {
        Self {
            id: truncate_id(&layer.id).to_string(),
            full_id: layer.id,
            version: layer.version,
            tag: layer.tag,
        }
    }
}

/// Totals of a finished scan.
#[derive(Debug, Serialize, Facet)]
pub struct ScanSummary {
    pub scanner: String,
    pub targets: usize,
    pub vulnerable: usize,
    pub results_dir: String,
}

impl From<&ScanRunResult> for ScanSummary {
    fn from(result: &ScanRunResult) -> Self {
        Self {
            scanner: result.scanner.clone(),
            targets: result.targets.len(),
            vulnerable: result
                .reports
                .iter()
                .filter(|r| r.status == ReportStatus::Vulnerable)
                .count(),
            results_dir: result.results_dir.display().to_string(),
        }
    }
}

/// Split `repo:tag`, leaving a registry port in the repository.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(split_repo_tag("nginx:latest"), ("nginx", "latest"));
/// assert_eq!(split_repo_tag("localhost:5000/app"), ("localhost:5000/app", "<none>"));
/// ```
pub fn split_repo_tag(repo_tag: &str) -> (&str, &str) {
    match repo_tag.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (repo_tag, "<none>"),
    }
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Output a single item in the specified format.
///
/// Tables list the item's fields as `Field`/`Value` rows.
pub fn output_item<'a, T>(item: &T, format: OutputFormat) -> Result<(), serde_json::Error>
where
    T: Serialize + Facet<'a>,
{
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(item)?);
        }
        OutputFormat::Table => {
            println!("{}", super::table::table_from_item(item));
        }
    }
    Ok(())
}

/// Output a slice of items in the specified format.
pub fn output_slice<'a, T>(items: &[T], format: OutputFormat) -> Result<(), serde_json::Error>
where
    T: Serialize + Facet<'a>,
{
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(items)?);
        }
        OutputFormat::Table => {
            println!("{}", super::table::table_from_slice(items));
        }
    }
    Ok(())
}

/// Output a single serializable value as pretty JSON.
pub fn output_json<T: Serialize>(item: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_repo_tag() {
        assert_eq!(split_repo_tag("nginx:latest"), ("nginx", "latest"));
        assert_eq!(
            split_repo_tag("registry.example.com:5000/rhel7/rsyslog:7.2"),
            ("registry.example.com:5000/rhel7/rsyslog", "7.2")
        );
        assert_eq!(
            split_repo_tag("localhost:5000/app"),
            ("localhost:5000/app", "<none>")
        );
    }

    #[test]
    fn test_image_entries_per_tag() {
        let image = ObjectRef::image("abc123def456789", ["nginx:latest", "web:prod"]);
        let entries = ImageListEntry::from_image(&image);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].repository, "web");
        assert_eq!(entries[0].id, "abc123def456");

        assert!(!entries[0].dangling);

        let untagged = ObjectRef::image("abc", Vec::<String>::new());
        let entries = ImageListEntry::from_image(&untagged);
        assert_eq!(entries[0].tag, "<none>");
        assert!(entries[0].dangling);
    }

    #[test]
    fn test_container_entry_names() {
        let container = ObjectRef::container("c0ffee", ["/web", "alias"]);
        assert_eq!(ContainerListEntry::from(&container).names, "web, alias");
    }

    #[test]
    fn test_ledger_entry_truncates_id() {
        let record = InstallRecord {
            installed: true,
            image_name: "rhel7/rsyslog".to_string(),
            date: "2024-05-01 12:30:00.123456".to_string(),
        };
        let entry = LedgerEntry::from(("abc123def456789".to_string(), record));
        assert_eq!(entry.id, "abc123def456");
        assert_eq!(entry.full_id, "abc123def456789");
    }

    #[test]
    fn test_version_entry_from_layer() {
        let entry = VersionEntry::from(LayerVersion {
            id: "bbb222bbb222bbb222".to_string(),
            version: "fedora-30-1".to_string(),
            tag: Some("fedora:latest".to_string()),
        });
        assert_eq!(entry.id, "bbb222bbb222");
        assert_eq!(entry.tag.as_deref(), Some("fedora:latest"));
    }
}
