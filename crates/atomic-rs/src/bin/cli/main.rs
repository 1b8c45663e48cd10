//! atomic-rs CLI.
//!
//! Resolve, mount and scan container images and containers, and run their
//! label-declared install/run/stop/uninstall commands.

mod output;
mod table;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use atomic_rs::engine::podman::PodmanEngine;
use atomic_rs::{
    Config, Engine, LabelCommand, Ledger, Lifecycle, MountOptions, ScanOrchestrator, Selection,
    Snapshot, mount_target, privilege, resolve, resolve_all, unmount_target,
};
use output::{
    ContainerListEntry, ImageListEntry, LabelEntry, LedgerEntry, OutputFormat, ResolveEntry,
    ScanSummary, VersionEntry, output_item, output_json, output_slice,
};

/// Container image scanning and lifecycle tool
#[derive(Parser)]
#[command(name = "atomic-rs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (default: $ATOMIC_CONFIG or /etc/atomic.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging; `scan` also keeps its staging directories
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List images
    Images {
        /// Include intermediate images
        #[arg(short, long)]
        all: bool,
        /// Remove dangling (untagged) images instead of listing
        #[arg(long)]
        prune: bool,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// List containers
    #[command(visible_alias = "ps")]
    Containers {
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Resolve identifiers to images or containers
    ///
    /// Each identifier may be an ID prefix, a `registry/repo:tag` pattern
    /// (with `*` wildcards), or a container name.
    Resolve {
        /// Identifiers to resolve
        #[arg(required = true)]
        targets: Vec<String>,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Mount an image or container filesystem read-only
    Mount {
        /// Image or container identifier
        target: String,
        /// Directory to mount at
        mountpoint: PathBuf,
        /// Comma-separated mount options (`rw`, `ro`)
        #[arg(short, long, default_value = "")]
        options: String,
    },

    /// Unmount a filesystem mounted with `mount`
    Unmount {
        /// Directory to unmount
        mountpoint: PathBuf,
    },

    /// Scan images or containers with an external scanner image
    Scan {
        /// Identifiers to scan
        #[arg(conflicts_with_all = ["images", "containers", "all"])]
        targets: Vec<String>,
        /// Scan every image
        #[arg(long, conflicts_with_all = ["containers", "all"])]
        images: bool,
        /// Scan every container
        #[arg(long, conflicts_with = "all")]
        containers: bool,
        /// Scan every container and image
        #[arg(long)]
        all: bool,
        /// Scanner to use (default: `default_scanner` from the config)
        #[arg(long)]
        scanner: Option<String>,
        /// List configured scanners and exit
        #[arg(long)]
        list: bool,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Run an image's INSTALL command and record the install
    Install {
        /// Image identifier
        image: String,
        /// Name substituted for ${NAME}
        #[arg(short, long)]
        name: Option<String>,
        /// Print the command instead of executing it
        #[arg(long)]
        display: bool,
        /// Extra arguments appended to the command
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Run an image's RUN command
    Run {
        /// Image identifier
        image: String,
        /// Name substituted for ${NAME}
        #[arg(short, long)]
        name: Option<String>,
        /// Run as a super-privileged container
        #[arg(long)]
        spc: bool,
        /// Do not require a recorded install
        #[arg(long)]
        nocheck: bool,
        /// Print the command instead of executing it
        #[arg(long)]
        display: bool,
        /// Command to run inside the container
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Run a container's STOP command and stop it
    Stop {
        /// Image identifier
        image: String,
        /// Name of the container (default: derived from the image)
        #[arg(short, long)]
        name: Option<String>,
        /// Print the command instead of executing it
        #[arg(long)]
        display: bool,
        /// Extra arguments appended to the command
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Run an image's UNINSTALL command, remove its container and forget
    /// the install
    Uninstall {
        /// Image identifier
        image: String,
        /// Name substituted for ${NAME}
        #[arg(short, long)]
        name: Option<String>,
        /// Remove containers created from the image first
        #[arg(short, long)]
        force: bool,
        /// Extra arguments appended to the command
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Show the labels of an image
    Info {
        /// Image identifier
        image: String,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the Name-Version-Release of an image
    Version {
        /// Image identifier
        image: String,
        /// Also show every parent layer
        #[arg(short, long)]
        recurse: bool,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Check an image's layers against newer local images of the same name
    Verify {
        /// Image identifier
        image: String,
    },

    /// List images recorded as installed
    Installed {
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        "atomic_rs=debug"
    } else {
        "atomic_rs=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = if let Some(path) = &cli.config {
        Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
    } else {
        Config::discover().context("Failed to load configuration")?
    };
    let engine =
        PodmanEngine::new(&config.engine.binary).with_state_dir(&config.paths.staging_root);
    let ledger = Ledger::new(&config.paths.install_ledger);

    match cli.command {
        Commands::Images { all, prune, format } => {
            if prune {
                prune_images(&engine)?;
            } else {
                list_images(&engine, all, format)?;
            }
        }
        Commands::Containers { format } => list_containers(&engine, format)?,
        Commands::Resolve { targets, format } => resolve_targets(&engine, &targets, format)?,
        Commands::Mount {
            target,
            mountpoint,
            options,
        } => mount(&engine, &target, &mountpoint, &options)?,
        Commands::Unmount { mountpoint } => unmount(&engine, &mountpoint)?,
        Commands::Scan {
            targets,
            images,
            containers,
            all,
            scanner,
            list,
            format,
        } => {
            if list {
                list_scanners(&config);
                return Ok(ExitCode::SUCCESS);
            }
            let selection = if all {
                Selection::All
            } else if images {
                Selection::AllImages
            } else if containers {
                Selection::AllContainers
            } else if targets.is_empty() {
                bail!("no scan targets given; pass identifiers, --images, --containers or --all");
            } else {
                Selection::Targets(targets)
            };
            return scan(&engine, &config, &selection, scanner.as_deref(), cli.debug, format);
        }
        Commands::Install {
            image,
            name,
            display,
            args,
        } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let command = if display {
                lifecycle.plan_install(&snapshot, &image, name.as_deref(), &args)?.1
            } else {
                lifecycle
                    .install(&snapshot, &image, name.as_deref(), &args)
                    .with_context(|| format!("Failed to install {}", image))?
            };
            execute(&command, display)?;
        }
        Commands::Run {
            image,
            name,
            spc,
            nocheck,
            display,
            command,
        } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let plan = lifecycle
                .run(&snapshot, &image, name.as_deref(), &command, spc, nocheck)
                .with_context(|| format!("Failed to run {}", image))?;
            if plan.commands.is_empty() {
                if let Some(existing) = &plan.existing {
                    println!("Container {} is already running", existing.name);
                }
            }
            for command in &plan.commands {
                execute(command, display)?;
            }
        }
        Commands::Stop {
            image,
            name,
            display,
            args,
        } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let plan = lifecycle
                .stop(&snapshot, &image, name.as_deref(), &args)
                .with_context(|| format!("Failed to stop {}", image))?;
            if let Some(command) = &plan.command {
                execute(command, display)?;
            }
            if !display {
                lifecycle
                    .complete_stop(&plan)
                    .with_context(|| format!("Failed to stop {}", image))?;
            }
        }
        Commands::Uninstall {
            image,
            name,
            force,
            args,
        } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let plan = lifecycle
                .uninstall(&snapshot, &image, name.as_deref(), &args, force)
                .with_context(|| format!("Failed to uninstall {}", image))?;
            match &plan.command {
                Some(command) => execute(command, false)?,
                None => println!("{} has no UNINSTALL label", image),
            }
            lifecycle
                .complete_uninstall(&plan)
                .with_context(|| format!("Failed to uninstall {}", image))?;
        }
        Commands::Info { image, format } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let entries: Vec<LabelEntry> = lifecycle
                .info(&snapshot, &image)
                .with_context(|| format!("Failed to inspect {}", image))?
                .into_iter()
                .map(|(label, value)| LabelEntry { label, value })
                .collect();
            output_slice(&entries, format).context("Failed to output labels")?;
        }
        Commands::Version {
            image,
            recurse,
            format,
        } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let entries: Vec<VersionEntry> = lifecycle
                .version(&snapshot, &image, recurse)
                .with_context(|| format!("Failed to inspect {}", image))?
                .into_iter()
                .map(VersionEntry::from)
                .collect();
            output_slice(&entries, format).context("Failed to output versions")?;
        }
        Commands::Verify { image } => {
            let snapshot = capture(&engine)?;
            let lifecycle = Lifecycle::new(&engine, &ledger, &config.engine.binary);
            let outdated = lifecycle
                .verify(&snapshot, &image)
                .with_context(|| format!("Failed to verify {}", image))?;
            if outdated.is_empty() {
                println!("{} is up to date", image);
            }
            for layer in &outdated {
                println!(
                    "Image '{}' contains a layer '{}' that is out of date.",
                    image, layer.layer.version
                );
                println!(
                    "Image version '{}' is available, current version could contain vulnerabilities.",
                    layer.available
                );
            }
            if !outdated.is_empty() {
                println!("You should rebuild the '{}' image.", image);
            }
        }
        Commands::Installed { format } => {
            let entries: Vec<LedgerEntry> =
                ledger.entries().into_iter().map(LedgerEntry::from).collect();
            output_slice(&entries, format).context("Failed to output install records")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn capture(engine: &dyn Engine) -> Result<Snapshot> {
    Snapshot::capture(engine).context("Failed to query the container engine")
}

/// List images
fn list_images(engine: &dyn Engine, all: bool, format: OutputFormat) -> Result<()> {
    let images = engine.list_images(all).context("Failed to list images")?;
    let entries: Vec<ImageListEntry> = images.iter().flat_map(ImageListEntry::from_image).collect();
    output_slice(&entries, format).context("Failed to output images")?;
    Ok(())
}

/// Remove every untagged image
fn prune_images(engine: &dyn Engine) -> Result<()> {
    let images = engine.list_images(false).context("Failed to list images")?;
    for image in images.iter().filter(|image| !image.has_tags()) {
        engine
            .remove(image, true)
            .with_context(|| format!("Failed to remove {}", image.short_id()))?;
        println!("{}", image.short_id());
    }
    Ok(())
}

/// List containers
fn list_containers(engine: &dyn Engine, format: OutputFormat) -> Result<()> {
    let containers = engine
        .list_containers(true)
        .context("Failed to list containers")?;
    let entries: Vec<ContainerListEntry> = containers.iter().map(ContainerListEntry::from).collect();
    output_slice(&entries, format).context("Failed to output containers")?;
    Ok(())
}

fn resolve_targets(engine: &dyn Engine, targets: &[String], format: OutputFormat) -> Result<()> {
    let snapshot = capture(engine)?;
    let resolved = resolve_all(targets, &snapshot)?;
    let entries: Vec<ResolveEntry> = resolved.iter().map(ResolveEntry::from).collect();
    output_slice(&entries, format).context("Failed to output resolved targets")?;
    Ok(())
}

fn mount(engine: &dyn Engine, target: &str, mountpoint: &Path, options: &str) -> Result<()> {
    let snapshot = capture(engine)?;
    let target = resolve(target, &snapshot)?;
    let options = MountOptions::parse(options);
    mount_target(
        engine,
        &target.object,
        mountpoint,
        &options,
        privilege::can_mount(),
    )
    .with_context(|| format!("Failed to mount {} at {}", target.matched_token, mountpoint.display()))?;
    Ok(())
}

fn unmount(engine: &dyn Engine, mountpoint: &Path) -> Result<()> {
    let unmounted = unmount_target(engine, mountpoint, privilege::can_mount())
        .with_context(|| format!("Failed to unmount {}", mountpoint.display()))?;
    if !unmounted {
        bail!("{} is not mounted", mountpoint.display());
    }
    Ok(())
}

fn list_scanners(config: &Config) {
    for name in config.scanners.keys() {
        let marker = if config.default_scanner.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        match config.scanner(name) {
            Ok(scanner) => println!("{}{}: {}", name, marker, scanner.image_name),
            Err(e) => println!("{}{}: invalid: {}", name, marker, e),
        }
    }
}

fn scan(
    engine: &dyn Engine,
    config: &Config,
    selection: &Selection,
    scanner: Option<&str>,
    debug: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let result = ScanOrchestrator::new(engine, config)
        .with_debug(debug)
        .run(selection, scanner)
        .context("Scan failed")?;

    match format {
        OutputFormat::Json => output_json(&result).context("Failed to output scan result")?,
        OutputFormat::Table => {
            for report in &result.reports {
                print!("{}", report.text);
            }
            println!();
            output_item(&ScanSummary::from(&result), format)
                .context("Failed to output scan summary")?;
            println!("Files associated with this scan are in {}.", result.results_dir.display());
        }
    }

    if result.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Print a planned command and, unless only displaying, run it.
fn execute(command: &LabelCommand, display: bool) -> Result<()> {
    println!("{}", command);
    if display {
        return Ok(());
    }
    let mut cmd = command
        .command()
        .ok_or_else(|| anyhow!("planned command is empty"))?;
    let status = cmd
        .status()
        .with_context(|| format!("Failed to execute {}", command))?;
    if !status.success() {
        bail!("{} exited with {}", command, status);
    }
    Ok(())
}
