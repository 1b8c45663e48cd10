//! Integration tests against a real podman.
//!
//! These verify that the podman engine agrees with `podman` itself about
//! what is in local storage, and that mounted images expose their root
//! filesystem.

use anyhow::{Context, Result};
use tempfile::TempDir;
use xshell::{Shell, cmd};

use atomic_rs::engine::podman::PodmanEngine;
use atomic_rs::{Engine, MountOptions, Snapshot, mount_target, resolve, unmount_target};

/// Test image name to use
const TEST_IMAGE: &str = "busybox";

/// Create a new xshell Shell instance
fn shell() -> Result<Shell> {
    Shell::new().context("Failed to create xshell Shell")
}

/// Ensure test image exists in local storage
fn ensure_test_image() -> Result<()> {
    let sh = shell()?;
    let output = cmd!(sh, "podman images -q {TEST_IMAGE}")
        .ignore_status()
        .output()?;

    if output.stdout.is_empty() {
        eprintln!("Pulling test image: {}", TEST_IMAGE);
        cmd!(sh, "podman pull {TEST_IMAGE}").run()?;
    }

    Ok(())
}

/// Get the full image ID for an image name
fn get_image_id(sh: &Shell, image_name: &str) -> Result<String> {
    let output = cmd!(sh, "podman images -q --no-trunc {image_name}").read()?;
    let id = output.trim();
    Ok(id.strip_prefix("sha256:").unwrap_or(id).to_string())
}

#[test]
#[ignore] // Requires podman and test image
fn test_resolve_matches_podman() -> Result<()> {
    let sh = shell()?;
    ensure_test_image().context("Failed to ensure test image")?;
    let image_id = get_image_id(&sh, TEST_IMAGE)?;

    let engine = PodmanEngine::new("podman");
    let snapshot = Snapshot::capture(&engine)?;

    let by_name = resolve(TEST_IMAGE, &snapshot)?;
    assert_eq!(by_name.object.id, image_id);
    assert!(!by_name.is_id_form());

    let by_prefix = resolve(&image_id[..12], &snapshot)?;
    assert_eq!(by_prefix.object, by_name.object);

    let inspect = engine.inspect_image(&image_id)?;
    assert!(inspect.get("Config").is_some());

    Ok(())
}

#[test]
#[ignore] // Requires podman and test image
fn test_cli_resolve_json() -> Result<()> {
    let sh = shell()?;
    ensure_test_image().context("Failed to ensure test image")?;
    let image_id = get_image_id(&sh, TEST_IMAGE)?;

    let output = cmd!(
        sh,
        "cargo run --bin atomic-rs -- resolve {TEST_IMAGE} --format json"
    )
    .read()?;
    let resolved: serde_json::Value = serde_json::from_str(&output)?;
    assert_eq!(resolved[0]["kind"], "image");
    assert_eq!(resolved[0]["id"], image_id.as_str());

    Ok(())
}

#[test]
#[ignore] // Requires root, podman and test image
fn test_mount_exposes_rootfs() -> Result<()> {
    ensure_test_image().context("Failed to ensure test image")?;

    let engine = PodmanEngine::new("podman");
    let snapshot = Snapshot::capture(&engine)?;
    let target = resolve(TEST_IMAGE, &snapshot)?;

    let temp_dir = TempDir::new().context("Failed to create temp dir")?;
    let mountpoint = temp_dir.path();

    mount_target(&engine, &target.object, mountpoint, &MountOptions::default(), true)?;
    let has_shell = mountpoint.join("bin/sh").exists();
    let write_denied = std::fs::write(mountpoint.join("write-test"), b"x").is_err();
    assert!(unmount_target(&engine, mountpoint, true)?);

    assert!(has_shell, "mounted image should contain /bin/sh");
    assert!(write_denied, "default mounts should be read-only");
    assert!(!mountpoint.join("bin/sh").exists());

    Ok(())
}
