//! Backup snapshots of the managed key directory.
//!
//! A snapshot is a directory `keywright-<YYYYmmdd_HHMMSS>` holding flat
//! copies of every key file plus `manifest.json`. Snapshots are written once
//! and never modified; restore only reads them.

use crate::documents::timestamp;
use crate::error::CoreError;
use crate::fsio::{atomic_write, ensure_private_dir, file_mode, sibling_pub};
use crate::permissions::{PermissionGuard, PRIVATE_KEY_MODE, PUBLIC_KEY_MODE};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SNAPSHOT_PREFIX: &str = "keywright-";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub mode: u32,
    pub sha256: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,
    pub source: PathBuf,
    pub files: Vec<ManifestEntry>,
}

#[derive(Clone, Debug)]
pub struct SnapshotReport {
    pub snapshot: PathBuf,
    pub files: Vec<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Copies the private and public files of `keys` from `source` into a new
/// snapshot under `target`.
pub fn create_snapshot(
    source: &Path,
    keys: &[String],
    target: &Path,
) -> Result<SnapshotReport, CoreError> {
    ensure_private_dir(target)?;
    let snapshot = unique_snapshot_dir(target);
    ensure_private_dir(&snapshot)?;

    let mut entries = Vec::new();
    for name in keys {
        let private = source.join(name);
        for path in [private.clone(), sibling_pub(&private)] {
            if !path.is_file() {
                continue;
            }
            let file = file_name(&path)?;
            let bytes = fs::read(&path)?;
            let mode = file_mode(&path)?;
            atomic_write(&snapshot.join(&file), &bytes, mode)?;
            entries.push(ManifestEntry {
                file,
                mode,
                sha256: sha256_hex(&bytes),
            });
        }
    }

    let manifest = Manifest {
        created: Utc::now(),
        source: source.to_path_buf(),
        files: entries,
    };
    let raw = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| CoreError::Operation(format!("manifest: {e}")))?;
    atomic_write(&snapshot.join(MANIFEST_FILE), &raw, PRIVATE_KEY_MODE)?;
    info!(snapshot = %snapshot.display(), files = manifest.files.len(), "snapshot written");
    Ok(SnapshotReport {
        snapshot,
        files: manifest.files.into_iter().map(|e| e.file).collect(),
    })
}

/// Restores a snapshot into `dest`. `source` may be a snapshot directory or
/// a directory containing snapshots, in which case the newest one is used.
///
/// Every digest is verified and every name checked before the first file is
/// written. Existing keys are only replaced when `overwrite` is set.
pub fn restore_snapshot(
    source: &Path,
    dest: &Path,
    overwrite: bool,
) -> Result<SnapshotReport, CoreError> {
    let snapshot = resolve_snapshot(source)?;
    let manifest = read_manifest(&snapshot)?;
    let guard = PermissionGuard::new();

    let mut staged = Vec::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        let stem = entry.file.strip_suffix(".pub").unwrap_or(&entry.file);
        if !guard.validate_name(stem) {
            return Err(CoreError::Validation(format!(
                "snapshot contains unexpected file {:?}",
                entry.file
            )));
        }
        let bytes = fs::read(snapshot.join(&entry.file))?;
        if sha256_hex(&bytes) != entry.sha256 {
            warn!(file = %entry.file, "snapshot digest mismatch");
            return Err(CoreError::Operation(format!(
                "digest mismatch for {} in {}",
                entry.file,
                snapshot.display()
            )));
        }
        let target = dest.join(&entry.file);
        if target.exists() && !overwrite {
            return Err(CoreError::Operation(format!(
                "{} already exists; restore with overwrite to replace it",
                target.display()
            )));
        }
        staged.push((target, bytes, restore_mode(entry)));
    }

    ensure_private_dir(dest)?;
    let mut restored = Vec::with_capacity(staged.len());
    for (target, bytes, mode) in staged {
        atomic_write(&target, &bytes, mode)?;
        restored.push(file_name(&target)?);
    }
    info!(snapshot = %snapshot.display(), files = restored.len(), "snapshot restored");
    Ok(SnapshotReport {
        snapshot,
        files: restored,
    })
}

pub fn read_manifest(snapshot: &Path) -> Result<Manifest, CoreError> {
    let path = snapshot.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|e| {
        CoreError::NotFound(format!("no manifest at {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&raw)
        .map_err(|e| CoreError::Config(format!("corrupt {}: {}", path.display(), e)))
}

fn resolve_snapshot(source: &Path) -> Result<PathBuf, CoreError> {
    if source.join(MANIFEST_FILE).is_file() {
        return Ok(source.to_path_buf());
    }
    let entries = fs::read_dir(source)
        .map_err(|e| CoreError::NotFound(format!("{}: {}", source.display(), e)))?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(SNAPSHOT_PREFIX))
                && p.join(MANIFEST_FILE).is_file()
        })
        .collect();
    candidates.sort();
    candidates
        .pop()
        .ok_or_else(|| CoreError::NotFound(format!("no snapshot found in {}", source.display())))
}

fn unique_snapshot_dir(target: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let base = target.join(format!("{SNAPSHOT_PREFIX}{stamp}"));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| target.join(format!("{SNAPSHOT_PREFIX}{stamp}_{n}")))
        .find(|p| !p.exists())
        .unwrap_or(base)
}

/// Recorded bits, never looser than the role allows.
fn restore_mode(entry: &ManifestEntry) -> u32 {
    let ceiling = if entry.file.ends_with(".pub") {
        PUBLIC_KEY_MODE
    } else {
        PRIVATE_KEY_MODE
    };
    entry.mode & ceiling
}

fn file_name(path: &Path) -> Result<String, CoreError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::Validation(format!("bad file name {}", path.display())))
}
