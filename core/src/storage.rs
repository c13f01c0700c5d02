/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Layout of the builds root.
//!
//! ```text
//! <root>/<brid>/build.json
//! <root>/<brid>/in/<basename>
//! <root>/<brid>/out/<platform>/<basename>
//! ```

use super::consts::*;
use super::input::{InputError, validate_segment};
use anyhow::{Context, Result};
use entity::BuildRequestSnapshot;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to encode manifest of request {brid}: {source}")]
    Manifest {
        brid: String,
        source: serde_json::Error,
    },
}

pub fn request_dir(root: &Path, brid: &str) -> Result<PathBuf, InputError> {
    Ok(root.join(validate_segment("request id", brid)?))
}

pub fn input_path(root: &Path, brid: &str, basename: &str) -> Result<PathBuf, InputError> {
    Ok(request_dir(root, brid)?
        .join(INPUT_DIR)
        .join(validate_segment("file name", basename)?))
}

pub fn output_path(
    root: &Path,
    brid: &str,
    platform: &str,
    basename: &str,
) -> Result<PathBuf, InputError> {
    Ok(request_dir(root, brid)?
        .join(OUTPUT_DIR)
        .join(validate_segment("platform", platform)?)
        .join(validate_segment("file name", basename)?))
}

/// Writes `data` next to `path` and renames it into place, so a reader never
/// sees a partially written item.
pub async fn write_file(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let write_err = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    fs::write(&partial, data).await.map_err(write_err)?;
    fs::rename(&partial, path).await.map_err(write_err)?;

    debug!(path = %path.display(), bytes = data.len(), "Stored file");
    Ok(())
}

pub async fn read_file(path: &Path) -> Result<Vec<u8>, StorageError> {
    fs::read(path).await.map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn write_manifest(
    root: &Path,
    snapshot: &BuildRequestSnapshot,
) -> Result<PathBuf, StorageError> {
    let path = request_dir(root, &snapshot.brid)?.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(snapshot).map_err(|source| StorageError::Manifest {
        brid: snapshot.brid.clone(),
        source,
    })?;

    write_file(&path, &json).await?;
    Ok(path)
}

/// Reads every `<root>/*/build.json`, oldest request first.
///
/// Unreadable manifests are skipped with a warning.
pub async fn load_manifests(root: &Path) -> Result<Vec<BuildRequestSnapshot>> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read builds root {}", root.display()));
        }
    };

    let mut manifests = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .context("Failed to list builds root")?
    {
        let path = entry.path().join(MANIFEST_FILE);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }

        match parse_manifest(&path).await {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
        }
    }

    manifests.sort_by_key(|manifest| manifest.created_at);
    Ok(manifests)
}

async fn parse_manifest(path: &Path) -> Result<BuildRequestSnapshot> {
    let data = read_file(path).await?;
    serde_json::from_slice(&data).with_context(|| format!("Invalid manifest {}", path.display()))
}

pub async fn remove_request_dir(root: &Path, brid: &str) -> Result<(), StorageError> {
    remove_dir(request_dir(root, brid)?).await
}

/// Removes the artifacts one platform produced for a request.
pub async fn remove_output_dir(root: &Path, brid: &str, platform: &str) -> Result<(), StorageError> {
    let dir = request_dir(root, brid)?
        .join(OUTPUT_DIR)
        .join(validate_segment("platform", platform)?);
    remove_dir(dir).await
}

async fn remove_dir(dir: PathBuf) -> Result<(), StorageError> {
    match fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::Write { path: dir, source }),
    }
}
