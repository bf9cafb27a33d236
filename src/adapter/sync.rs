//! Sync gate and source upload.
//!
//! Decides whether a push needs a sync + exec cycle at all, locates the one
//! container that owns the shared source volume, and ships changed files into
//! it as a tar archive. The change set itself arrives pre-computed and
//! ignore-filtered from the caller; the ignore globs are only applied here
//! when the full tree is walked (first push or forced build).

use crate::adapter::{AdapterError, PushParameters, Result};
use crate::devfile::ContainerUnit;
use crate::runtime::{ContainerInfo, ExecSpec, Runtime};
use crate::labels;
use bytes::Bytes;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Locate the sync destination: the first declared unit (declaration order,
/// deterministic) whose observed container mounts the source volume.
///
/// Multiplicity is fine — the volume is shared, one sync reaches all units —
/// but absence is fatal: there is nowhere to put the files.
pub(crate) fn locate_sync_target(
    units: &[ContainerUnit],
    containers: &[ContainerInfo],
    source_volume: &str,
) -> Result<(String, String)> {
    for unit in units.iter().filter(|u| u.mount_sources) {
        let Some(container) = containers
            .iter()
            .find(|c| c.label(labels::ALIAS) == Some(unit.name.as_str()))
        else {
            continue;
        };
        if let Some(mount) = container.mounts.iter().find(|m| m.name == source_volume) {
            return Ok((container.id.clone(), mount.target.clone()));
        }
    }
    Err(AdapterError::NoMountedSourceVolume)
}

/// Sync the change set into the target container if a cycle is required.
/// Returns whether command execution should follow.
pub(crate) async fn sync_files(
    runtime: &dyn Runtime,
    parameters: &PushParameters,
    target_container: &str,
    source_mount: &str,
    component_exists: bool,
) -> Result<bool> {
    let full_sync = !component_exists || parameters.force_build;
    if !full_sync
        && parameters.watch_files.is_empty()
        && parameters.watch_deleted_files.is_empty()
    {
        debug!("no file changes and no force; skipping sync cycle");
        return Ok(false);
    }

    if !parameters.watch_deleted_files.is_empty() {
        remove_deleted_files(
            runtime,
            parameters,
            target_container,
            source_mount,
        )
        .await?;
    }

    let archive = if full_sync {
        build_full_archive(&parameters.path, &parameters.ignored_files)?
    } else {
        build_changed_archive(&parameters.path, &parameters.watch_files)?
    };

    if !archive.is_empty() {
        runtime
            .upload_archive(target_container, source_mount, Bytes::from(archive))
            .await?;
    }

    Ok(true)
}

async fn remove_deleted_files(
    runtime: &dyn Runtime,
    parameters: &PushParameters,
    target_container: &str,
    source_mount: &str,
) -> Result<()> {
    let mut remote_paths = Vec::new();
    for deleted in &parameters.watch_deleted_files {
        if let Some(rel) = relative_to(deleted, &parameters.path) {
            remote_paths.push(format!("{}/{}", source_mount, rel.display()));
        }
    }
    if remote_paths.is_empty() {
        return Ok(());
    }

    debug!("removing {} deleted files from container", remote_paths.len());
    let mut command = vec!["rm".to_string(), "-rf".to_string()];
    command.extend(remote_paths);
    let spec = ExecSpec {
        command,
        ..Default::default()
    };
    runtime.exec(target_container, &spec, None).await?;
    Ok(())
}

fn relative_to(path: &Path, root: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}

fn build_ignore_set(ignores: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in ignores {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("skipping invalid ignore pattern {}: {}", pattern, e),
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Tar the whole source tree, minus ignore matches.
fn build_full_archive(root: &Path, ignores: &[String]) -> Result<Vec<u8>> {
    let ignore_set = build_ignore_set(ignores);
    let mut builder = tar::Builder::new(Vec::new());

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_to(entry.path(), root) else {
            continue;
        };
        if ignore_set.is_match(&rel) {
            continue;
        }
        builder
            .append_path_with_name(entry.path(), &rel)
            .map_err(crate::runtime::RuntimeError::Io)?;
    }

    Ok(builder
        .into_inner()
        .map_err(crate::runtime::RuntimeError::Io)?)
}

/// Tar exactly the changed files, preserving their paths relative to the
/// source root. Files that vanished since the change set was computed are
/// skipped rather than failing the push.
fn build_changed_archive(root: &Path, changed: &[PathBuf]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut appended = false;

    for path in changed {
        if !path.is_file() {
            continue;
        }
        let Some(rel) = relative_to(path, root) else {
            continue;
        };
        builder
            .append_path_with_name(path, &rel)
            .map_err(crate::runtime::RuntimeError::Io)?;
        appended = true;
    }

    if !appended {
        return Ok(Vec::new());
    }
    Ok(builder
        .into_inner()
        .map_err(crate::runtime::RuntimeError::Io)?)
}
