//! Staging and atomic placement of package directories.
//!
//! A package is first materialised in `<parent>/.<name>.staging-<n>`, next
//! to its target, so that the final step is a rename on one filesystem.
//! An existing target is moved aside to `<parent>/.<name>.old-<n>` and its
//! nested `modules/` directory is carried into the new tree before the
//! backup is dropped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};

use crate::archive::{ArchiveExtractor, ArchiveExtractorImpl};
use crate::cleanup::{CleanupGuard, SharedCleanupContext};
use crate::endpoint::FetchedArtifact;
use crate::runtime::{Runtime, relative_symlink_path};

const STAGING_MARKER: &str = ".staging-";
const BACKUP_MARKER: &str = ".old-";
const TEMP_EXTRACT_SUFFIX: &str = "_temp_extract";

fn sibling(target: &Path, marker: &str, n: u64) -> Result<PathBuf> {
    let name = target
        .file_name()
        .with_context(|| format!("Invalid install path {:?}", target))?;
    Ok(target.with_file_name(format!(".{}{}{}", name.to_string_lossy(), marker, n)))
}

pub fn staging_path(target: &Path, n: u64) -> Result<PathBuf> {
    sibling(target, STAGING_MARKER, n)
}

pub fn backup_path(target: &Path, n: u64) -> Result<PathBuf> {
    sibling(target, BACKUP_MARKER, n)
}

/// Materialise `artifact` at `staging`. Returns whether the result is a symlink.
#[tracing::instrument(skip(runtime, extractor, cleanup))]
pub fn stage<R: Runtime + 'static>(
    runtime: &R,
    extractor: &ArchiveExtractorImpl,
    artifact: &FetchedArtifact,
    staging: &Path,
    link_local: bool,
    cleanup: SharedCleanupContext,
) -> Result<bool> {
    match artifact {
        FetchedArtifact::Archive(archive) => {
            extractor.extract_with_cleanup(runtime, archive, staging, cleanup)?;
            Ok(false)
        }
        FetchedArtifact::Directory(dir) => {
            runtime
                .copy_dir_all(dir, staging)
                .with_context(|| format!("Failed to copy {:?} to {:?}", dir, staging))?;
            Ok(false)
        }
        FetchedArtifact::Local(dir) if link_local => {
            let link_target = relative_symlink_path(staging, dir).unwrap_or_else(|| dir.clone());
            debug!("Linking {:?} -> {:?}", staging, link_target);
            runtime.symlink(&link_target, staging)?;
            Ok(true)
        }
        FetchedArtifact::Local(dir) => {
            runtime
                .copy_dir_all(dir, staging)
                .with_context(|| format!("Failed to copy {:?} to {:?}", dir, staging))?;
            Ok(false)
        }
    }
}

/// Delete whatever is installed at `path`: symlink, directory or file.
pub fn remove_installed<R: Runtime + ?Sized>(runtime: &R, path: &Path) -> Result<()> {
    if runtime.is_symlink(path) {
        runtime.remove_symlink(path)
    } else if runtime.is_dir(path) {
        runtime.remove_dir_all(path)
    } else if runtime.exists(path) {
        runtime.remove_file(path)
    } else {
        Ok(())
    }
}

fn occupied<R: Runtime + ?Sized>(runtime: &R, path: &Path) -> bool {
    runtime.exists(path) || runtime.is_symlink(path)
}

/// Replace `target` with `staging`.
///
/// Nested packages under the old target's `modules_dir` move into the new
/// tree unless the new tree is a symlink or ships its own `modules_dir`.
#[tracing::instrument(skip(runtime))]
pub fn swap<R: Runtime + ?Sized>(
    runtime: &R,
    staging: &Path,
    target: &Path,
    backup: &Path,
    modules_dir: &str,
) -> Result<()> {
    let had_target = occupied(runtime, target);
    if had_target {
        runtime
            .rename(target, backup)
            .with_context(|| format!("Failed to move {:?} aside", target))?;

        let old_nested = backup.join(modules_dir);
        let new_nested = staging.join(modules_dir);
        if !runtime.is_symlink(backup)
            && !runtime.is_symlink(staging)
            && runtime.is_dir(&old_nested)
            && !runtime.exists(&new_nested)
            && let Err(e) = runtime.rename(&old_nested, &new_nested)
        {
            restore(runtime, backup, target);
            return Err(e.context(format!("Failed to carry nested packages of {:?}", target)));
        }
    }

    if let Err(e) = runtime.rename(staging, target) {
        if had_target {
            restore(runtime, backup, target);
        }
        return Err(e.context(format!("Failed to move {:?} into place", staging)));
    }

    if had_target && let Err(e) = remove_installed(runtime, backup) {
        warn!("Failed to remove backup {:?}: {:#}", backup, e);
    }
    Ok(())
}

fn restore<R: Runtime + ?Sized>(runtime: &R, backup: &Path, target: &Path) {
    if let Err(e) = runtime.rename(backup, target) {
        warn!("Failed to restore {:?} from {:?}: {:#}", target, backup, e);
    }
}

/// Stage `artifact` and swap it into `target`. The staging path stays
/// registered for cleanup until the swap succeeded.
#[allow(clippy::too_many_arguments)]
pub fn place<R: Runtime + 'static>(
    runtime: &R,
    extractor: &ArchiveExtractorImpl,
    artifact: &FetchedArtifact,
    target: &Path,
    n: u64,
    link_local: bool,
    modules_dir: &str,
    cleanup: SharedCleanupContext,
) -> Result<bool> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("Install path {:?} has no parent", target))?;
    runtime.create_dir_all(parent)?;

    let staging = staging_path(target, n)?;
    if occupied(runtime, &staging) {
        remove_installed(runtime, &staging)?;
    }
    let guard = CleanupGuard::new(cleanup.clone(), staging.clone());

    let linked = match stage(runtime, extractor, artifact, &staging, link_local, cleanup.clone()) {
        Ok(linked) => linked,
        Err(e) => {
            let _ = remove_installed(runtime, &staging);
            let mut temp_extract = staging.clone().into_os_string();
            temp_extract.push(TEMP_EXTRACT_SUFFIX);
            let temp_extract = PathBuf::from(temp_extract);
            let _ = remove_installed(runtime, &temp_extract);
            crate::cleanup::lock(&cleanup).remove(&temp_extract);
            guard.success();
            return Err(e);
        }
    };

    let backup = backup_path(target, n)?;
    if let Err(e) = swap(runtime, &staging, target, &backup, modules_dir) {
        let _ = remove_installed(runtime, &staging);
        guard.success();
        return Err(e);
    }
    guard.success();
    Ok(linked)
}

/// Recover from an interrupted run: restore backups whose target is
/// missing, drop every other backup and all staging or extraction leftovers.
/// Walks `modules_root` and every nested `modules_dir` below it.
#[tracing::instrument(skip(runtime))]
pub fn recover<R: Runtime + ?Sized>(runtime: &R, modules_root: &Path, modules_dir: &str) -> Result<()> {
    if !runtime.is_dir(modules_root) {
        return Ok(());
    }
    let mut pending = vec![modules_root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in runtime.read_dir(&dir)? {
            let Some(file_name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            if let Some(name) = leftover_name(&file_name, BACKUP_MARKER) {
                let target = dir.join(name);
                if occupied(runtime, &target) {
                    debug!("Dropping stale backup {:?}", entry);
                    remove_installed(runtime, &entry)?;
                } else {
                    warn!("Restoring {:?} from interrupted run", target);
                    runtime.rename(&entry, &target)?;
                    let nested = target.join(modules_dir);
                    if runtime.is_dir(&nested) {
                        pending.push(nested);
                    }
                }
                continue;
            }
            if leftover_name(&file_name, STAGING_MARKER).is_some()
                || file_name.ends_with(TEMP_EXTRACT_SUFFIX)
            {
                debug!("Dropping leftover {:?}", entry);
                remove_installed(runtime, &entry)?;
                continue;
            }

            let nested = entry.join(modules_dir);
            if !runtime.is_symlink(&entry) && runtime.is_dir(&nested) {
                pending.push(nested);
            }
        }
    }
    Ok(())
}

/// `foo` for `.foo.old-3` with marker `.old-`.
fn leftover_name<'a>(file_name: &'a str, marker: &str) -> Option<&'a str> {
    let rest = file_name.strip_prefix('.')?;
    let (name, n) = rest.rsplit_once(marker)?;
    (!name.is_empty() && !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())).then_some(name)
}
