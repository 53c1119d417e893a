use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::sibling_dir;

/// Written into every staging tree and stripped before it is published.
pub const STAGING_MARKER: &str = ".mirror-staging";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("staging directory {0} does not exist")]
    MissingStaging(PathBuf),
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> PublishError {
    let path = path.to_path_buf();
    move |source| PublishError::Io {
        action,
        path,
        source,
    }
}

/// Creates a fresh staging tree, seeded from `published` unless `clean`.
pub fn prepare_staging(staging: &Path, published: &Path, clean: bool) -> Result<(), PublishError> {
    remove_if_exists(staging)?;
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent).map_err(io_err("create", parent))?;
    }

    if !clean && published.is_dir() {
        let copied = copy_tree(published, staging)?;
        tracing::info!(
            "Seeded {} with {} files from {}",
            staging.display(),
            copied,
            published.display()
        );
    } else {
        fs::create_dir_all(staging).map_err(io_err("create", staging))?;
    }

    let marker = staging.join(STAGING_MARKER);
    fs::write(&marker, b"").map_err(io_err("write", &marker))?;
    Ok(())
}

/// Best-effort removal of a staging tree.
pub fn discard_staging(staging: &Path) {
    if let Err(e) = remove_if_exists(staging) {
        tracing::warn!("Failed to clean up staging directory: {}", e);
    }
}

pub fn remove_if_exists(path: &Path) -> Result<(), PublishError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("remove", path)(e)),
    }
}

/// Recursively copies `src` into `dst`, returning the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize, PublishError> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            PublishError::Io {
                action: "walk",
                path,
                source: e.into(),
            }
        })?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err("create", &target))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(io_err("copy", entry.path()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Replaces a published tree with a staged one.
pub trait Publisher {
    fn publish(&self, staged: &Path, target: &Path) -> Result<(), PublishError>;
}

/// Swaps directories with `rename`.
///
/// The live tree is moved aside to `<target>_backup` and the staged tree is
/// renamed into its place; a failed second rename restores the backup.
/// Between the two renames `target` briefly does not exist.
///
/// When staging and target sit on different filesystems the staged tree is
/// first copied to `<target>_incoming` next to the target. That copy can be
/// interrupted, but the live tree is untouched until it completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenamePublisher;

impl Publisher for RenamePublisher {
    fn publish(&self, staged: &Path, target: &Path) -> Result<(), PublishError> {
        if !staged.is_dir() {
            return Err(PublishError::MissingStaging(staged.to_path_buf()));
        }

        let marker = staged.join(STAGING_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove", &marker)(e)),
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err("create", parent))?;
        }

        let incoming = sibling_dir(target, "incoming");
        remove_if_exists(&incoming)?;
        let source = match fs::rename(staged, &incoming) {
            Ok(()) => incoming,
            Err(e) if is_cross_device(&e) => {
                tracing::warn!(
                    "{} is on another filesystem; copying before swap",
                    staged.display()
                );
                copy_tree(staged, &incoming)?;
                remove_if_exists(staged)?;
                incoming
            }
            Err(e) => return Err(io_err("rename", staged)(e)),
        };

        swap_into_place(&source, target)
    }
}

fn swap_into_place(source: &Path, target: &Path) -> Result<(), PublishError> {
    let backup = sibling_dir(target, "backup");
    remove_if_exists(&backup)?;

    let had_target = target.exists();
    if had_target {
        fs::rename(target, &backup).map_err(io_err("rename", target))?;
    }

    if let Err(e) = fs::rename(source, target) {
        if had_target && backup.exists() {
            if let Err(restore) = fs::rename(&backup, target) {
                tracing::error!(
                    "Failed to restore {} from {}: {}",
                    target.display(),
                    backup.display(),
                    restore
                );
            }
        }
        return Err(io_err("rename", source)(e));
    }

    if let Err(e) = remove_if_exists(&backup) {
        tracing::warn!("Published, but could not remove backup: {}", e);
    }
    Ok(())
}

fn is_cross_device(e: &io::Error) -> bool {
    // EXDEV on unix, ERROR_NOT_SAME_DEVICE on windows
    let code = if cfg!(windows) { 17 } else { 18 };
    e.raw_os_error() == Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn clean_staging_starts_empty_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        let staging = dir.path().join("site_tmp");
        write(&site.join("index.html"), "old");
        write(&staging.join("leftover.html"), "stale");

        prepare_staging(&staging, &site, true).unwrap();

        let names: Vec<_> = fs::read_dir(&staging)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(STAGING_MARKER)]);
    }

    #[test]
    fn incremental_staging_copies_published_tree() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        let staging = dir.path().join("site_tmp");
        write(&site.join("index.html"), "home");
        write(&site.join("archives/1/index.html"), "post");

        prepare_staging(&staging, &site, false).unwrap();

        assert_eq!(fs::read_to_string(staging.join("index.html")).unwrap(), "home");
        assert_eq!(
            fs::read_to_string(staging.join("archives/1/index.html")).unwrap(),
            "post"
        );
        assert!(staging.join(STAGING_MARKER).exists());
        assert_eq!(fs::read_to_string(site.join("index.html")).unwrap(), "home");
    }

    #[test]
    fn publish_replaces_target_and_strips_marker() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        let staging = dir.path().join("site_tmp");
        write(&site.join("gone.html"), "old");
        prepare_staging(&staging, &site, true).unwrap();
        write(&staging.join("index.html"), "new");

        RenamePublisher.publish(&staging, &site).unwrap();

        assert!(!staging.exists());
        assert!(!site.join("gone.html").exists());
        assert!(!site.join(STAGING_MARKER).exists());
        assert_eq!(fs::read_to_string(site.join("index.html")).unwrap(), "new");
        assert!(!dir.path().join("site_backup").exists());
        assert!(!dir.path().join("site_incoming").exists());
    }

    #[test]
    fn publish_creates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("nested/site");
        let staging = dir.path().join("site_tmp");
        write(&staging.join("index.html"), "first");

        RenamePublisher.publish(&staging, &site).unwrap();

        assert_eq!(fs::read_to_string(site.join("index.html")).unwrap(), "first");
    }

    #[test]
    fn missing_staging_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        write(&site.join("index.html"), "keep");

        let err = RenamePublisher
            .publish(&dir.path().join("site_tmp"), &site)
            .unwrap_err();

        assert!(matches!(err, PublishError::MissingStaging(_)));
        assert_eq!(fs::read_to_string(site.join("index.html")).unwrap(), "keep");
    }

    #[test]
    fn failed_swap_restores_previous_target() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        write(&site.join("index.html"), "previous");

        // the backup rename succeeds, the second rename cannot
        let err = swap_into_place(&dir.path().join("site_incoming"), &site).unwrap_err();

        assert!(matches!(err, PublishError::Io { action: "rename", .. }));
        assert_eq!(fs::read_to_string(site.join("index.html")).unwrap(), "previous");
        assert!(!dir.path().join("site_backup").exists());
    }

    #[test]
    fn discard_ignores_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        discard_staging(&dir.path().join("never-created"));
    }
}
