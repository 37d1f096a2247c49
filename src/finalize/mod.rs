//! Post-run finalization of an output tree.
//!
//! After a successful run the output directory, kept owner-only while the
//! tool was writing, is opened up for readers, the portable case's bundled
//! launchers and runtime are marked executable, and the tree is optionally
//! moved to its final location.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::FinalizeError;

/// Permissions of a finalized output directory.
pub const FINAL_DIR_MODE: u32 = 0o755;

/// Executable-bearing subpaths of a portable IPED case, relative to the
/// output directory.
pub const EXECUTABLE_PATHS: &[&str] = &[
    "IPED-SearchApp.exe",
    "iped/bin",
    "iped/lib",
    "iped/jre/bin",
    "iped/jre/lib",
    "iped/tools",
];

/// Outcome of a finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    /// Where the output tree lives now.
    pub location: PathBuf,
    /// Entries whose executable bit could not be set.
    pub permission_failures: usize,
}

/// Widens permissions on `output_dir`, marks bundled executables, and moves
/// the tree to `relocate_to` when given.
///
/// Individual executable fixes are best-effort. An existing `relocate_to`
/// is never overwritten or merged into.
pub fn finalize(output_dir: &Path, relocate_to: Option<&Path>) -> Result<Finalized, FinalizeError> {
    set_mode(output_dir, FINAL_DIR_MODE).map_err(|source| FinalizeError::Permissions {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let permission_failures = EXECUTABLE_PATHS
        .iter()
        .map(|rel| mark_executable(&output_dir.join(rel)))
        .sum();

    let location = match relocate_to {
        Some(destination) => {
            relocate(output_dir, destination)?;
            destination.to_path_buf()
        }
        None => output_dir.to_path_buf(),
    };

    info!(
        location = %location.display(),
        permission_failures,
        "Output finalized"
    );

    Ok(Finalized {
        location,
        permission_failures,
    })
}

/// Recursively adds read/execute bits under `root`; returns the number of
/// entries that could not be updated. A missing `root` is not an error.
pub fn mark_executable(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }

    let mut failures = 0;
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Cannot walk executable path");
                failures += 1;
                continue;
            }
        };
        if entry.path_is_symlink() {
            continue;
        }
        if let Err(e) = add_mode(entry.path(), FINAL_DIR_MODE) {
            warn!(path = %entry.path().display(), error = %e, "Cannot mark executable");
            failures += 1;
        }
    }
    failures
}

/// Moves `from` to `to`, creating `to`'s parents.
///
/// Falls back to copy-then-delete when a rename is impossible (for example
/// across filesystems). A destination inside `from` is refused before
/// anything is touched, and a failed copy leaves no partial destination.
pub fn relocate(from: &Path, to: &Path) -> Result<(), FinalizeError> {
    if to.exists() {
        return Err(FinalizeError::DestinationExists(to.to_path_buf()));
    }
    if lies_within(from, to) {
        return Err(FinalizeError::DestinationInside {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
    }

    let relocate_err = |source| FinalizeError::Relocate {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(relocate_err)?;
    }

    if let Err(e) = fs::rename(from, to) {
        debug!(error = %e, "Rename failed, copying instead");
        move_by_copy(from, to).map_err(relocate_err)?;
    }

    info!(from = %from.display(), to = %to.display(), "Output relocated");
    Ok(())
}

/// Whether `path` is `dir` or below it, following symlinks on the part of
/// `path` that already exists.
fn lies_within(dir: &Path, path: &Path) -> bool {
    if path.starts_with(dir) {
        return true;
    }
    let Ok(dir) = fs::canonicalize(dir) else {
        return false;
    };

    let mut existing = path;
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return false,
        }
    }
    match fs::canonicalize(existing) {
        Ok(base) => missing
            .iter()
            .rev()
            .fold(base, |acc, name| acc.join(name))
            .starts_with(&dir),
        Err(_) => false,
    }
}

/// Copies `from` to `to`, then deletes `from`. On a copy failure whatever
/// was written under `to` is removed and `from` is left intact.
fn move_by_copy(from: &Path, to: &Path) -> io::Result<()> {
    if let Err(e) = copy_tree(from, to) {
        if to.exists() {
            if let Err(cleanup) = fs::remove_dir_all(to) {
                warn!(path = %to.display(), error = %cleanup, "Cannot remove partial copy");
            }
        }
        return Err(e);
    }
    fs::remove_dir_all(from)
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, entry.metadata().map_err(io::Error::other)?.permissions())?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(unix)]
fn add_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let current = fs::metadata(path)?.permissions().mode();
    if current & mode == mode {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(current | mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn add_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
