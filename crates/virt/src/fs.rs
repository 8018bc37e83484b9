//! File and directory copies across the testbed boundary

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};
use walkdir::WalkDir;

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Copy `src` to `dst`, recursing into directories.
///
/// Directories are merged into an existing `dst`; symlinks are recreated
/// rather than followed. File permissions are preserved, directory
/// permissions are not.
pub fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return copy_entry(src, dst, &meta);
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        let meta = entry.metadata().map_err(io::Error::other)?;
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_entry(entry.path(), &target, &meta)?;
        }
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        let link = fs::read_link(src)?;
        if fs::symlink_metadata(dst).is_ok() {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(link, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Mount points at or below `root` in a `/proc/mounts` style table,
/// deepest first.
pub fn mounts_under(root: &Path, table: &str) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .filter(|mount| mount.starts_with(root))
        .collect();
    mounts.sort_by_key(|m| std::cmp::Reverse(m.components().count()));
    mounts
}

/// Lazily detach FUSE mounts (disorderfs and the like) left below `root`,
/// so that removing it does not trip over them.
pub fn unmount_below(root: &Path) {
    let Ok(table) = fs::read_to_string(MOUNT_TABLE) else {
        return;
    };
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    for mount in mounts_under(&root, &table) {
        debug!("Unmounting {}", mount.display());
        let status = Command::new("fusermount")
            .arg("-u")
            .arg("-z")
            .arg(&mount)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("fusermount -u {} failed: {}", mount.display(), status),
            Err(e) => warn!("Cannot run fusermount for {}: {}", mount.display(), e),
        }
    }
}

/// Undo the octal escapes (`\040` for a space) of the mount table
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|_| bytes[i] == b'\\');
        let byte = escape
            .and_then(|d| std::str::from_utf8(d).ok())
            .and_then(|d| u8::from_str_radix(d, 8).ok());
        match byte {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
