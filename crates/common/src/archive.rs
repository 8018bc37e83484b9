//! In-memory container unpacking for structural comparison
//!
//! Supports zip, tar and gzip (a gzip stream unpacks to a single entry, so a
//! tar.gz is two nested levels). Nothing is written to disk.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use tracing::debug;

/// Entry name given to the payload of a gzip stream
pub const GZIP_PAYLOAD: &str = "content";

/// Recognized container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Zip,
    Tar,
    Gzip,
}

impl ContainerFormat {
    /// Sniff the format from magic bytes
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
            Some(ContainerFormat::Zip)
        } else if data.starts_with(&[0x1f, 0x8b]) {
            Some(ContainerFormat::Gzip)
        } else if data.len() >= 512 && &data[257..262] == b"ustar" {
            Some(ContainerFormat::Tar)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerFormat::Zip => write!(f, "zip"),
            ContainerFormat::Tar => write!(f, "tar"),
            ContainerFormat::Gzip => write!(f, "gzip"),
        }
    }
}

/// Type of an archive member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::Symlink => write!(f, "symlink"),
            EntryKind::Other => write!(f, "other"),
        }
    }
}

/// One unpacked archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub kind: EntryKind,
    /// Permission bits, when the format records them
    pub mode: Option<u32>,
    /// Modification time in seconds since the epoch
    pub mtime: Option<i64>,
    pub link_target: Option<String>,
    pub data: Vec<u8>,
}

/// The members of one container, keyed by normalized path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedTree {
    pub format: ContainerFormat,
    pub entries: BTreeMap<String, ArchiveEntry>,
}

/// Unpack `data` as `format`, reading at most `max_bytes` of member content.
pub fn unpack(format: ContainerFormat, data: &[u8], max_bytes: u64) -> Result<UnpackedTree> {
    let mut budget = Budget { remaining: max_bytes };
    let entries = match format {
        ContainerFormat::Gzip => unpack_gzip(data, &mut budget)?,
        ContainerFormat::Tar => unpack_tar(data, &mut budget)?,
        ContainerFormat::Zip => unpack_zip(data, &mut budget)?,
    };
    debug!("Unpacked {} with {} entries", format, entries.len());
    Ok(UnpackedTree { format, entries })
}

struct Budget {
    remaining: u64,
}

impl Budget {
    fn read_all<R: Read>(&mut self, reader: R) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        reader
            .take(self.remaining.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| Error::DiffEngine(format!("read archive member: {}", e)))?;
        let used = buf.len() as u64;
        if used > self.remaining {
            return Err(Error::DiffEngine(
                "archive content exceeds the unpack size limit".to_string(),
            ));
        }
        self.remaining -= used;
        Ok(buf)
    }
}

/// Reject absolute paths and `..` components, then normalize separators.
fn member_name(raw: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::DiffEngine(format!(
                    "path traversal in archive member: {}",
                    raw.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

fn unpack_gzip(data: &[u8], budget: &mut Budget) -> Result<BTreeMap<String, ArchiveEntry>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let payload = budget.read_all(&mut decoder)?;
    let mtime = decoder
        .header()
        .map(|h| h.mtime() as i64)
        .filter(|m| *m != 0);

    let mut entries = BTreeMap::new();
    entries.insert(
        GZIP_PAYLOAD.to_string(),
        ArchiveEntry {
            kind: EntryKind::File,
            mode: None,
            mtime,
            link_target: None,
            data: payload,
        },
    );
    Ok(entries)
}

fn unpack_tar(data: &[u8], budget: &mut Budget) -> Result<BTreeMap<String, ArchiveEntry>> {
    let tar_err = |e: std::io::Error| Error::DiffEngine(format!("tar: {}", e));
    let mut archive = tar::Archive::new(Cursor::new(data));
    let mut entries = BTreeMap::new();

    for entry in archive.entries().map_err(tar_err)? {
        let mut entry = entry.map_err(tar_err)?;
        let name = member_name(&entry.path().map_err(tar_err)?)?;
        let header = entry.header();
        let entry_type = header.entry_type();

        let kind = if entry_type.is_file() {
            EntryKind::File
        } else if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        };
        let mode = header.mode().ok().map(|m| m & 0o7777);
        let mtime = header.mtime().ok().map(|m| m as i64);
        let link_target = entry
            .link_name()
            .map_err(tar_err)?
            .map(|p| p.to_string_lossy().into_owned());

        let data = if kind == EntryKind::File {
            budget.read_all(&mut entry)?
        } else {
            Vec::new()
        };

        entries.insert(
            name,
            ArchiveEntry {
                kind,
                mode,
                mtime,
                link_target,
                data,
            },
        );
    }
    Ok(entries)
}

fn unpack_zip(data: &[u8], budget: &mut Budget) -> Result<BTreeMap<String, ArchiveEntry>> {
    let zip_err = |e: zip::result::ZipError| Error::DiffEngine(format!("zip: {}", e));
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(zip_err)?;
    let mut entries = BTreeMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_err)?;
        if file.enclosed_name().is_none() {
            return Err(Error::DiffEngine(format!(
                "path traversal in archive member: {}",
                file.name()
            )));
        }
        let name = member_name(Path::new(file.name()))?;

        let unix_mode = file.unix_mode();
        let is_symlink = unix_mode.map(|m| m & 0o170000 == 0o120000).unwrap_or(false);
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else if is_symlink {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };
        let mtime = file.last_modified().and_then(|dt| {
            chrono::NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
                .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
                .map(|t| t.and_utc().timestamp())
        });

        let contents = if kind == EntryKind::Directory {
            Vec::new()
        } else {
            budget.read_all(&mut file)?
        };
        let (link_target, data) = if kind == EntryKind::Symlink {
            (Some(String::from_utf8_lossy(&contents).into_owned()), Vec::new())
        } else {
            (None, contents)
        };

        entries.insert(
            name,
            ArchiveEntry {
                kind,
                mode: unix_mode.map(|m| m & 0o7777),
                mtime,
                link_target,
                data,
            },
        );
    }
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build a tar with one regular file per `(name, data)` pair.
    pub(crate) fn tar_bytes(files: &[(&str, &str)], mtime: u64, mode: u32) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mtime(mtime);
            header.set_mode(mode);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detect() {
        let tar = tar_bytes(&[("a.txt", "hello")], 0, 0o644);
        assert_eq!(ContainerFormat::detect(&tar), Some(ContainerFormat::Tar));
        assert_eq!(
            ContainerFormat::detect(&gzip_bytes(&tar)),
            Some(ContainerFormat::Gzip)
        );
        assert_eq!(ContainerFormat::detect(b"plain text"), None);
    }

    #[test]
    fn test_unpack_tar_gz() {
        let tar = tar_bytes(&[("dir/a.txt", "hello"), ("b.txt", "world")], 42, 0o640);
        let outer = unpack(ContainerFormat::Gzip, &gzip_bytes(&tar), 1 << 20).unwrap();
        let payload = &outer.entries[GZIP_PAYLOAD].data;
        assert_eq!(payload, &tar);

        let inner = unpack(ContainerFormat::Tar, payload, 1 << 20).unwrap();
        let entry = &inner.entries["dir/a.txt"];
        assert_eq!(entry.data, b"hello");
        assert_eq!(entry.mode, Some(0o640));
        assert_eq!(entry.mtime, Some(42));
    }

    #[test]
    fn test_unpack_zip() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o600);
        writer.start_file("inner/x.txt", options).unwrap();
        writer.write_all(b"zipped").unwrap();
        let data = writer.finish().unwrap().into_inner();

        assert_eq!(ContainerFormat::detect(&data), Some(ContainerFormat::Zip));
        let tree = unpack(ContainerFormat::Zip, &data, 1 << 20).unwrap();
        let entry = &tree.entries["inner/x.txt"];
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.data, b"zipped");
        assert_eq!(entry.mode, Some(0o600));
    }

    #[test]
    fn test_size_limit() {
        let big = "x".repeat(4096);
        let tar = tar_bytes(&[("big", big.as_str())], 0, 0o644);
        let err = unpack(ContainerFormat::Tar, &tar, 1024).unwrap_err();
        assert!(matches!(err, Error::DiffEngine(_)));
    }

    #[test]
    fn test_member_name_rejects_traversal() {
        assert_eq!(member_name(Path::new("./a/b")).unwrap(), "a/b");
        assert!(member_name(Path::new("../etc/passwd")).is_err());
        assert!(member_name(Path::new("/etc/passwd")).is_err());
    }
}
