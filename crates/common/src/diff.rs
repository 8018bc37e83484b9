//! Artifact comparison
//!
//! Artifacts of the two rounds are matched by relative path. Equal hashes
//! pass immediately; otherwise recognized containers are unpacked and
//! compared member by member, and everything else gets a bounded byte diff.

use crate::archive::{self, ArchiveEntry, ContainerFormat, UnpackedTree};
use crate::error::{Error, Result};
use crate::types::ArtifactSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// Diff engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Ignore member modification times inside containers
    pub normalize_timestamps: bool,
    /// Ignore member permission bits inside containers
    pub normalize_permissions: bool,
    /// Upper bound on the hex detail recorded for a byte difference
    pub max_detail_bytes: usize,
    /// How many container levels to descend into
    pub max_unpack_depth: usize,
    /// Upper bound on unpacked content per container
    pub max_unpack_bytes: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            normalize_timestamps: true,
            normalize_permissions: false,
            max_detail_bytes: 256,
            max_unpack_depth: 8,
            max_unpack_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Outcome of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
}

impl Verdict {
    /// Combine two verdicts: ERROR beats FAIL beats PASS
    pub fn worst(self, other: Verdict) -> Verdict {
        self.max(other)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
            Verdict::Error => write!(f, "ERROR"),
        }
    }
}

/// Summary of two byte streams that differ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteDiff {
    pub size_a: u64,
    pub size_b: u64,
    /// Offset of the first differing byte
    pub offset: u64,
    /// Hex window starting at `offset`
    pub window_a: String,
    pub window_b: String,
}

impl ByteDiff {
    fn new(a: &[u8], b: &[u8], max_detail_bytes: usize) -> Self {
        let offset = a
            .iter()
            .zip(b.iter())
            .position(|(x, y)| x != y)
            .unwrap_or_else(|| a.len().min(b.len()));
        // Two hex windows, two characters per byte.
        let window = (max_detail_bytes / 4).max(1);
        let slice = |data: &[u8]| {
            let end = data.len().min(offset + window);
            hex::encode(data.get(offset..end).unwrap_or_default())
        };
        Self {
            size_a: a.len() as u64,
            size_b: b.len() as u64,
            offset: offset as u64,
            window_a: slice(a),
            window_b: slice(b),
        }
    }
}

/// One difference found between the rounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Difference {
    /// Present in round A, absent in round B
    Missing { path: String },
    /// Present in round B, absent in round A
    Extra { path: String },
    Content { path: String, detail: ByteDiff },
    Metadata {
        path: String,
        field: String,
        a: String,
        b: String,
    },
    /// A container whose members differ
    Container {
        path: String,
        format: ContainerFormat,
        differences: Vec<Difference>,
    },
}

impl Difference {
    pub fn path(&self) -> &str {
        match self {
            Difference::Missing { path }
            | Difference::Extra { path }
            | Difference::Content { path, .. }
            | Difference::Metadata { path, .. }
            | Difference::Container { path, .. } => path,
        }
    }

    /// One-line description
    pub fn summary(&self) -> String {
        match self {
            Difference::Missing { path } => format!("{}: missing in B", path),
            Difference::Extra { path } => format!("{}: extra in B", path),
            Difference::Content { path, detail } => format!(
                "{}: content differs at byte {} (sizes {} / {})",
                path, detail.offset, detail.size_a, detail.size_b
            ),
            Difference::Metadata { path, field, a, b } => {
                format!("{}: {} {} -> {}", path, field, a, b)
            }
            Difference::Container {
                path,
                format,
                differences,
            } => format!("{}: {} with {} differing members", path, format, differences.len()),
        }
    }
}

/// Verdict for one artifact path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVerdict {
    pub pattern: String,
    pub path: String,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_a: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_b: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<Difference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of comparing two artifact sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub verdict: Verdict,
    pub artifacts: Vec<ArtifactVerdict>,
}

impl DiffReport {
    pub fn is_reproducible(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Artifacts that did not pass
    pub fn differences(&self) -> Vec<&ArtifactVerdict> {
        self.artifacts
            .iter()
            .filter(|a| a.verdict != Verdict::Pass)
            .collect()
    }
}

/// Compares the artifact sets of two rounds
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Compare round A against round B.
    pub fn compare(&self, a: &ArtifactSet, b: &ArtifactSet) -> DiffReport {
        let patterns: BTreeSet<&String> = a.patterns().chain(b.patterns()).collect();
        let mut seen = BTreeSet::new();
        let mut artifacts = Vec::new();

        for pattern in patterns {
            let paths: BTreeSet<&String> =
                a.matches_for(pattern).chain(b.matches_for(pattern)).collect();
            for path in paths {
                // A path matched by several patterns is reported once.
                if !seen.insert(path.clone()) {
                    continue;
                }
                artifacts.push(self.compare_artifact(pattern, path, a, b));
            }
        }

        let verdict = artifacts
            .iter()
            .fold(Verdict::Pass, |acc, v| acc.worst(v.verdict));
        debug!("Compared {} artifacts: {}", artifacts.len(), verdict);

        DiffReport { verdict, artifacts }
    }

    fn compare_artifact(
        &self,
        pattern: &str,
        path: &str,
        a: &ArtifactSet,
        b: &ArtifactSet,
    ) -> ArtifactVerdict {
        let mut verdict = ArtifactVerdict {
            pattern: pattern.to_string(),
            path: path.to_string(),
            verdict: Verdict::Pass,
            sha256_a: None,
            sha256_b: None,
            differences: Vec::new(),
            error: None,
        };

        let (staged_a, staged_b) = match (a.staged_path(path), b.staged_path(path)) {
            (Some(x), Some(y)) => (x, y),
            (Some(_), None) => {
                verdict.verdict = Verdict::Fail;
                verdict.differences.push(Difference::Missing {
                    path: path.to_string(),
                });
                return verdict;
            }
            (None, _) => {
                verdict.verdict = Verdict::Fail;
                verdict.differences.push(Difference::Extra {
                    path: path.to_string(),
                });
                return verdict;
            }
        };

        // Links are compared by target; following them on the host would
        // resolve against the wrong filesystem.
        match staged_link(staged_a).and_then(|x| Ok((x, staged_link(staged_b)?))) {
            Ok((None, None)) => {}
            Ok((link_a, link_b)) => {
                verdict.differences = link_differences(path, link_a, link_b);
                if !verdict.differences.is_empty() {
                    verdict.verdict = Verdict::Fail;
                }
                return verdict;
            }
            Err(e) => {
                warn!("Diff engine error on {}: {}", path, e);
                verdict.verdict = Verdict::Error;
                verdict.error = Some(e.to_string());
                return verdict;
            }
        }

        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| {
                Error::DiffEngine(format!("cannot read staged {}: {}", p.display(), e))
            })
        };
        let result = read(staged_a).and_then(|data_a| {
            let data_b = read(staged_b)?;
            verdict.sha256_a = Some(sha256_hex(&data_a));
            verdict.sha256_b = Some(sha256_hex(&data_b));
            if verdict.sha256_a == verdict.sha256_b {
                return Ok(Vec::new());
            }
            self.compare_bytes(path, &data_a, &data_b, 0)
        });

        match result {
            Ok(differences) => {
                if !differences.is_empty() {
                    verdict.verdict = Verdict::Fail;
                }
                verdict.differences = differences;
            }
            Err(e) => {
                warn!("Diff engine error on {}: {}", path, e);
                verdict.verdict = Verdict::Error;
                verdict.error = Some(e.to_string());
            }
        }
        verdict
    }

    fn compare_bytes(&self, path: &str, a: &[u8], b: &[u8], depth: usize) -> Result<Vec<Difference>> {
        if a == b {
            return Ok(Vec::new());
        }

        let format = ContainerFormat::detect(a).filter(|f| Some(*f) == ContainerFormat::detect(b));
        match format {
            Some(format) if depth < self.config.max_unpack_depth => {
                let tree_a = archive::unpack(format, a, self.config.max_unpack_bytes)?;
                let tree_b = archive::unpack(format, b, self.config.max_unpack_bytes)?;
                let differences = self.compare_trees(&tree_a, &tree_b, depth + 1)?;
                if differences.is_empty() {
                    debug!("{} differs only in normalized metadata", path);
                    return Ok(Vec::new());
                }
                Ok(vec![Difference::Container {
                    path: path.to_string(),
                    format,
                    differences,
                }])
            }
            _ => Ok(vec![Difference::Content {
                path: path.to_string(),
                detail: ByteDiff::new(a, b, self.config.max_detail_bytes),
            }]),
        }
    }

    fn compare_trees(&self, a: &UnpackedTree, b: &UnpackedTree, depth: usize) -> Result<Vec<Difference>> {
        let names: BTreeSet<&String> = a.entries.keys().chain(b.entries.keys()).collect();
        let mut differences = Vec::new();

        for name in names {
            match (a.entries.get(name), b.entries.get(name)) {
                (Some(x), Some(y)) => differences.extend(self.compare_entries(name, x, y, depth)?),
                (Some(_), None) => differences.push(Difference::Missing { path: name.clone() }),
                (None, _) => differences.push(Difference::Extra { path: name.clone() }),
            }
        }
        Ok(differences)
    }

    fn compare_entries(
        &self,
        name: &str,
        a: &ArchiveEntry,
        b: &ArchiveEntry,
        depth: usize,
    ) -> Result<Vec<Difference>> {
        let mut differences = Vec::new();
        let mut metadata = |field: &str, x: String, y: String| {
            if x != y {
                differences.push(Difference::Metadata {
                    path: name.to_string(),
                    field: field.to_string(),
                    a: x,
                    b: y,
                });
            }
        };

        metadata("type", a.kind.to_string(), b.kind.to_string());
        metadata("symlink-target", display_opt(&a.link_target), display_opt(&b.link_target));
        if !self.config.normalize_permissions {
            metadata(
                "mode",
                display_opt(&a.mode.map(|m| format!("{:04o}", m))),
                display_opt(&b.mode.map(|m| format!("{:04o}", m))),
            );
        }
        if !self.config.normalize_timestamps {
            metadata("mtime", display_opt(&a.mtime), display_opt(&b.mtime));
        }

        differences.extend(self.compare_bytes(name, &a.data, &b.data, depth)?);
        Ok(differences)
    }
}

/// Target of a staged symlink, or `None` for anything else
fn staged_link(path: &Path) -> Result<Option<String>> {
    let stat_error =
        |e: std::io::Error| Error::DiffEngine(format!("cannot stat staged {}: {}", path.display(), e));
    let meta = std::fs::symlink_metadata(path).map_err(stat_error)?;
    if !meta.file_type().is_symlink() {
        return Ok(None);
    }
    let target = std::fs::read_link(path).map_err(stat_error)?;
    Ok(Some(target.display().to_string()))
}

fn link_differences(path: &str, a: Option<String>, b: Option<String>) -> Vec<Difference> {
    let kind = |link: &Option<String>| if link.is_some() { "symlink" } else { "file" };
    let (field, x, y) = match (&a, &b) {
        (Some(x), Some(y)) if x == y => return Vec::new(),
        (Some(x), Some(y)) => ("symlink-target", x.clone(), y.clone()),
        _ => ("type", kind(&a).to_string(), kind(&b).to_string()),
    };
    vec![Difference::Metadata {
        path: path.to_string(),
        field: field.to_string(),
        a: x,
        b: y,
    }]
}

fn display_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Hex SHA256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
