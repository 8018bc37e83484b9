//! Artifact collection
//!
//! Lists the files of a round's scratch area on the testbed, matches them
//! against the artifact patterns and copies the matches into the round's
//! staging directory. Patterns are relative to the source tree copy but may
//! reach into the rest of the scratch area with `..`.

use crate::testbed::TestbedSession;
use globset::{GlobBuilder, GlobMatcher};
use reprotest_common::protocol::RunRequest;
use reprotest_common::wrapper::join;
use reprotest_common::{ArtifactSet, Error, Result, Round};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File on the testbed receiving the scratch listing
const LISTING_NAME: &str = ".reprotest-listing";

/// Staging directory name standing in for `..` in artifact paths
const PARENT_DIR: &str = "_parent";

/// Matches artifact patterns and stages the matching files
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    patterns: Vec<String>,
}

impl ArtifactCollector {
    /// Check the patterns; `*` does not cross directory separators.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(Error::InvalidConfig("no artifact patterns given".to_string()));
        }
        let patterns: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        for pattern in &patterns {
            compile(pattern, pattern)?;
        }
        Ok(Self { patterns })
    }

    /// Compile the patterns against the tree named `tree`, giving matchers
    /// over paths relative to the scratch directory.
    ///
    /// Fails when a pattern climbs out of the scratch directory.
    pub fn matchers(&self, tree: &str) -> Result<Vec<(&str, GlobMatcher)>> {
        self.patterns
            .iter()
            .map(|pattern| {
                let scoped = normalize(&join(tree, pattern)).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "artifact pattern `{}` leaves the testbed scratch directory",
                        pattern
                    ))
                })?;
                Ok((pattern.as_str(), compile(pattern, &scoped)?))
            })
            .collect()
    }

    /// Group scratch-relative paths by the patterns they match.
    ///
    /// Fails with [`Error::ArtifactNotFound`] for the first pattern that
    /// matches nothing.
    pub fn select<'a>(
        &self,
        round: Round,
        tree: &str,
        files: &'a [String],
    ) -> Result<Vec<(&str, Vec<&'a str>)>> {
        let mut selected = Vec::with_capacity(self.patterns.len());
        for (pattern, matcher) in self.matchers(tree)? {
            let matched: Vec<&str> = files
                .iter()
                .map(String::as_str)
                .filter(|f| matcher.is_match(f))
                .collect();
            if matched.is_empty() {
                return Err(Error::ArtifactNotFound {
                    round,
                    pattern: pattern.to_string(),
                });
            }
            selected.push((pattern, matched));
        }
        Ok(selected)
    }

    /// Stage the artifacts of `round`, built in the tree named `tree`,
    /// into `dest`.
    pub async fn collect(
        &self,
        session: &mut TestbedSession,
        round: Round,
        tree: &str,
        work_dir: &Path,
        dest: &Path,
    ) -> Result<ArtifactSet> {
        let scratch = session.scratch()?.to_string();
        let files = list_scratch(session, &scratch, work_dir).await?;
        debug!("Round {}: {} files in scratch area", round, files.len());

        let mut set = ArtifactSet::new(round);
        for (pattern, matched) in self.select(round, tree, &files)? {
            for file in matched {
                let relative = relative_to_tree(tree, file);
                let staged = dest.join(staging_path(&relative));
                if set.staged_path(&relative).is_none() {
                    if let Some(parent) = staged.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    session.copy_out(&join(&scratch, file), &staged).await?;
                }
                set.insert(pattern, relative, staged);
            }
        }

        info!("Round {}: staged {} artifacts", round, set.len());
        Ok(set)
    }
}

fn compile(pattern: &str, glob: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::InvalidConfig(format!("artifact pattern `{}`: {}", pattern, e)))
}

/// Resolve `.` and `..` lexically. `None` when the path climbs above its
/// starting point.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    Some(parts.join("/"))
}

/// Spell a scratch-relative file relative to the tree, so both rounds name
/// the same artifact alike whatever their tree is called.
fn relative_to_tree(tree: &str, file: &str) -> String {
    let tree: Vec<&str> = tree.split('/').filter(|p| !p.is_empty()).collect();
    let file: Vec<&str> = file.split('/').filter(|p| !p.is_empty()).collect();
    let common = tree
        .iter()
        .zip(file.iter())
        .take_while(|(t, f)| t == f)
        .count();

    let mut parts = vec![".."; tree.len() - common];
    parts.extend(&file[common..]);
    parts.join("/")
}

/// Location under the round's staging directory; never leaves it
fn staging_path(relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .map(|p| if p == ".." { PARENT_DIR } else { p })
        .collect()
}

/// Relative paths of the regular files and symlinks under the scratch area
async fn list_scratch(
    session: &mut TestbedSession,
    scratch: &str,
    work_dir: &Path,
) -> Result<Vec<String>> {
    let listing = join(scratch, LISTING_NAME);
    let mut run = RunRequest::new(
        ["find", ".", "(", "-type", "f", "-o", "-type", "l", ")", "-print0"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    run.cwd = Some(scratch.to_string());
    run.stdout = Some(listing.clone());

    let result = session.run(run, None).await?;
    if !result.success() {
        return Err(Error::BackendFailure {
            verb: "run".to_string(),
            message: format!("listing {} failed with exit code {}", scratch, result.exit_code),
        });
    }

    let host_listing = work_dir.join(LISTING_NAME);
    session.copy_out(&listing, &host_listing).await?;
    let raw = std::fs::read(&host_listing)?;
    Ok(parse_listing(&raw))
}

fn parse_listing(raw: &[u8]) -> Vec<String> {
    let mut files: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            entry.trim_start_matches("./").to_string()
        })
        .filter(|entry| entry != LISTING_NAME)
        .collect();
    files.sort();
    files
}
