//! Project settings file
//!
//! `.reprotest.toml` in the working directory, or the file given with
//! `--config`. Command-line options take precedence over everything here.
//!
//! ```toml
//! [basics]
//! build_command = "make"
//! artifacts = ["dist/*.tar.gz"]
//! variations = ["all"]
//! dont_vary = ["kernel"]
//!
//! [runner]
//! backend = ["schroot", "unstable-amd64"]
//! ```

use reprotest_common::{Error, Result};
use reprotest_runner::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default settings file name
pub const SETTINGS_FILE: &str = ".reprotest.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub basics: Basics,
    pub runner: RunnerConfig,
}

/// What to build and compare
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Basics {
    pub build_command: Option<String>,
    pub artifacts: Vec<String>,
    pub source_root: Option<PathBuf>,
    pub testbed_init: Option<String>,
    pub variations: Vec<String>,
    pub dont_vary: Vec<String>,
    pub verbosity: u8,
}

impl Settings {
    /// Load settings from an explicit path, or from `.reprotest.toml` in
    /// `dir` if it exists.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = dir.join(SETTINGS_FILE);
                if path.is_file() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Reading settings from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::discover(None, dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_sections() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"
[basics]
build_command = "make dist"
artifacts = ["dist/*.tar.gz"]
variations = ["all"]
dont_vary = ["kernel", "time"]
verbosity = 1

[runner]
backend = ["schroot", "unstable-amd64"]
keep_staging = true

[runner.diff]
normalize_permissions = true
"#,
        )
        .unwrap();

        let settings = Settings::discover(None, dir.path()).unwrap();
        assert_eq!(settings.basics.build_command.as_deref(), Some("make dist"));
        assert_eq!(settings.basics.dont_vary, vec!["kernel", "time"]);
        assert_eq!(settings.runner.backend, vec!["schroot", "unstable-amd64"]);
        assert!(settings.runner.keep_staging);
        assert!(settings.runner.diff.normalize_permissions);
        assert!(settings.runner.diff.normalize_timestamps);
        assert!(settings.runner.reuse_session);
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        let err = Settings::discover(Some(&dir.path().join("nope.toml")), dir.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_value_type_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[basics]\nartifacts = 3\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::InvalidConfig(_))));
    }
}
