//! Runner configuration

use reprotest_common::{DiffConfig, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backend selection, e.g. `["null"]` or `["schroot", "unstable-amd64"]`
    pub backend: Vec<String>,

    /// Program implementing the `null` backend
    pub null_program: PathBuf,

    /// Directory under which per-invocation staging areas are created
    pub staging_root: Option<PathBuf>,

    /// Keep staged artifacts after the run, whatever its outcome
    pub keep_staging: bool,

    /// Use `revert` between rounds when the backend advertises it
    pub reuse_session: bool,

    /// Maximum number of auxiliary output lines kept per command
    pub output_limit: usize,

    /// Deadlines for protocol operations
    pub timeouts: TimeoutConfig,

    /// Diff engine configuration
    pub diff: DiffConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: vec!["null".to_string()],
            null_program: PathBuf::from("reprotest-virt-null"),
            staging_root: None,
            keep_staging: false,
            reuse_session: true,
            output_limit: 2000,
            timeouts: TimeoutConfig::default(),
            diff: DiffConfig::default(),
        }
    }
}

/// Protocol deadlines, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Banner, capability negotiation and `open`
    pub startup_secs: u64,

    /// Short requests (`revert`, `close`, init and cleanup steps)
    pub operation_secs: u64,

    /// `copydown` / `copyup`
    pub copy_secs: u64,

    /// Build command per round; unlimited when unset
    pub round_secs: Option<u64>,

    /// Grace period between SIGTERM and SIGKILL on teardown
    pub kill_grace_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_secs: 300,
            operation_secs: 300,
            copy_secs: 3600,
            round_secs: None,
            kill_grace_millis: 2000,
        }
    }
}

impl TimeoutConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_secs(self.operation_secs)
    }

    pub fn copy(&self) -> Duration {
        Duration::from_secs(self.copy_secs)
    }

    pub fn round(&self) -> Option<Duration> {
        self.round_secs.map(Duration::from_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }
}

impl RunnerConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/runner.toml");

        let mut config = RunnerConfig::default();
        config.backend = vec!["schroot".to_string(), "unstable".to_string()];
        config.timeouts.round_secs = Some(600);
        config.diff.normalize_permissions = true;
        config.save(&path).unwrap();

        let loaded = RunnerConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.timeouts.round(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "keep_staging = true\n[timeouts]\nstartup_secs = 5\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert!(config.keep_staging);
        assert_eq!(config.timeouts.startup(), Duration::from_secs(5));
        assert_eq!(config.timeouts.copy_secs, 3600);
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "keep_staging = \"maybe\"").unwrap();
        assert!(matches!(
            RunnerConfig::load(&path),
            Err(Error::InvalidConfig(_))
        ));
    }
}
