//! Core types for reprotest

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One of the two build executions being compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Round {
    A,
    B,
}

impl Round {
    pub const ALL: [Round; 2] = [Round::A, Round::B];

    /// Lowercase name used for staging directories and testbed paths
    pub fn dir_name(&self) -> &'static str {
        match self {
            Round::A => "a",
            Round::B => "b",
        }
    }

    pub fn other(&self) -> Round {
        match self {
            Round::A => Round::B,
            Round::B => Round::A,
        }
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Round::A => write!(f, "A"),
            Round::B => write!(f, "B"),
        }
    }
}

/// The build command of a [`BuildSpec`].
///
/// A plain string is run through `sh -ec`; a list is executed as an argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildCommand {
    Shell(String),
    Argv(Vec<String>),
}

impl BuildCommand {
    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(script.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn to_argv(&self) -> Vec<String> {
        match self {
            BuildCommand::Shell(script) => {
                vec!["sh".to_string(), "-ec".to_string(), script.clone()]
            }
            BuildCommand::Argv(argv) => argv.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            BuildCommand::Shell(script) => script.trim().is_empty(),
            BuildCommand::Argv(argv) => argv.is_empty(),
        }
    }
}

impl std::fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildCommand::Shell(script) => write!(f, "{}", script),
            BuildCommand::Argv(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// Fully resolved description of what to build and compare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub command: BuildCommand,
    pub artifacts: Vec<String>,
    pub source_root: PathBuf,
    #[serde(default)]
    pub variations: Vec<String>,
    #[serde(default)]
    pub init_command: Option<BuildCommand>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub backend_args: Vec<String>,
}

impl BuildSpec {
    pub fn new(command: BuildCommand, source_root: impl Into<PathBuf>) -> Self {
        Self {
            command,
            artifacts: Vec::new(),
            source_root: source_root.into(),
            variations: Vec::new(),
            init_command: None,
            env: BTreeMap::new(),
            backend_args: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, pattern: impl Into<String>) -> Self {
        self.artifacts.push(pattern.into());
        self
    }

    pub fn with_variations<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variations = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_init_command(mut self, command: BuildCommand) -> Self {
        self.init_command = Some(command);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Testbed capability advertised by a backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Revert,
    RootOnTestbed,
    IsolationContainer,
    IsolationMachine,
    Other(String),
}

impl Capability {
    pub fn parse(token: &str) -> Self {
        match token {
            "revert" => Capability::Revert,
            "root-on-testbed" => Capability::RootOnTestbed,
            "isolation-container" => Capability::IsolationContainer,
            "isolation-machine" => Capability::IsolationMachine,
            other => Capability::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Capability::Revert => "revert",
            Capability::RootOnTestbed => "root-on-testbed",
            Capability::IsolationContainer => "isolation-container",
            Capability::IsolationMachine => "isolation-machine",
            Capability::Other(token) => token,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Set of capabilities negotiated with a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tokens
                .into_iter()
                .map(|t| Capability::parse(t.as_ref()))
                .collect(),
        )
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn supports_revert(&self) -> bool {
        self.contains(&Capability::Revert)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tokens: Vec<&str> = self.0.iter().map(|c| c.as_str()).collect();
        write!(f, "{}", tokens.join(" "))
    }
}

/// Lifecycle state of a testbed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Executing,
    Reverting,
    Closing,
    Failed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Closed
    }
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, Opening) => true,
            (Opening, Open) => true,
            (Open, Executing) | (Open, Reverting) | (Open, Closing) => true,
            (Executing, Open) | (Reverting, Open) => true,
            (Closing, Closed) => true,
            (Closed, Failed) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Closed => write!(f, "closed"),
            SessionState::Opening => write!(f, "opening"),
            SessionState::Open => write!(f, "open"),
            SessionState::Executing => write!(f, "executing"),
            SessionState::Reverting => write!(f, "reverting"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Output captured from the auxiliary stream during one `run`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub lines: VecDeque<String>,
    /// Set when lines were dropped because the capture limit was reached
    pub truncated: bool,
}

impl CapturedOutput {
    /// Append a line, keeping at most `limit` lines (the most recent ones).
    pub fn push_bounded(&mut self, line: String, limit: usize) {
        if limit == 0 {
            self.truncated = true;
            return;
        }
        while self.lines.len() >= limit {
            self.lines.pop_front();
            self.truncated = true;
        }
        self.lines.push_back(line);
    }
}

/// Outcome of one command executed in a testbed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub output: CapturedOutput,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Artifacts staged on the host for one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub round: Round,
    /// Relative path -> staged file location
    pub entries: BTreeMap<String, PathBuf>,
    /// Glob pattern -> relative paths it matched
    pub matches: BTreeMap<String, BTreeSet<String>>,
}

impl ArtifactSet {
    pub fn new(round: Round) -> Self {
        Self {
            round,
            entries: BTreeMap::new(),
            matches: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, pattern: &str, relative: impl Into<String>, staged: impl Into<PathBuf>) {
        let relative = relative.into();
        self.matches
            .entry(pattern.to_string())
            .or_default()
            .insert(relative.clone());
        self.entries.insert(relative, staged.into());
    }

    pub fn staged_path(&self, relative: &str) -> Option<&Path> {
        self.entries.get(relative).map(PathBuf::as_path)
    }

    pub fn matches_for(&self, pattern: &str) -> impl Iterator<Item = &String> {
        self.matches.get(pattern).into_iter().flatten()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &String> {
        self.matches.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        use SessionState::*;
        assert!(Closed.can_transition_to(Opening));
        assert!(Open.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Open));
        assert!(!Executing.can_transition_to(Reverting));
    }

    #[test]
    fn test_build_command_untagged() {
        let shell: BuildCommand = serde_json::from_str("\"make all\"").unwrap();
        assert_eq!(shell.to_argv(), vec!["sh", "-ec", "make all"]);

        let argv: BuildCommand = serde_json::from_str(r#"["make", "-j1"]"#).unwrap();
        assert_eq!(argv.to_argv(), vec!["make", "-j1"]);
    }

    #[test]
    fn test_capability_tokens() {
        let caps = CapabilitySet::from_tokens(["revert", "downtmp-host=/tmp"]);
        assert!(caps.supports_revert());
        assert!(!caps.contains(&Capability::RootOnTestbed));
        assert!(caps.contains(&Capability::Other("downtmp-host=/tmp".to_string())));
    }

    #[test]
    fn test_captured_output_bound() {
        let mut out = CapturedOutput::default();
        for i in 0..5 {
            out.push_bounded(format!("line {}", i), 3);
        }
        assert_eq!(out.lines, vec!["line 2", "line 3", "line 4"]);
        assert!(out.truncated);

        // A lower limit on a later push drops the excess at once.
        out.push_bounded("line 5".to_string(), 1);
        assert_eq!(out.lines, vec!["line 5"]);
    }
}
