//! Structured command wrapping
//!
//! Variations never edit command strings. Each one contributes a [`Wrapper`]
//! (argv prefix, environment delta, optional working-directory override) and
//! wrappers compose structurally; the final [`Invocation`] is produced only
//! once the testbed paths of a round are known.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A testbed path that is only known once a session is open
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRef {
    /// The round's copy of the source tree
    Tree,
    /// A path relative to the session scratch directory
    Scratch(String),
}

/// One argument of a wrapped command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Lit(String),
    Path(PathRef),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Lit(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Lit(s)
    }
}

impl From<PathRef> for Arg {
    fn from(p: PathRef) -> Self {
        Arg::Path(p)
    }
}

/// Environment change applied by a wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvOp {
    Set(String),
    Unset,
}

/// Concrete testbed locations for one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPaths {
    pub scratch: String,
    pub tree: String,
}

impl RoundPaths {
    pub fn new(scratch: impl Into<String>, tree_name: &str) -> Self {
        let scratch = scratch.into();
        let tree = join(&scratch, tree_name);
        Self { scratch, tree }
    }

    pub fn resolve(&self, path: &PathRef) -> String {
        match path {
            PathRef::Tree => self.tree.clone(),
            PathRef::Scratch(rel) => join(&self.scratch, rel),
        }
    }

    fn resolve_arg(&self, arg: &Arg) -> String {
        match arg {
            Arg::Lit(s) => s.clone(),
            Arg::Path(p) => self.resolve(p),
        }
    }
}

/// Join a testbed directory and a relative path
pub fn join(dir: &str, rel: &str) -> String {
    if rel.is_empty() {
        return dir.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), rel.trim_start_matches('/'))
}

/// A command run on the testbed outside the build itself (init or cleanup step)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Step {
    pub argv: Vec<Arg>,
    pub cwd: Option<PathRef>,
}

impl Step {
    pub fn new<I, A>(argv: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn resolve(&self, paths: &RoundPaths) -> (Vec<String>, String) {
        let argv = self.argv.iter().map(|a| paths.resolve_arg(a)).collect();
        let cwd = self
            .cwd
            .as_ref()
            .map(|c| paths.resolve(c))
            .unwrap_or_else(|| paths.scratch.clone());
        (argv, cwd)
    }
}

/// A structured transformation of a base invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wrapper {
    /// Prepended to the argv, outermost first
    pub prefix: Vec<Arg>,
    pub env: BTreeMap<String, EnvOp>,
    pub cwd: Option<PathRef>,
}

impl Wrapper {
    /// The wrapper that changes nothing
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.prefix.is_empty() && self.env.is_empty() && self.cwd.is_none()
    }

    pub fn prepend<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let mut prefix: Vec<Arg> = args.into_iter().map(Into::into).collect();
        prefix.append(&mut self.prefix);
        self.prefix = prefix;
        self
    }

    pub fn set_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), EnvOp::Set(value.into()));
        self
    }

    pub fn unset_env(mut self, key: impl Into<String>) -> Self {
        self.env.insert(key.into(), EnvOp::Unset);
        self
    }

    pub fn chdir(mut self, path: PathRef) -> Self {
        self.cwd = Some(path);
        self
    }

    /// Compose: `self` is applied first, `outer` wraps the result.
    ///
    /// Associative: `a.then(b).then(c) == a.then(b.then(c))`.
    pub fn then(&self, outer: &Wrapper) -> Wrapper {
        let mut prefix = outer.prefix.clone();
        prefix.extend(self.prefix.iter().cloned());

        let mut env = self.env.clone();
        for (key, op) in &outer.env {
            env.insert(key.clone(), op.clone());
        }

        Wrapper {
            prefix,
            env,
            cwd: outer.cwd.clone().or_else(|| self.cwd.clone()),
        }
    }

    /// Produce the concrete invocation for a round.
    ///
    /// `base_env` holds the build spec's environment overrides; unset entries
    /// become an `env -u` prefix so they also remove variables inherited from
    /// the testbed.
    pub fn apply(
        &self,
        base_argv: &[String],
        base_env: &BTreeMap<String, String>,
        paths: &RoundPaths,
    ) -> Invocation {
        let mut env = base_env.clone();
        let mut unset = Vec::new();
        for (key, op) in &self.env {
            match op {
                EnvOp::Set(value) => {
                    env.insert(key.clone(), value.clone());
                }
                EnvOp::Unset => {
                    env.remove(key);
                    unset.push(key.clone());
                }
            }
        }

        let mut argv = Vec::new();
        if !unset.is_empty() {
            argv.push("env".to_string());
            for key in &unset {
                argv.push("-u".to_string());
                argv.push(key.clone());
            }
        }
        argv.extend(self.prefix.iter().map(|a| paths.resolve_arg(a)));
        argv.extend(base_argv.iter().cloned());

        let cwd = paths.resolve(self.cwd.as_ref().unwrap_or(&PathRef::Tree));

        Invocation { argv, env, cwd }
    }
}

/// A concrete command ready to be sent to the testbed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
}
