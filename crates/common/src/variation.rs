//! Variation catalog and execution plans
//!
//! A variation perturbs one environment dimension differently in the two
//! rounds. The catalog resolves a requested set of names into an
//! [`ExecutionPlan`]: lexically ordered, conflict-free, with the composed
//! wrapper of each round recorded up front.

use crate::error::{Error, Result};
use crate::types::{Capability, CapabilitySet, Round};
use crate::wrapper::{Arg, PathRef, Step, Wrapper};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Tree name used when `build-path` is not varied
pub const DEFAULT_TREE_NAME: &str = "build";

/// Environment axis controlled by a variation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dimension {
    BuildPath,
    DomainHost,
    Environment,
    ExecPath,
    FileCreationMask,
    FileOrdering,
    Home,
    Kernel,
    Locales,
    Shell,
    Time,
    Timezone,
    UserGroup,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::BuildPath => "build-path",
            Dimension::DomainHost => "domain-host",
            Dimension::Environment => "environment",
            Dimension::ExecPath => "exec-path",
            Dimension::FileCreationMask => "file-creation-mask",
            Dimension::FileOrdering => "file-ordering",
            Dimension::Home => "home",
            Dimension::Kernel => "kernel",
            Dimension::Locales => "locales",
            Dimension::Shell => "shell",
            Dimension::Time => "time",
            Dimension::Timezone => "timezone",
            Dimension::UserGroup => "user-group",
        }
    }

    /// Whether `value` is a usable setting for this dimension
    pub fn validate(&self, value: &str) -> bool {
        if value.is_empty() || value.contains(char::is_whitespace) {
            return false;
        }
        match self {
            Dimension::BuildPath => !value.contains('/') && value != "." && value != "..",
            Dimension::FileCreationMask => match u32::from_str_radix(value, 8) {
                // The owner must keep read and write access to what it creates.
                Ok(mask) => value.len() == 4 && mask & 0o600 == 0,
                Err(_) => false,
            },
            Dimension::Home | Dimension::Shell => value.starts_with('/'),
            Dimension::Locales => value.ends_with(".UTF-8"),
            Dimension::Timezone => parse_gmt_offset(value).is_some(),
            Dimension::Time => value
                .strip_prefix('+')
                .and_then(|v| v.strip_suffix("days"))
                .map(|days| days.parse::<u32>().is_ok())
                .unwrap_or(false),
            Dimension::ExecPath => value.split(':').all(|entry| entry.starts_with('/')),
            Dimension::UserGroup => value.split(':').all(|id| id.parse::<u32>().is_ok()),
            Dimension::DomainHost
            | Dimension::Environment
            | Dimension::FileOrdering
            | Dimension::Kernel => true,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// POSIX `GMT+h`/`GMT-h` zones, within the range libc accepts
fn parse_gmt_offset(value: &str) -> Option<i32> {
    let hours: i32 = value.strip_prefix("GMT")?.parse().ok()?;
    (-14..=12).contains(&hours).then_some(hours)
}

/// What a variation does in one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSetting {
    /// The concrete value of the dimension in this round
    pub value: String,
    pub wrapper: Wrapper,
    pub init: Vec<Step>,
    pub cleanup: Vec<Step>,
    /// Overrides the name of the source tree copy on the testbed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_name: Option<String>,
}

impl RoundSetting {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            wrapper: Wrapper::identity(),
            init: Vec::new(),
            cleanup: Vec::new(),
            tree_name: None,
        }
    }

    pub fn wrap(mut self, wrapper: Wrapper) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub fn init_step(mut self, step: Step) -> Self {
        self.init.push(step);
        self
    }

    pub fn cleanup_step(mut self, step: Step) -> Self {
        self.cleanup.push(step);
        self
    }

    pub fn tree(mut self, name: impl Into<String>) -> Self {
        self.tree_name = Some(name.into());
        self
    }
}

/// A named perturbation strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variation {
    pub name: String,
    pub dimension: Dimension,
    /// Testbed capability the variation cannot work without
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<Capability>,
    /// Legacy names are accepted on request but never selected by default
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub legacy: bool,
    pub a: RoundSetting,
    pub b: RoundSetting,
}

impl Variation {
    pub fn new(name: impl Into<String>, dimension: Dimension, a: RoundSetting, b: RoundSetting) -> Self {
        Self {
            name: name.into(),
            dimension,
            requires: None,
            legacy: false,
            a,
            b,
        }
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.requires = Some(capability);
        self
    }

    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    pub fn round(&self, round: Round) -> &RoundSetting {
        match round {
            Round::A => &self.a,
            Round::B => &self.b,
        }
    }
}

/// Wrapper running the command under `sh -c '<script>' <args>`; the wrapped
/// argv follows the script arguments and is reached through `exec "$@"`.
fn sh_wrapper(script: &str, args: &[&str]) -> Wrapper {
    let mut prefix = vec!["sh", "-c", script];
    prefix.extend_from_slice(args);
    Wrapper::identity().prepend(prefix)
}

fn umask_setting(mask: &str) -> RoundSetting {
    RoundSetting::new(mask).wrap(sh_wrapper("umask \"$0\" && exec \"$@\"", &[mask]))
}

fn file_creation_mask(name: &str) -> Variation {
    Variation::new(
        name,
        Dimension::FileCreationMask,
        umask_setting("0022"),
        umask_setting("0002"),
    )
}

fn env_setting(key: &str, value: &str) -> RoundSetting {
    RoundSetting::new(value).wrap(Wrapper::identity().set_env(key, value))
}

fn builtin_variations() -> Vec<Variation> {
    let disorderfs_mount = || PathRef::Scratch("disorderfs".to_string());

    vec![
        Variation::new(
            "build-path",
            Dimension::BuildPath,
            RoundSetting::new(DEFAULT_TREE_NAME).tree(DEFAULT_TREE_NAME),
            RoundSetting::new("build-experiment").tree("build-experiment"),
        ),
        Variation::new(
            "domain-host",
            Dimension::DomainHost,
            RoundSetting::new("inherited"),
            RoundSetting::new("reprotest-capture-host").wrap(Wrapper::identity().prepend([
                "unshare",
                "--uts",
                "--",
                "sh",
                "-c",
                "hostname \"$0\" && domainname \"$1\" && shift && exec \"$@\"",
                "reprotest-capture-host",
                "reprotest-capture-domain",
            ])),
        )
        .requires(Capability::RootOnTestbed),
        Variation::new(
            "environment",
            Dimension::Environment,
            RoundSetting::new("unset")
                .wrap(Wrapper::identity().unset_env("CAPTURE_ENVIRONMENT")),
            env_setting("CAPTURE_ENVIRONMENT", "i_capture_the_environment"),
        ),
        Variation::new(
            "exec-path",
            Dimension::ExecPath,
            RoundSetting::new("/usr/bin:/bin"),
            RoundSetting::new("/usr/bin:/bin:/i_capture_the_path").wrap(sh_wrapper(
                "PATH=\"$PATH:$0\" && export PATH && exec \"$@\"",
                &["/i_capture_the_path"],
            )),
        ),
        file_creation_mask("file-creation-mask"),
        Variation::new(
            "file-ordering",
            Dimension::FileOrdering,
            RoundSetting::new("native"),
            RoundSetting::new("shuffled")
                .wrap(Wrapper::identity().chdir(disorderfs_mount()))
                .init_step(Step::new([Arg::from("mkdir"), Arg::from("-p"), disorderfs_mount().into()]))
                .init_step(Step::new([
                    Arg::from("disorderfs"),
                    Arg::from("--shuffle-dirents=yes"),
                    PathRef::Tree.into(),
                    disorderfs_mount().into(),
                ]))
                .cleanup_step(Step::new([
                    Arg::from("fusermount"),
                    Arg::from("-u"),
                    disorderfs_mount().into(),
                ])),
        ),
        Variation::new(
            "home",
            Dimension::Home,
            env_setting("HOME", "/nonexistent/first-build"),
            env_setting("HOME", "/nonexistent/second-build"),
        ),
        Variation::new(
            "kernel",
            Dimension::Kernel,
            RoundSetting::new("native"),
            RoundSetting::new("2.6").wrap(Wrapper::identity().prepend(["linux64", "--uname-2.6"])),
        ),
        Variation::new(
            "locales",
            Dimension::Locales,
            RoundSetting::new("C.UTF-8").wrap(
                Wrapper::identity()
                    .set_env("LANG", "C.UTF-8")
                    .set_env("LANGUAGE", "en_US:en")
                    .unset_env("LC_ALL"),
            ),
            RoundSetting::new("fr_CH.UTF-8").wrap(
                Wrapper::identity()
                    .set_env("LANG", "fr_CH.UTF-8")
                    .set_env("LANGUAGE", "fr_CH:fr")
                    .set_env("LC_ALL", "fr_CH.UTF-8"),
            ),
        ),
        Variation::new(
            "shell",
            Dimension::Shell,
            env_setting("SHELL", "/bin/sh"),
            env_setting("SHELL", "/bin/bash"),
        ),
        Variation::new(
            "time",
            Dimension::Time,
            RoundSetting::new("+0days"),
            RoundSetting::new("+373days")
                .wrap(Wrapper::identity().prepend(["faketime", "+373days"])),
        ),
        Variation::new(
            "timezone",
            Dimension::Timezone,
            env_setting("TZ", "GMT+12"),
            env_setting("TZ", "GMT-14"),
        ),
        file_creation_mask("umask").legacy(),
        Variation::new(
            "user-group",
            Dimension::UserGroup,
            RoundSetting::new("0:0"),
            RoundSetting::new("65534:65534")
                .init_step(Step::new([Arg::from("chmod"), Arg::from("a+x"), PathRef::Scratch(String::new()).into()]))
                .init_step(Step::new([
                    Arg::from("chown"),
                    Arg::from("-R"),
                    Arg::from("65534:65534"),
                    PathRef::Tree.into(),
                ]))
                .wrap(Wrapper::identity().prepend([
                    "setpriv",
                    "--reuid=65534",
                    "--regid=65534",
                    "--clear-groups",
                ])),
        )
        .requires(Capability::RootOnTestbed),
    ]
}

/// Registry of variation strategies keyed by name
#[derive(Debug, Clone)]
pub struct VariationCatalog {
    entries: BTreeMap<String, Variation>,
}

impl Default for VariationCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VariationCatalog {
    /// An empty catalog
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The catalog of built-in variations
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for variation in builtin_variations() {
            catalog.register(variation);
        }
        catalog
    }

    pub fn register(&mut self, variation: Variation) {
        self.entries.insert(variation.name.clone(), variation);
    }

    pub fn get(&self, name: &str) -> Option<&Variation> {
        self.entries.get(&normalize_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variation> {
        self.entries.values()
    }

    /// Names selected when the caller does not ask for specific variations
    pub fn default_set(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|v| !v.legacy && v.requires.is_none())
            .map(|v| v.name.clone())
            .collect()
    }

    /// Turn a user request into variation names.
    ///
    /// An empty request or the token `all` selects the default set;
    /// `dont_vary` entries are then removed. Every name must be registered.
    pub fn select(&self, requested: &[String], dont_vary: &[String]) -> Result<Vec<String>> {
        let mut selected = BTreeSet::new();
        if requested.is_empty() {
            selected.extend(self.default_set());
        }
        for name in requested {
            if name == "all" {
                selected.extend(self.default_set());
            } else {
                selected.insert(self.known(name)?);
            }
        }
        for name in dont_vary {
            let name = self.known(name)?;
            selected.remove(&name);
        }
        Ok(selected.into_iter().collect())
    }

    fn known(&self, name: &str) -> Result<String> {
        let normalized = normalize_name(name);
        if self.entries.contains_key(&normalized) {
            Ok(normalized)
        } else {
            Err(Error::UnknownVariation(name.to_string()))
        }
    }

    /// Resolve variation names into an execution plan.
    ///
    /// Input order and duplicates do not matter. Fails before anything runs
    /// if a name is unknown or two names control the same dimension.
    pub fn resolve<I, S>(&self, names: I) -> Result<ExecutionPlan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut wanted = BTreeSet::new();
        for name in names {
            wanted.insert(self.known(name.as_ref())?);
        }

        let mut owners: BTreeMap<Dimension, &str> = BTreeMap::new();
        let mut variations = Vec::with_capacity(wanted.len());
        for name in &wanted {
            let variation = &self.entries[name];
            if let Some(first) = owners.insert(variation.dimension, name) {
                return Err(Error::VariationConflict {
                    dimension: variation.dimension.to_string(),
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
            variations.push(variation.clone());
        }

        let compose = |round: Round| {
            variations
                .iter()
                .fold(Wrapper::identity(), |acc, v| acc.then(&v.round(round).wrapper))
        };
        let wrappers = Round::ALL.iter().map(|r| (*r, compose(*r))).collect();

        Ok(ExecutionPlan {
            variations,
            wrappers,
        })
    }
}

/// Names earlier releases used for variations that were since renamed
const LEGACY_NAMES: &[(&str, &str)] = &[
    ("captures-environment", "environment"),
    ("fileordering", "file-ordering"),
    ("path", "exec-path"),
];

/// Accept underscores for dashes and the legacy names above
fn normalize_name(name: &str) -> String {
    let name = name.trim().replace('_', "-");
    LEGACY_NAMES
        .iter()
        .find(|(old, _)| *old == name)
        .map(|(_, current)| current.to_string())
        .unwrap_or(name)
}

/// The resolved, ordered set of variations for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    variations: Vec<Variation>,
    wrappers: BTreeMap<Round, Wrapper>,
}

impl ExecutionPlan {
    /// A plan that varies nothing
    pub fn empty() -> Self {
        Self {
            variations: Vec::new(),
            wrappers: Round::ALL.iter().map(|r| (*r, Wrapper::identity())).collect(),
        }
    }

    pub fn variations(&self) -> &[Variation] {
        &self.variations
    }

    pub fn names(&self) -> Vec<&str> {
        self.variations.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.variations.is_empty()
    }

    /// Composed wrapper chain of a round, first variation innermost
    pub fn wrapper(&self, round: Round) -> Wrapper {
        self.wrappers.get(&round).cloned().unwrap_or_default()
    }

    /// Name of the source tree copy on the testbed
    pub fn tree_name(&self, round: Round) -> &str {
        self.variations
            .iter()
            .find_map(|v| v.round(round).tree_name.as_deref())
            .unwrap_or(DEFAULT_TREE_NAME)
    }

    /// Init steps in plan order
    pub fn init_steps(&self, round: Round) -> Vec<&Step> {
        self.variations
            .iter()
            .flat_map(|v| v.round(round).init.iter())
            .collect()
    }

    /// Cleanup steps, last variation first
    pub fn cleanup_steps(&self, round: Round) -> Vec<&Step> {
        self.variations
            .iter()
            .rev()
            .flat_map(|v| v.round(round).cleanup.iter())
            .collect()
    }

    /// Check every variation's required capability against a session.
    pub fn check_capabilities(&self, capabilities: &CapabilitySet) -> Result<()> {
        for variation in &self.variations {
            if let Some(required) = &variation.requires {
                if !capabilities.contains(required) {
                    return Err(Error::UnsupportedVariation {
                        name: variation.name.clone(),
                        capability: required.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::RoundPaths;
    use proptest::prelude::*;

    #[test]
    fn test_round_values_distinct_and_valid() {
        let catalog = VariationCatalog::builtin();
        for v in catalog.iter() {
            assert_ne!(v.a.value, v.b.value, "{} does not vary", v.name);
            assert!(v.dimension.validate(&v.a.value), "{} A: {}", v.name, v.a.value);
            assert!(v.dimension.validate(&v.b.value), "{} B: {}", v.name, v.b.value);
        }
    }

    #[test]
    fn test_unknown_variation() {
        let err = VariationCatalog::builtin()
            .resolve(["time", "moon-phase"])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownVariation(ref n) if n == "moon-phase"));
    }

    #[test]
    fn test_conflict_on_same_dimension() {
        let err = VariationCatalog::builtin()
            .resolve(["umask", "file-creation-mask"])
            .unwrap_err();
        match err {
            Error::VariationConflict {
                dimension,
                first,
                second,
            } => {
                assert_eq!(dimension, "file-creation-mask");
                assert_eq!(first, "file-creation-mask");
                assert_eq!(second, "umask");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_default_set_excludes_root_and_legacy() {
        let defaults = VariationCatalog::builtin().default_set();
        assert!(defaults.contains(&"time".to_string()));
        assert!(!defaults.contains(&"umask".to_string()));
        assert!(!defaults.contains(&"user-group".to_string()));
        assert!(!defaults.contains(&"domain-host".to_string()));
        VariationCatalog::builtin().resolve(&defaults).unwrap();
    }

    #[test]
    fn test_legacy_names() {
        let catalog = VariationCatalog::builtin();
        assert_eq!(catalog.get("fileordering").unwrap().name, "file-ordering");

        let selected = catalog
            .select(
                &["captures_environment".to_string(), "path".to_string(), "exec-path".to_string()],
                &[],
            )
            .unwrap();
        assert_eq!(selected, vec!["environment", "exec-path"]);
    }

    #[test]
    fn test_select_with_dont_vary() {
        let catalog = VariationCatalog::builtin();
        let selected = catalog
            .select(&["all".to_string()], &["time".to_string(), "file_ordering".to_string()])
            .unwrap();
        assert!(!selected.contains(&"time".to_string()));
        assert!(!selected.contains(&"file-ordering".to_string()));
        assert!(selected.contains(&"timezone".to_string()));

        let err = catalog.select(&[], &["bogus".to_string()]).unwrap_err();
        assert!(matches!(err, Error::UnknownVariation(_)));
    }

    #[test]
    fn test_plan_wrapper_and_tree() {
        let plan = VariationCatalog::builtin()
            .resolve(["timezone", "build-path", "time"])
            .unwrap();
        assert_eq!(plan.names(), vec!["build-path", "time", "timezone"]);
        assert_eq!(plan.tree_name(Round::A), "build");
        assert_eq!(plan.tree_name(Round::B), "build-experiment");

        let paths = RoundPaths::new("/s", plan.tree_name(Round::B));
        let inv = plan
            .wrapper(Round::B)
            .apply(&["make".to_string()], &BTreeMap::new(), &paths);
        assert_eq!(inv.argv, vec!["faketime", "+373days", "make"]);
        assert_eq!(inv.env.get("TZ").map(String::as_str), Some("GMT-14"));
        assert_eq!(inv.cwd, "/s/build-experiment");
    }

    #[test]
    fn test_file_ordering_steps() {
        let plan = VariationCatalog::builtin().resolve(["file-ordering"]).unwrap();
        assert!(plan.init_steps(Round::A).is_empty());

        let paths = RoundPaths::new("/s", "build");
        let init: Vec<_> = plan
            .init_steps(Round::B)
            .iter()
            .map(|s| s.resolve(&paths).0)
            .collect();
        assert_eq!(init[1], vec!["disorderfs", "--shuffle-dirents=yes", "/s/build", "/s/disorderfs"]);

        let cleanup = plan.cleanup_steps(Round::B);
        assert_eq!(cleanup[0].resolve(&paths).0, vec!["fusermount", "-u", "/s/disorderfs"]);
        assert_eq!(plan.wrapper(Round::B).apply(&[], &BTreeMap::new(), &paths).cwd, "/s/disorderfs");
    }

    #[test]
    fn test_capability_check() {
        let plan = VariationCatalog::builtin().resolve(["user-group"]).unwrap();
        let err = plan
            .check_capabilities(&CapabilitySet::from_tokens(["revert"]))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVariation { .. }));
        plan.check_capabilities(&CapabilitySet::from_tokens(["root-on-testbed"]))
            .unwrap();
    }

    #[test]
    fn test_timezone_validation() {
        assert!(Dimension::Timezone.validate("GMT+12"));
        assert!(Dimension::Timezone.validate("GMT-14"));
        assert!(!Dimension::Timezone.validate("GMT+13"));
        assert!(!Dimension::FileCreationMask.validate("0777"));
    }

    proptest! {
        #[test]
        fn test_resolution_is_order_independent(
            names in proptest::sample::subsequence(VariationCatalog::builtin().default_set(), 0..=10)
                .prop_shuffle(),
            extra in proptest::sample::subsequence(VariationCatalog::builtin().default_set(), 0..=3),
        ) {
            let catalog = VariationCatalog::builtin();
            let mut sorted = names.clone();
            sorted.sort();
            let mut with_dups = names.clone();
            with_dups.extend(extra.into_iter().filter(|n| names.contains(n)));

            let shuffled = catalog.resolve(&names).unwrap();
            prop_assert_eq!(&shuffled, &catalog.resolve(&sorted).unwrap());
            prop_assert_eq!(&shuffled, &catalog.resolve(&with_dups).unwrap());
        }
    }
}
