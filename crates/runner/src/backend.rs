//! Backend selection
//!
//! Maps a configuration string to the argv of the backend program speaking
//! the control protocol. The set of kinds is closed.

use reprotest_common::{Error, Result};
use std::path::Path;

/// Testbed backend kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Run directly on the host
    Null,
    /// schroot session of the named chroot
    Schroot(String),
    /// Virtual machine booted from the named image
    Qemu(String),
    /// The named LXC container
    Lxc(String),
    /// Remote host reached over ssh
    Ssh(String),
    /// Arbitrary program speaking the protocol
    Command(String),
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Null => "null",
            BackendKind::Schroot(_) => "schroot",
            BackendKind::Qemu(_) => "qemu",
            BackendKind::Lxc(_) => "lxc",
            BackendKind::Ssh(_) => "ssh",
            BackendKind::Command(_) => "command",
        }
    }

    fn target(&self) -> Option<&str> {
        match self {
            BackendKind::Null => None,
            BackendKind::Schroot(t)
            | BackendKind::Qemu(t)
            | BackendKind::Lxc(t)
            | BackendKind::Ssh(t)
            | BackendKind::Command(t) => Some(t),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{}:{}", self.name(), target),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// A backend kind plus its extra arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub kind: BackendKind,
    pub args: Vec<String>,
}

impl BackendSpec {
    pub fn null() -> Self {
        Self {
            kind: BackendKind::Null,
            args: Vec::new(),
        }
    }

    /// Parse `["kind", "target", args...]`; the first word may also be
    /// written `kind:target`.
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let mut words: Vec<String> = words.iter().map(|w| w.as_ref().to_string()).collect();
        if words.is_empty() {
            return Ok(Self::null());
        }

        let first = words.remove(0);
        let (kind, mut rest) = match first.split_once(':') {
            Some((kind, target)) => (kind.to_string(), vec![target.to_string()]),
            None => (first, Vec::new()),
        };
        rest.append(&mut words);

        let mut take_target = |kind: &str| -> Result<String> {
            if rest.is_empty() || rest[0].is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "backend `{}` needs a target argument",
                    kind
                )));
            }
            Ok(rest.remove(0))
        };

        let kind = match kind.as_str() {
            "null" => BackendKind::Null,
            "schroot" => BackendKind::Schroot(take_target("schroot")?),
            "qemu" => BackendKind::Qemu(take_target("qemu")?),
            "lxc" => BackendKind::Lxc(take_target("lxc")?),
            "ssh" => BackendKind::Ssh(take_target("ssh")?),
            "command" => BackendKind::Command(take_target("command")?),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown backend kind `{}`",
                    other
                )))
            }
        };

        Ok(Self { kind, args: rest })
    }

    /// Argv of the backend process
    pub fn argv(&self, null_program: &Path, extra: &[String]) -> Vec<String> {
        let mut argv = match &self.kind {
            BackendKind::Null => vec![null_program.display().to_string()],
            BackendKind::Command(program) => vec![program.clone()],
            other => vec![
                format!("reprotest-virt-{}", other.name()),
                other.target().unwrap_or_default().to_string(),
            ],
        };
        argv.extend(self.args.iter().cloned());
        argv.extend(extra.iter().cloned());
        argv
    }
}

impl std::str::FromStr for BackendSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let words: Vec<&str> = s.split_whitespace().collect();
        Self::parse(&words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(BackendSpec::parse::<&str>(&[]).unwrap(), BackendSpec::null());
        assert_eq!(
            BackendSpec::parse(&["schroot", "unstable-amd64"]).unwrap().kind,
            BackendKind::Schroot("unstable-amd64".to_string())
        );

        let spec: BackendSpec = "qemu:/var/lib/img.qcow2 --ram-size=2048".parse().unwrap();
        assert_eq!(spec.kind, BackendKind::Qemu("/var/lib/img.qcow2".to_string()));
        assert_eq!(spec.args, vec!["--ram-size=2048"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            BackendSpec::parse(&["docker"]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            BackendSpec::parse(&["ssh"]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_argv() {
        let null = Path::new("/opt/reprotest-virt-null");
        assert_eq!(
            BackendSpec::null().argv(null, &["--debug".to_string()]),
            vec!["/opt/reprotest-virt-null", "--debug"]
        );

        let lxc = BackendSpec::parse(&["lxc", "builder", "--ephemeral"]).unwrap();
        assert_eq!(
            lxc.argv(null, &[]),
            vec!["reprotest-virt-lxc", "builder", "--ephemeral"]
        );

        let cmd = BackendSpec::parse(&["command", "sh", "fake.sh"]).unwrap();
        assert_eq!(cmd.argv(null, &[]), vec!["sh", "fake.sh"]);
        assert_eq!(cmd.kind.to_string(), "command:sh");
    }
}
