//! reprotest - build twice under varied environments and compare the results

use clap::Parser;
use reprotest_common::{BuildCommand, BuildSpec, Error, Result, VariationCatalog};
use reprotest_runner::{BuildRunner, RunOutcome};
use std::path::PathBuf;
use tracing::{info, warn};

mod output;
mod settings;

use output::OutputFormat;
use settings::Settings;

/// Check whether a build is reproducible
#[derive(Parser, Debug)]
#[command(name = "reprotest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Build command, run through `sh -ec` in the source tree
    build_command: Option<String>,

    /// Artifact pattern, relative to the source tree
    artifact: Option<String>,

    /// Backend and its arguments, e.g. `-- schroot unstable-amd64`
    #[arg(last = true)]
    backend: Vec<String>,

    /// Additional artifact patterns
    #[arg(long = "artifact-pattern", value_name = "PATTERN")]
    artifact_patterns: Vec<String>,

    /// Directory to copy into the testbed and build in
    #[arg(short, long)]
    source_root: Option<PathBuf>,

    /// Command run in the source tree before each build, outside the variations
    #[arg(long, value_name = "COMMAND")]
    testbed_init: Option<String>,

    /// Variations to apply, comma separated; `all` selects the default set
    #[arg(long, value_delimiter = ',')]
    variations: Vec<String>,

    /// Variations to leave alone, comma separated
    #[arg(long, value_delimiter = ',')]
    dont_vary: Vec<String>,

    /// Extra environment for the build
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Settings file (default: .reprotest.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep the artifacts of both rounds in this directory
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Wall-clock limit for each build, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Compare member timestamps inside archives
    #[arg(long)]
    strict_metadata: bool,

    /// Program serving the null backend
    #[arg(long, env = "REPROTEST_VIRT_NULL")]
    null_program: Option<PathBuf>,

    /// List the known variations and exit
    #[arg(long)]
    list_variations: bool,

    /// Output format
    #[arg(long, default_value = "table")]
    format: OutputFormat,

    /// More logging; repeat for protocol traffic
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", s)),
    }
}

/// Merge command-line options over the settings file
fn assemble(cli: Cli, settings: Settings, catalog: &VariationCatalog) -> Result<(BuildRunner, BuildSpec)> {
    let basics = settings.basics;
    let mut config = settings.runner;

    let command = cli
        .build_command
        .or(basics.build_command)
        .ok_or_else(|| Error::InvalidConfig("no build command given".to_string()))?;

    let mut artifacts: Vec<String> = cli.artifact.into_iter().collect();
    artifacts.extend(cli.artifact_patterns);
    if artifacts.is_empty() {
        artifacts = basics.artifacts;
    }
    if artifacts.is_empty() {
        return Err(Error::InvalidConfig("no artifact pattern given".to_string()));
    }

    let requested = if cli.variations.is_empty() {
        basics.variations
    } else {
        cli.variations
    };
    let mut dont_vary = basics.dont_vary;
    dont_vary.extend(cli.dont_vary);
    let variations = catalog.select(&requested, &dont_vary)?;

    let source_root = cli
        .source_root
        .or(basics.source_root)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut spec = BuildSpec::new(BuildCommand::shell(command), source_root)
        .with_variations(variations);
    spec.artifacts = artifacts;
    if let Some(init) = cli.testbed_init.or(basics.testbed_init) {
        spec = spec.with_init_command(BuildCommand::shell(init));
    }
    for (key, value) in cli.env {
        spec = spec.with_env(key, value);
    }

    if !cli.backend.is_empty() {
        config.backend = cli.backend;
    }
    if let Some(dir) = cli.store_dir {
        config.staging_root = Some(dir);
        config.keep_staging = true;
    }
    if let Some(secs) = cli.timeout {
        config.timeouts.round_secs = Some(secs);
    }
    if cli.strict_metadata {
        config.diff.normalize_timestamps = false;
    }
    if let Some(program) = cli.null_program {
        config.null_program = program;
    }

    let runner = BuildRunner::new(config)?.with_catalog(catalog.clone());
    Ok((runner, spec))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(runner: BuildRunner, spec: BuildSpec) -> Result<RunOutcome> {
    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, tearing down the testbed");
            cancel.cancel();
        }
    });
    runner.run(&spec).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = cli.format;
    let catalog = VariationCatalog::builtin();

    if cli.list_variations {
        output::print_variations(&catalog, format);
        return Ok(());
    }

    let cwd = std::env::current_dir()?;
    let settings = match Settings::discover(cli.config.as_deref(), &cwd) {
        Ok(settings) => settings,
        Err(e) => {
            output::print_error(&e, format);
            std::process::exit(2);
        }
    };
    init_logging(cli.verbose.max(settings.basics.verbosity));
    info!("reprotest v{}", env!("CARGO_PKG_VERSION"));

    let result = match assemble(cli, settings, &catalog) {
        Ok((runner, spec)) => run(runner, spec).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(outcome) => output::print_outcome(outcome, format),
        Err(e) => output::print_error(e, format),
    }
    std::process::exit(output::exit_code(&result));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("reprotest").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_positional_and_backend() {
        let cli = parse(&[
            "make",
            "*.deb",
            "--variations",
            "home,time",
            "--",
            "schroot",
            "unstable-amd64",
        ]);
        assert_eq!(cli.build_command.as_deref(), Some("make"));
        assert_eq!(cli.variations, vec!["home", "time"]);
        assert_eq!(cli.backend, vec!["schroot", "unstable-amd64"]);
    }

    #[test]
    fn test_env_parser() {
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".to_string(), "b=c".to_string()));
        assert!(parse_env("=x").is_err());
        assert!(parse_env("novalue").is_err());
    }

    #[test]
    fn test_cli_overrides_settings() {
        let catalog = VariationCatalog::builtin();
        let mut settings = Settings::default();
        settings.basics.build_command = Some("make".to_string());
        settings.basics.artifacts = vec!["out/*".to_string()];
        settings.basics.dont_vary = vec!["kernel".to_string()];

        let cli = parse(&["--variations", "all", "--dont-vary", "time", "--timeout", "60"]);
        let (runner, spec) = assemble(cli, settings, &catalog).unwrap();

        assert_eq!(spec.command, BuildCommand::shell("make"));
        assert_eq!(spec.artifacts, vec!["out/*"]);
        assert!(!spec.variations.contains(&"kernel".to_string()));
        assert!(!spec.variations.contains(&"time".to_string()));
        assert!(spec.variations.contains(&"home".to_string()));
        assert_eq!(runner.config().timeouts.round_secs, Some(60));
    }

    #[test]
    fn test_missing_build_command() {
        let catalog = VariationCatalog::builtin();
        let err = assemble(parse(&[]), Settings::default(), &catalog).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_variation_rejected_early() {
        let catalog = VariationCatalog::builtin();
        let cli = parse(&["make", "out", "--variations", "colour"]);
        let err = assemble(cli, Settings::default(), &catalog).err().unwrap();
        assert!(matches!(err, Error::UnknownVariation(_)));
    }
}
