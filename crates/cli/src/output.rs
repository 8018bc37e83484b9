//! Output formatting for the CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use reprotest_common::{Error, ErrorKind, Verdict, VariationCatalog};
use reprotest_runner::RunOutcome;
use serde_json::json;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Process exit status for a finished run
pub fn exit_code(result: &Result<RunOutcome, Error>) -> i32 {
    match result {
        Ok(outcome) => match outcome.report.verdict {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
            Verdict::Error => 2,
        },
        Err(e) if e.kind() == ErrorKind::ArtifactNotFound => 1,
        Err(_) => 2,
    }
}

fn verdict_cell(verdict: Verdict) -> String {
    match verdict {
        Verdict::Pass => "PASS".green().bold().to_string(),
        Verdict::Fail => "FAIL".red().bold().to_string(),
        Verdict::Error => "ERROR".yellow().bold().to_string(),
    }
}

/// Print the outcome of a run
pub fn print_outcome(outcome: &RunOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcome).unwrap_or_default());
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Artifact", "Pattern", "Verdict", "Details"]);

            for artifact in &outcome.report.artifacts {
                let details = match &artifact.error {
                    Some(error) => error.clone(),
                    None => artifact
                        .differences
                        .iter()
                        .map(|d| d.summary())
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                table.add_row(vec![
                    artifact.path.clone(),
                    artifact.pattern.clone(),
                    verdict_cell(artifact.verdict),
                    details,
                ]);
            }

            println!("{table}");
            println!();
            let variations = if outcome.variations.is_empty() {
                "none".to_string()
            } else {
                outcome.variations.join(", ")
            };
            println!("{} {}", "Varied:".bold(), variations);
            if let Some(staging) = &outcome.staging {
                println!("{} {}", "Artifacts kept in:".bold(), staging.display());
            }
            let summary = match outcome.report.verdict {
                Verdict::Pass => "Reproducible".green().bold(),
                Verdict::Fail => "Not reproducible".red().bold(),
                Verdict::Error => "Comparison failed".yellow().bold(),
            };
            println!("{} {}", "Result:".bold(), summary);
        }
    }
}

/// Print an error that ended the run
pub fn print_error(error: &Error, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let failure = error.to_failure();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "error": failure })).unwrap_or_default()
            );
        }
        OutputFormat::Table => {
            eprintln!("{} {}", "Error:".red().bold(), error);
        }
    }
}

/// Print the variation catalog
pub fn print_variations(catalog: &VariationCatalog, format: OutputFormat) {
    let defaults = catalog.default_set();
    match format {
        OutputFormat::Json => {
            let entries: Vec<_> = catalog
                .iter()
                .map(|v| {
                    json!({
                        "name": v.name,
                        "dimension": v.dimension.as_str(),
                        "a": v.a.value,
                        "b": v.b.value,
                        "requires": v.requires.as_ref().map(|c| c.as_str().to_string()),
                        "default": defaults.contains(&v.name),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Variation", "Round A", "Round B", "Notes"]);
            for v in catalog.iter() {
                let mut notes = Vec::new();
                if !defaults.contains(&v.name) {
                    notes.push("not in default set".to_string());
                }
                if let Some(capability) = &v.requires {
                    notes.push(format!("needs {}", capability.as_str()));
                }
                table.add_row(vec![
                    v.name.clone(),
                    v.a.value.clone(),
                    v.b.value.clone(),
                    notes.join(", "),
                ]);
            }
            println!("{table}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reprotest_common::{DiffReport, Round};

    fn outcome(verdict: Verdict) -> RunOutcome {
        RunOutcome {
            report: DiffReport {
                verdict,
                artifacts: Vec::new(),
            },
            variations: Vec::new(),
            rounds: Vec::new(),
            staging: None,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(outcome(Verdict::Pass))), 0);
        assert_eq!(exit_code(&Ok(outcome(Verdict::Fail))), 1);
        assert_eq!(exit_code(&Ok(outcome(Verdict::Error))), 2);

        let missing = Error::ArtifactNotFound {
            round: Round::B,
            pattern: "*.deb".to_string(),
        };
        assert_eq!(exit_code(&Err(missing)), 1);

        let failed = Error::BuildFailure {
            round: Round::A,
            exit_code: 2,
        };
        assert_eq!(exit_code(&Err(failed)), 2);
        assert_eq!(exit_code(&Err(Error::Cancelled)), 2);
    }
}
