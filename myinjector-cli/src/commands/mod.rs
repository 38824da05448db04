//! Subcommands and the helpers they share.

pub mod app;
pub mod apply;
pub mod daemon;
pub mod deploy;
pub mod diff;
pub mod gadget;
pub mod payload;
pub mod settings;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;

use myinjector_core::{EngineSettings, PackageName};
use myinjector_sync::{
    CleanupReport, DeploymentReport, Engine, MutationOutcome, Reconciliation, StepOutcome,
};

/// Resolved settings plus where they came from.
#[derive(Debug)]
pub struct Env {
    pub settings: EngineSettings,
    pub settings_path: Option<PathBuf>,
}

impl Env {
    /// `--settings` / `MYINJECTOR_SETTINGS`, else the per-user config
    /// directory, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.map(Path::to_path_buf).or_else(default_settings_path);
        let settings = match &path {
            Some(path) => EngineSettings::load_at(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => EngineSettings::default(),
        };
        Ok(Self {
            settings,
            settings_path: path.filter(|p| p.exists()),
        })
    }

    pub fn engine(&self) -> Engine {
        Engine::from_settings(self.settings.clone())
    }
}

fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("myinjector").join("settings.yaml"))
}

pub fn package(raw: &str) -> Result<PackageName> {
    PackageName::parse(raw).with_context(|| format!("'{raw}' is not a package name"))
}

pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(format!("expected true or false, got '{other}'")),
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn warn_unsaved(persist_error: Option<&str>) {
    if let Some(err) = persist_error {
        eprintln!(
            "{} change kept in memory only: {err}",
            "warning:".yellow().bold()
        );
    }
}

pub fn print_mutation(outcome: &MutationOutcome) {
    if !outcome.changed {
        println!("nothing to change");
    }
    warn_unsaved(outcome.persist_error.as_deref());
    for reconciliation in &outcome.reconciliations {
        print_reconciliation(reconciliation);
    }
}

pub fn print_reconciliation(reconciliation: &Reconciliation) {
    match reconciliation {
        Reconciliation::Deployed(report) => print_deployment(report),
        Reconciliation::Cleaned(report) => print_cleanup(report),
        Reconciliation::Skipped { package, reason } => {
            println!("{} {package}: {reason}", "-".bright_black());
        }
    }
}

pub fn print_deployment(report: &DeploymentReport) {
    println!(
        "{} {} ({} of {} payloads)",
        "deployed".green().bold(),
        report.package,
        report.deployed_names().len(),
        report.files.len(),
    );
    for file in report.files.iter().chain(report.gadget.iter()) {
        let detail = [
            ("copy", &file.copy),
            ("chmod", &file.chmod),
            ("chown", &file.chown),
            ("label", &file.label),
        ]
        .iter()
        .filter(|(_, outcome)| !matches!(outcome, StepOutcome::Ok))
        .map(|(step, outcome)| format!("{step} {}", outcome_text(outcome)))
        .collect::<Vec<_>>()
        .join(", ");
        println!("  {} {}  {}", step_marker(&file.copy), file.name, detail.bright_black());
    }
}

pub fn print_cleanup(report: &CleanupReport) {
    println!(
        "{} {} ({} files removed)",
        "cleaned".cyan().bold(),
        report.package,
        report.removed_names().len()
    );
    for removal in report.files.iter().chain(report.gadget.iter()) {
        println!(
            "  {} {}  {}",
            step_marker(&removal.outcome),
            removal.name,
            outcome_text(&removal.outcome).bright_black()
        );
    }
}

pub fn step_marker(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Ok => "✓".green().to_string(),
        StepOutcome::Recovered { .. } => "✓".yellow().to_string(),
        StepOutcome::Failed { .. } => "✗".red().to_string(),
        StepOutcome::Skipped { .. } => "-".bright_black().to_string(),
    }
}

pub fn outcome_text(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Ok => "ok".to_string(),
        StepOutcome::Recovered { strategy, .. } => format!("ok via {strategy}"),
        StepOutcome::Failed { reason } => format!("failed: {reason}"),
        StepOutcome::Skipped { reason } => format!("skipped: {reason}"),
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_words() {
        assert_eq!(parse_bool("On"), Ok(true));
        assert_eq!(parse_bool("0"), Ok(false));
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn explicit_missing_settings_file_means_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let env = Env::load(Some(&tmp.path().join("none.yaml"))).unwrap();
        assert_eq!(env.settings, EngineSettings::default());
        assert!(env.settings_path.is_none());
    }
}
