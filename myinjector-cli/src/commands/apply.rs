//! `myinjector apply`: install staged config files and redeploy.
//!
//! The request goes to the daemon when one is listening and is handled in
//! process otherwise.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use myinjector_daemon::{request_apply, DaemonError};
use myinjector_sync::{apply_remote, ApplyReport, ApplyRequest};

use super::{outcome_text, print_json, print_reconciliation, step_marker, Env};

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Package to apply for.
    pub package: String,

    /// Staged config document that replaces the live one.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Staged gadget config installed into the sandbox as is.
    #[arg(long, value_name = "PATH")]
    pub gadget_config: Option<PathBuf>,

    /// Install the staged files without redeploying payloads.
    #[arg(long)]
    pub deploy_only: bool,

    /// Do not contact the daemon.
    #[arg(long)]
    pub local: bool,

    #[arg(long)]
    pub json: bool,
}

impl ApplyArgs {
    fn request(&self) -> ApplyRequest {
        ApplyRequest {
            package: self.package.clone(),
            config_path: self.config.as_deref().map(absolute),
            gadget_config_path: self.gadget_config.as_deref().map(absolute),
            deploy_only: self.deploy_only,
        }
    }

    pub fn run(self, env: &Env) -> Result<()> {
        let request = self.request();

        if !self.local {
            match request_apply(&env.settings, request.clone()) {
                Ok(summary) => {
                    if self.json {
                        return print_json(&summary);
                    }
                    println!(
                        "{} {} via daemon ({} ms)",
                        "applied".green().bold(),
                        request.package,
                        summary["duration_ms"]
                    );
                    return Ok(());
                }
                Err(DaemonError::DaemonNotRunning { .. }) => {
                    tracing::debug!("daemon not running, applying in process");
                }
                Err(err) => return Err(err).context("daemon refused the apply request"),
            }
        }

        let report = apply_remote(&env.engine(), &request)
            .with_context(|| format!("apply failed for '{}'", request.package))?;
        if self.json {
            return print_json(&report);
        }
        print_report(&report);
        Ok(())
    }
}

/// Resolve against this process's working directory; the daemon runs
/// elsewhere.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn print_report(report: &ApplyReport) {
    println!("{} {}", "applied".green().bold(), report.package);
    if let Some(config) = &report.config {
        println!("  {} config document  {}", step_marker(config), outcome_text(config));
    }
    if let Some(gadget) = &report.gadget_config {
        println!(
            "  {} {}  {}",
            step_marker(&gadget.copy),
            gadget.name,
            outcome_text(&gadget.copy)
        );
    }
    match &report.deployment {
        Some(reconciliation) => print_reconciliation(reconciliation),
        None => println!("  {}", "payloads not redeployed".bright_black()),
    }
    for removal in &report.staged_removed {
        if removal.outcome.is_failed() {
            println!(
                "  {} staged file {} left behind: {}",
                "warning:".yellow().bold(),
                removal.path.display(),
                outcome_text(&removal.outcome)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_flags() {
        let args = ApplyArgs {
            package: "com.example.target".into(),
            config: Some(PathBuf::from("/tmp/config.json")),
            gadget_config: None,
            deploy_only: true,
            local: false,
            json: false,
        };
        let request = args.request();
        assert_eq!(request.package, "com.example.target");
        assert_eq!(request.config_path, Some(PathBuf::from("/tmp/config.json")));
        assert!(request.deploy_only);
        assert!(!request.should_deploy());
    }

    #[test]
    fn relative_staged_paths_become_absolute() {
        let args = ApplyArgs {
            package: "com.example.target".into(),
            config: None,
            gadget_config: Some(PathBuf::from("staged/libgadget.config.so")),
            deploy_only: false,
            local: false,
            json: false,
        };
        let staged = args.request().gadget_config_path.unwrap();
        assert!(staged.is_absolute());
        assert!(staged.ends_with("staged/libgadget.config.so"));
    }
}
