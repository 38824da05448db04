//! `myinjector deploy` and `myinjector cleanup`.

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;

use myinjector_sync::Reconciliation;

use super::{package, print_cleanup, print_deployment, print_json, print_reconciliation, Env};

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Package to deploy.
    pub package: Option<String>,

    /// Deploy every enabled package.
    #[arg(long, conflicts_with = "package")]
    pub all: bool,

    /// Emit the reports as JSON.
    #[arg(long)]
    pub json: bool,
}

impl DeployArgs {
    pub fn run(self, env: &Env) -> Result<()> {
        let engine = env.engine();
        match (self.package, self.all) {
            (Some(raw), false) => {
                let report = engine.deploy_for_app(&package(&raw)?)?;
                if self.json {
                    return print_json(&report);
                }
                print_deployment(&report);
                let failed = report.failed().len();
                if failed > 0 {
                    bail!("{failed} of {} payloads failed", report.files.len());
                }
            }
            (None, true) => {
                let results = engine.deploy_all_enabled();
                if self.json {
                    return print_json(&results);
                }
                if results.is_empty() {
                    println!("No enabled applications.");
                }
                for result in &results {
                    print_reconciliation(result);
                }
                let incomplete = results
                    .iter()
                    .filter(|r| match r {
                        Reconciliation::Deployed(report) => !report.is_complete(),
                        _ => false,
                    })
                    .count();
                if incomplete > 0 {
                    println!("{} {incomplete} packages incomplete", "warning:".yellow().bold());
                }
            }
            _ => bail!("give a package or --all"),
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Package whose deployed payloads are removed.
    pub package: String,

    #[arg(long)]
    pub json: bool,
}

impl CleanupArgs {
    pub fn run(self, env: &Env) -> Result<()> {
        let report = env.engine().cleanup_app(&package(&self.package)?)?;
        if self.json {
            return print_json(&report);
        }
        print_cleanup(&report);
        Ok(())
    }
}
