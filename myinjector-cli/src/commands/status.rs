//! `myinjector status`: compare sandboxes with the config document.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use myinjector_sync::{DriftState, PackageStatus};

use super::{package, print_json, Env};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Check a single package.
    pub package: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "package")]
    package: String,
    #[tabled(rename = "method")]
    method: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "gadget config")]
    gadget: String,
}

impl StatusArgs {
    pub fn run(self, env: &Env) -> Result<()> {
        let engine = env.engine();
        let statuses = match &self.package {
            Some(raw) => vec![engine.status(&package(raw)?)],
            None => engine.status_all(),
        };
        if self.json {
            return print_json(&statuses);
        }
        print_table(&statuses);
        Ok(())
    }
}

fn print_table(statuses: &[PackageStatus]) {
    let drifted = statuses
        .iter()
        .filter(|s| matches!(s.state, DriftState::Drifted { .. }))
        .count();
    println!(
        "MyInjector v{} | {} apps | {} drifted",
        env!("CARGO_PKG_VERSION"),
        statuses.len(),
        drifted
    );
    if statuses.is_empty() {
        println!("No applications configured.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    println!(
        "Indicators: {} CURRENT  {} DRIFTED  {} DISABLED  {} UNCONFIGURED",
        indicator(&DriftState::Current),
        indicator(&DriftState::Drifted { missing: Vec::new() }),
        indicator(&DriftState::Disabled {
            leftovers: Vec::new()
        }),
        indicator(&DriftState::Unconfigured),
    );
    println!("{separator}");

    let rows: Vec<StatusRow> = statuses
        .iter()
        .map(|s| StatusRow {
            package: s.package.to_string(),
            method: s.injection_method.to_string(),
            status: format!("{} {}", indicator(&s.state), s.state.label().to_uppercase()),
            detail: detail(&s.state),
            gadget: s.gadget_config.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if drifted > 0 {
        println!("Run 'myinjector deploy --all' to bring drifted apps up to date.");
    }
}

fn indicator(state: &DriftState) -> String {
    match state {
        DriftState::Current => "●".green().to_string(),
        DriftState::Drifted { .. } => "●".red().to_string(),
        DriftState::Disabled { leftovers } if !leftovers.is_empty() => "●".yellow().to_string(),
        DriftState::Disabled { .. } => "○".bright_black().to_string(),
        DriftState::Unconfigured => "○".bright_black().to_string(),
    }
}

fn detail(state: &DriftState) -> String {
    match state {
        DriftState::Drifted { missing } => format!("missing: {}", missing.join(", ")),
        DriftState::Disabled { leftovers } if !leftovers.is_empty() => {
            format!("left behind: {}", leftovers.join(", "))
        }
        DriftState::Unconfigured => "no entry in config".to_string(),
        _ => String::new(),
    }
}
