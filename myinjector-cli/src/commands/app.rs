//! `myinjector app`: per-application switches.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use myinjector_core::InjectionMethod;

use super::{package, print_mutation, Env};

#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// List every package with an entry in the config document.
    List,
    /// Show the full entry for one package.
    Show { package: String },
    /// Enable injection and deploy the selected payloads.
    Enable { package: String },
    /// Disable injection and remove deployed payloads.
    Disable { package: String },
    /// Set the injection method (standard, riru, custom_linker).
    Method {
        package: String,
        method: InjectionMethod,
    },
    /// Drop entries for every package not listed (e.g. uninstalled apps).
    Prune {
        /// Packages to keep.
        #[arg(required = true)]
        keep: Vec<String>,
    },
}

#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "package")]
    package: String,
    #[tabled(rename = "enabled")]
    enabled: String,
    #[tabled(rename = "method")]
    method: String,
    #[tabled(rename = "payloads")]
    payloads: usize,
    #[tabled(rename = "gadget")]
    gadget: String,
}

pub fn run(env: &Env, command: AppCommand) -> Result<()> {
    let engine = env.engine();
    match command {
        AppCommand::List => {
            let doc = engine.document();
            if doc.apps.is_empty() {
                println!("No applications configured.");
                return Ok(());
            }
            let rows: Vec<AppRow> = doc
                .apps
                .iter()
                .map(|(pkg, app)| AppRow {
                    package: pkg.to_string(),
                    enabled: if app.enabled { "yes" } else { "no" }.to_string(),
                    method: app.injection_method.to_string(),
                    payloads: app.payloads.len(),
                    gadget: match (&app.gadget_config, app.use_global_gadget) {
                        (Some(_), _) => "own".to_string(),
                        (None, true) if doc.global_gadget_config.is_some() => "global".to_string(),
                        _ => "-".to_string(),
                    },
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }
        AppCommand::Show { package: raw } => {
            let pkg = package(&raw)?;
            let app = engine.app(&pkg);
            let text = serde_json::to_string_pretty(&app).context("failed to render app entry")?;
            println!("{}", pkg.as_str().bold());
            println!("{text}");
            if let Some(gadget) = engine.resolved_gadget(&pkg) {
                println!("resolved gadget: {} ({})", gadget.gadget_name, gadget.mode.as_str());
            }
        }
        AppCommand::Enable { package: raw } => {
            let pkg = package(&raw)?;
            print_mutation(&engine.set_app_enabled(&pkg, true)?);
        }
        AppCommand::Disable { package: raw } => {
            let pkg = package(&raw)?;
            print_mutation(&engine.set_app_enabled(&pkg, false)?);
        }
        AppCommand::Method {
            package: raw,
            method,
        } => {
            let pkg = package(&raw)?;
            print_mutation(&engine.set_injection_method(&pkg, method)?);
            println!("{pkg}: injection method {method}");
        }
        AppCommand::Prune { keep } => {
            let keep = keep
                .iter()
                .map(|raw| package(raw))
                .collect::<Result<Vec<_>>>()?;
            let dropped = engine.prune_packages(&keep)?;
            if dropped.is_empty() {
                println!("nothing to prune");
            }
            for pkg in dropped {
                println!("{} {pkg}", "dropped".yellow());
            }
        }
    }
    Ok(())
}
