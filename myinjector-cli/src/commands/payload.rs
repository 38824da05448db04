//! `myinjector payload`: the payload catalog and per-app selections.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use myinjector_core::PayloadFile;

use super::{outcome_text, package, print_mutation, step_marker, warn_unsaved, Env};

#[derive(Subcommand, Debug)]
pub enum PayloadCommand {
    /// List the catalog, or the selection of one package.
    List {
        /// Show the payloads selected for this package instead.
        #[arg(long)]
        app: Option<String>,
    },
    /// Import a library into the catalog.
    Add {
        path: PathBuf,
        /// Delete the source file after a successful import.
        #[arg(long)]
        delete_source: bool,
    },
    /// Delete a catalog entry and its stored copy.
    Remove { name: String },
    /// Select a catalog payload for a package.
    Attach { package: String, name: String },
    /// Deselect a payload from a package, by name or stored path.
    Detach { package: String, payload: String },
}

#[derive(Tabled)]
struct PayloadRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "stored path")]
    stored_path: String,
    #[tabled(rename = "imported from")]
    original_path: String,
}

impl From<&PayloadFile> for PayloadRow {
    fn from(file: &PayloadFile) -> Self {
        Self {
            name: file.name.clone(),
            stored_path: file.stored_path.to_string(),
            original_path: file.original_path.clone(),
        }
    }
}

pub fn run(env: &Env, command: PayloadCommand) -> Result<()> {
    let engine = env.engine();
    match command {
        PayloadCommand::List { app } => {
            let files = match app {
                Some(raw) => engine.app_payloads(&package(&raw)?),
                None => engine.payloads(),
            };
            if files.is_empty() {
                println!("No payloads.");
                return Ok(());
            }
            let mut table = Table::new(files.iter().map(PayloadRow::from));
            table.with(Style::rounded());
            println!("{table}");
        }
        PayloadCommand::Add {
            path,
            delete_source,
        } => {
            let imported = engine
                .add_global_payload(&path, delete_source)
                .with_context(|| format!("failed to import {}", path.display()))?;
            warn_unsaved(imported.persist_error.as_deref());
            println!(
                "{} {} -> {}",
                "imported".green().bold(),
                imported.value.name,
                imported.value.stored_path
            );
        }
        PayloadCommand::Remove { name } => {
            let removed = engine.remove_global_payload(&name)?;
            warn_unsaved(removed.persist_error.as_deref());
            println!(
                "{} {} removed from catalog (stored copy: {})",
                step_marker(&removed.value.delete),
                removed.value.file.name,
                outcome_text(&removed.value.delete)
            );
        }
        PayloadCommand::Attach { package: raw, name } => {
            let pkg = package(&raw)?;
            print_mutation(&engine.add_payload_to_app(&pkg, &name)?);
        }
        PayloadCommand::Detach {
            package: raw,
            payload,
        } => {
            let pkg = package(&raw)?;
            let selected = engine.app_payloads(&pkg);
            let key = match selected
                .iter()
                .find(|f| f.name == payload || f.stored_path.0 == payload)
            {
                Some(file) => file.stored_path.clone(),
                None => bail!("'{payload}' is not selected for {pkg}"),
            };
            print_mutation(&engine.remove_payload_from_app(&pkg, &key)?);
        }
    }
    Ok(())
}
