//! `myinjector settings`: engine settings and document-wide switches.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use myinjector_sync::{HideList, ListFileModule};

use super::{parse_bool, print_mutation, Env};

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Print the effective engine settings and the document globals.
    Show,
    /// Seconds the native module waits before injecting (0..60).
    Delay { seconds: u32 },
    /// Hide the injection library from the target's module list.
    Hide {
        #[arg(value_parser = parse_bool)]
        enabled: bool,
    },
    /// Show or edit the libraries kept off the target's module list.
    Hidden {
        #[command(subcommand)]
        action: Option<HiddenAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum HiddenAction {
    /// Hide a library.
    Add { name: String },
    /// Stop hiding a library.
    Remove { name: String },
}

#[derive(Tabled)]
struct HiddenRow {
    #[tabled(rename = "library")]
    name: String,
    #[tabled(rename = "hidden")]
    hidden: String,
}

pub fn run(env: &Env, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Show => {
            match &env.settings_path {
                Some(path) => println!("{} {}", "settings:".bold(), path.display()),
                None => println!("{} built-in defaults", "settings:".bold()),
            }
            let yaml =
                serde_yaml::to_string(&env.settings).context("failed to render settings YAML")?;
            print!("{yaml}");

            let doc = env.engine().document();
            println!("{} {}", "document:".bold(), env.settings.config_file().display());
            println!("  schemaVersion:  {}", doc.schema_version);
            println!("  enabled:        {}", doc.enabled);
            println!("  hideInjection:  {}", doc.hide_injection);
            println!("  injectionDelay: {}s", doc.injection_delay);
            println!("  payloads:       {}", doc.global_payloads.len());
            println!("  apps:           {}", doc.apps.len());
            println!(
                "  global gadget:  {}",
                doc.global_gadget_config
                    .as_ref()
                    .map(|g| g.gadget_name.as_str())
                    .unwrap_or("-")
            );
        }
        SettingsCommand::Delay { seconds } => {
            let engine = env.engine();
            print_mutation(&engine.set_injection_delay(seconds));
            println!("injection delay: {}s", engine.document().injection_delay);
        }
        SettingsCommand::Hide { enabled } => {
            print_mutation(&env.engine().set_hide_injection(enabled));
            println!("hide injection: {enabled}");
        }
        SettingsCommand::Hidden { action } => {
            let engine = env.engine();
            let mut list = HideList::new(ListFileModule::open(&engine));
            match action {
                Some(HiddenAction::Add { name }) => {
                    list.hide(&name).with_context(|| format!("could not hide {name}"))?;
                    println!("{} {name}", "hidden".green());
                }
                Some(HiddenAction::Remove { name }) => {
                    list.unhide(&name)
                        .with_context(|| format!("could not unhide {name}"))?;
                    println!("{} {name}", "unhidden".yellow());
                }
                None => {
                    let state = if list.is_loaded() { "on" } else { "off" };
                    println!("{} {}", "hide injection:".bold(), state);
                    let rows: Vec<HiddenRow> = list
                        .entries()?
                        .into_iter()
                        .map(|e| HiddenRow {
                            hidden: match (e.hidden, e.fixed) {
                                (true, true) => "always".to_string(),
                                (true, false) => "yes".to_string(),
                                (false, _) => "no".to_string(),
                            },
                            name: e.name,
                        })
                        .collect();
                    let mut table = Table::new(rows);
                    table.with(Style::rounded());
                    println!("{table}");
                }
            }
        }
    }
    Ok(())
}
