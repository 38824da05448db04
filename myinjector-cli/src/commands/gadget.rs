//! `myinjector gadget`: per-app and global gadget configs.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use myinjector_core::types::is_plain_file_name;
use myinjector_core::{GadgetConfig, GadgetMode, OnLoad, PortConflict};
use myinjector_gadget::{config_file_name, parse_preview, render, render_pretty};

use super::{package, parse_bool, print_mutation, Env};

#[derive(Subcommand, Debug)]
pub enum GadgetCommand {
    /// Show the own, global and resolved gadget for a package.
    Show { package: String },
    /// Give a package its own gadget config.
    Set {
        package: String,
        #[command(flatten)]
        fields: GadgetFields,
    },
    /// Remove a package's own gadget config.
    Clear { package: String },
    /// Toggle whether a package follows the global gadget config.
    UseGlobal {
        package: String,
        #[arg(value_parser = parse_bool)]
        enabled: bool,
    },
    /// Set the global gadget config and redeploy its followers.
    GlobalSet {
        #[command(flatten)]
        fields: GadgetFields,
    },
    /// Remove the global gadget config.
    GlobalClear,
    /// Print the gadget config file that would be deployed for a package.
    Render {
        package: String,
        /// Single-line output, exactly as written to the sandbox.
        #[arg(long)]
        compact: bool,
    },
}

/// Field overrides applied on top of the current config.
#[derive(Args, Debug, Default)]
pub struct GadgetFields {
    /// Start from an edited gadget config file.
    #[arg(long, value_name = "FILE")]
    pub from_preview: Option<PathBuf>,
    #[arg(long)]
    pub mode: Option<GadgetMode>,
    #[arg(long)]
    pub address: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// fail or pick-next.
    #[arg(long)]
    pub on_port_conflict: Option<PortConflict>,
    /// wait or resume.
    #[arg(long)]
    pub on_load: Option<OnLoad>,
    #[arg(long)]
    pub script_path: Option<String>,
    /// Payload filename backing the gadget.
    #[arg(long = "name")]
    pub gadget_name: Option<String>,
}

impl GadgetFields {
    fn apply(self, base: GadgetConfig) -> Result<GadgetConfig> {
        let mut cfg = match &self.from_preview {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                parse_preview(&text, &base)
                    .with_context(|| format!("{} is not a gadget config", path.display()))?
            }
            None => base,
        };
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
        if let Some(address) = self.address {
            cfg.address = address;
        }
        if let Some(port) = self.port {
            if port == 0 {
                bail!("port must be between 1 and 65535");
            }
            cfg.port = port;
        }
        if let Some(policy) = self.on_port_conflict {
            cfg.on_port_conflict = policy;
        }
        if let Some(on_load) = self.on_load {
            cfg.on_load = on_load;
        }
        if let Some(script_path) = self.script_path {
            cfg.script_path = script_path;
        }
        if let Some(name) = self.gadget_name {
            if !is_plain_file_name(&name) {
                bail!("gadget name must be a single file name, got '{name}'");
            }
            cfg.gadget_name = name;
        }
        Ok(cfg)
    }
}

pub fn run(env: &Env, command: GadgetCommand) -> Result<()> {
    let engine = env.engine();
    match command {
        GadgetCommand::Show { package: raw } => {
            let pkg = package(&raw)?;
            let app = engine.app(&pkg);
            let global = engine.document().global_gadget_config;
            println!("{}", pkg.as_str().bold());
            println!("  own:        {}", describe(app.gadget_config.as_ref()));
            println!("  use global: {}", app.use_global_gadget);
            println!("  global:     {}", describe(global.as_ref()));
            match engine.resolved_gadget(&pkg) {
                Some(cfg) => {
                    println!("  deploys:    {}", config_file_name(&cfg.gadget_name));
                    println!("{}", render_pretty(&cfg)?);
                }
                None => println!("  deploys:    {}", "nothing".bright_black()),
            }
        }
        GadgetCommand::Set {
            package: raw,
            fields,
        } => {
            let pkg = package(&raw)?;
            let base = engine
                .app(&pkg)
                .gadget_config
                .or_else(|| engine.resolved_gadget(&pkg))
                .unwrap_or_default();
            let cfg = fields.apply(base)?;
            print_mutation(&engine.set_app_gadget(&pkg, Some(cfg))?);
        }
        GadgetCommand::Clear { package: raw } => {
            let pkg = package(&raw)?;
            print_mutation(&engine.set_app_gadget(&pkg, None)?);
        }
        GadgetCommand::UseGlobal {
            package: raw,
            enabled,
        } => {
            let pkg = package(&raw)?;
            print_mutation(&engine.set_use_global_gadget(&pkg, enabled)?);
        }
        GadgetCommand::GlobalSet { fields } => {
            let base = engine.document().global_gadget_config.unwrap_or_default();
            let cfg = fields.apply(base)?;
            print_mutation(&engine.set_global_gadget(Some(cfg)));
        }
        GadgetCommand::GlobalClear => {
            print_mutation(&engine.set_global_gadget(None));
        }
        GadgetCommand::Render {
            package: raw,
            compact,
        } => {
            let pkg = package(&raw)?;
            let Some(cfg) = engine.resolved_gadget(&pkg) else {
                bail!("no gadget config resolves for {pkg}");
            };
            let text = if compact { render(&cfg)? } else { render_pretty(&cfg)? };
            println!("{text}");
        }
    }
    Ok(())
}

fn describe(cfg: Option<&GadgetConfig>) -> String {
    match cfg {
        Some(cfg) => format!(
            "{} {} {}:{}",
            cfg.gadget_name,
            cfg.mode.as_str(),
            cfg.address,
            cfg.port
        ),
        None => "-".to_string(),
    }
}
