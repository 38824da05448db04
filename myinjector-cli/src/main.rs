//! MyInjector: configure and deploy injection payloads on a rooted device.
//!
//! # Usage
//!
//! ```text
//! myinjector [--settings PATH] [--verbose] <command>
//! myinjector app list | show <pkg> | enable <pkg> | disable <pkg>
//!                | method <pkg> <method> | prune <keep>...
//! myinjector payload list [--app <pkg>] | add <path> [--delete-source] | remove <name>
//!                    | attach <pkg> <name> | detach <pkg> <name>
//! myinjector gadget show <pkg> | set <pkg> [...] | clear <pkg> | use-global <pkg> <bool>
//!                   | global-set [...] | global-clear | render <pkg> [--compact]
//! myinjector settings show | delay <0..60> | hide <bool> | hidden [add|remove <lib>]
//! myinjector deploy <pkg> | deploy --all
//! myinjector cleanup <pkg>
//! myinjector status [<pkg>] [--json]
//! myinjector diff <staged-config>
//! myinjector apply <pkg> [--config PATH] [--gadget-config PATH] [--deploy-only] [--local]
//! myinjector daemon start | stop | status | deploy [<pkg>] | logs [--lines N]
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    app::AppCommand, apply::ApplyArgs, daemon::DaemonCommand, deploy::CleanupArgs,
    deploy::DeployArgs, diff::DiffArgs, gadget::GadgetCommand, payload::PayloadCommand,
    settings::SettingsCommand, status::StatusArgs, Env,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "myinjector",
    version,
    about = "Configure and deploy injection payloads into application sandboxes",
    long_about = None,
)]
struct Cli {
    /// Engine settings YAML. Missing file means defaults.
    #[arg(long, global = true, env = "MYINJECTOR_SETTINGS", value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Log engine steps to stderr (`RUST_LOG` overrides the level).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Per-application injection settings.
    App {
        #[command(subcommand)]
        command: AppCommand,
    },

    /// The payload catalog and per-app selections.
    Payload {
        #[command(subcommand)]
        command: PayloadCommand,
    },

    /// Gadget configs, per app and global.
    Gadget {
        #[command(subcommand)]
        command: GadgetCommand,
    },

    /// Global document settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Copy selected payloads into application sandboxes.
    Deploy(DeployArgs),

    /// Remove deployed payloads from a sandbox.
    Cleanup(CleanupArgs),

    /// Compare sandboxes against the config document.
    Status(StatusArgs),

    /// Show a unified diff between the live config and a staged one.
    Diff(DiffArgs),

    /// Apply staged config files, through the daemon when it is running.
    Apply(ApplyArgs),

    /// Run and query the background service.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        init_logging();
    }
    let env = Env::load(cli.settings.as_deref())?;
    match cli.command {
        Commands::App { command } => commands::app::run(&env, command),
        Commands::Payload { command } => commands::payload::run(&env, command),
        Commands::Gadget { command } => commands::gadget::run(&env, command),
        Commands::Settings { command } => commands::settings::run(&env, command),
        Commands::Deploy(args) => args.run(&env),
        Commands::Cleanup(args) => args.run(&env),
        Commands::Status(args) => args.run(&env),
        Commands::Diff(args) => args.run(&env),
        Commands::Apply(args) => args.run(&env),
        Commands::Daemon { command } => commands::daemon::run(env, command),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
