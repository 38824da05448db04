//! `myinjector daemon`: background service lifecycle.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde_json::Value;

use myinjector_daemon::paths::{socket_path, stderr_log_path, stdout_log_path};
use myinjector_daemon::{request_deploy, request_status, request_stop, start_blocking, DaemonError};

use super::Env;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (socket server + job processor).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Queue a deploy job: one package, or every enabled one.
    Deploy { package: Option<String> },
    /// Print recent daemon log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the stderr log file.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(env: Env, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Start => {
            start_blocking(env.settings).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&env.settings) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&env.settings) {
            Ok(mut status) => {
                annotate_times(&mut status);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(&env.settings).display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Deploy { package } => {
            let summary =
                request_deploy(&env.settings, package).context("daemon deploy request failed")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("failed to render job summary")?
            );
        }
        DaemonCommand::Logs(args) => {
            if args.stderr_only {
                print_tail(&stderr_log_path(&env.settings), args.lines)
                    .context("failed to read daemon stderr log")?;
            } else {
                print_tail(&stdout_log_path(&env.settings), args.lines)
                    .context("failed to read daemon stdout log")?;
                print_tail(&stderr_log_path(&env.settings), args.lines)
                    .context("failed to read daemon stderr log")?;
            }
        }
    }

    Ok(())
}

/// Add RFC 3339 renderings next to the unix timestamps.
fn annotate_times(status: &mut Value) {
    let Some(map) = status.as_object_mut() else {
        return;
    };
    for (key, label) in [("started_at_unix", "started_at"), ("last_job_at_unix", "last_job_at")] {
        let rendered = map
            .get(key)
            .and_then(Value::as_i64)
            .filter(|secs| *secs > 0)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|at| at.to_rfc3339());
        if let Some(rendered) = rendered {
            map.insert(label.to_string(), Value::String(rendered));
        }
    }
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    println!("==> {} <==", path.display());
    if lines == 0 {
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut tail = VecDeque::<String>::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    for line in tail {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_get_readable_twins() {
        let mut status = serde_json::json!({
            "started_at_unix": 1_700_000_000u64,
            "last_job_at_unix": 0u64,
        });
        annotate_times(&mut status);
        assert_eq!(status["started_at"], "2023-11-14T22:13:20+00:00");
        assert!(status.get("last_job_at").is_none());
    }
}
