//! The privileged command channel.
//!
//! All filesystem mutation inside module storage and application sandboxes
//! goes through [`CommandChannel::execute`]. [`RootShell`] is the production
//! implementation: one `su -c` (or `sh -c`) process per command, a bounded
//! wait, and at most one command in flight at a time.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::settings::{EngineSettings, PrivilegeMode};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub timed_out: bool,
}

impl CommandOutput {
    /// A command that never produced an exit status (spawn failure).
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            stderr: vec![reason.into()],
            ..Self::default()
        }
    }

    pub fn first_line(&self) -> Option<&str> {
        self.stdout.first().map(|line| line.trim())
    }

    /// A one-line description of why the command failed.
    pub fn reason(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = self.stderr.join("; ");
        match (self.exit_code, stderr.is_empty()) {
            (Some(code), true) => format!("exit status {code}"),
            (Some(code), false) => format!("exit status {code}: {stderr}"),
            (None, true) => "no exit status".to_string(),
            (None, false) => stderr,
        }
    }
}

/// Execute shell commands with elevated privileges.
pub trait CommandChannel: Send + Sync {
    /// Run `command` to completion (or timeout) and capture its output.
    fn execute(&self, command: &str) -> CommandOutput;

    /// Whether commands run as root. Mutating operations refuse to start
    /// without it.
    fn is_privileged(&self) -> bool;
}

#[derive(Debug, Clone)]
enum Launcher {
    Su(String),
    Direct,
}

/// `su`-backed channel. Construct once per process and share it.
#[derive(Debug)]
pub struct RootShell {
    launcher: Launcher,
    timeout: Duration,
    gate: Mutex<()>,
    privileged: OnceLock<bool>,
}

impl RootShell {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let shell = match settings.privilege {
            PrivilegeMode::Su => Self::su(settings.su_binary.clone(), settings.command_timeout()),
            PrivilegeMode::Direct => Self::direct(settings.command_timeout()),
        };
        if settings.assume_root {
            shell.assume_privileged()
        } else {
            shell
        }
    }

    pub fn su(binary: impl Into<String>, timeout: Duration) -> Self {
        Self::with_launcher(Launcher::Su(binary.into()), timeout)
    }

    pub fn direct(timeout: Duration) -> Self {
        Self::with_launcher(Launcher::Direct, timeout)
    }

    fn with_launcher(launcher: Launcher, timeout: Duration) -> Self {
        Self {
            launcher,
            timeout,
            gate: Mutex::new(()),
            privileged: OnceLock::new(),
        }
    }

    /// Skip the `id -u` probe and report the channel as privileged.
    ///
    /// For sandboxes where every target path is writable by the current user.
    pub fn assume_privileged(self) -> Self {
        let _ = self.privileged.set(true);
        self
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = match &self.launcher {
            Launcher::Su(binary) => Command::new(binary),
            Launcher::Direct => Command::new("sh"),
        };
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, command: &str) -> std::io::Result<CommandOutput> {
        let mut child = self.command(command).spawn()?;
        // Drain both pipes concurrently so a chatty command cannot block on a
        // full pipe while we wait on it.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        match child.wait_timeout(self.timeout)? {
            Some(status) => Ok(CommandOutput {
                success: status.success(),
                exit_code: status.code(),
                stdout: collect(stdout),
                stderr: collect(stderr),
                timed_out: false,
            }),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                // Readers are left detached: a grandchild may still hold the
                // pipes open.
                Ok(CommandOutput {
                    timed_out: true,
                    ..CommandOutput::default()
                })
            }
        }
    }
}

impl CommandChannel for RootShell {
    fn execute(&self, command: &str) -> CommandOutput {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("exec: {command}");
        match self.run(command) {
            Ok(output) => {
                if output.timed_out {
                    log::warn!("command timed out after {:?}: {}", self.timeout, command);
                } else if !output.success {
                    log::debug!("command failed ({}): {}", output.reason(), command);
                }
                output
            }
            Err(err) => {
                log::error!("failed to launch `{command}`: {err}");
                CommandOutput::failure(err.to_string())
            }
        }
    }

    fn is_privileged(&self) -> bool {
        *self.privileged.get_or_init(|| {
            let out = self.execute("id -u");
            let root = out.success && out.first_line() == Some("0");
            if !root {
                log::warn!("root shell unavailable ({})", out.reason());
            }
            root
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_string)
            .collect()
    })
}

fn collect(reader: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Command-building helpers
// ---------------------------------------------------------------------------

/// Single-quote `arg` for `sh`.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// `test -f <path>` through the channel.
pub fn file_exists(channel: &dyn CommandChannel, path: &Path) -> bool {
    let out = channel.execute(&format!("test -f {} && echo exists", quote_path(path)));
    out.success && out.stdout.iter().any(|line| line.trim() == "exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell() -> RootShell {
        RootShell::direct(Duration::from_secs(10))
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn direct_shell_captures_both_streams() {
        let out = shell().execute("echo one; echo two; echo oops 1>&2; exit 3");
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, vec!["one", "two"]);
        assert_eq!(out.stderr, vec!["oops"]);
        assert!(out.reason().contains("exit status 3"));
    }

    #[test]
    fn timeout_fails_only_that_command() {
        let shell = RootShell::direct(Duration::from_millis(200));
        let started = Instant::now();
        let out = shell.execute("sleep 5");
        assert!(out.timed_out);
        assert!(!out.success);
        assert!(started.elapsed() < Duration::from_secs(4));

        let next = shell.execute("echo still-usable");
        assert!(next.success);
        assert_eq!(next.first_line(), Some("still-usable"));
    }

    #[test]
    fn missing_launcher_reports_failure() {
        let shell = RootShell::su("/nonexistent/su-binary", Duration::from_secs(1));
        let out = shell.execute("true");
        assert!(!out.success);
        assert_eq!(out.exit_code, None);
        assert!(!shell.is_privileged());
    }

    #[test]
    fn assumed_privilege_skips_probe() {
        assert!(shell().assume_privileged().is_privileged());
    }

    #[test]
    fn file_exists_checks_regular_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("it's here.so");
        std::fs::write(&file, b"x").unwrap();
        let shell = shell();
        assert!(file_exists(&shell, &file));
        assert!(!file_exists(&shell, &tmp.path().join("absent.so")));
        assert!(!file_exists(&shell, tmp.path()));
    }
}
