//! Privileged steps as ordered fallback chains.
//!
//! A [`Chain`] is a list of alternative commands for one step. They are
//! tried in order until one succeeds (and, for verified chains, until the
//! post-condition holds). Every failed attempt is logged; the result is a
//! [`StepOutcome`] rather than an error so one failing step never aborts a
//! batch.
//!
//! | Step   | Primary                 | Fallback                          |
//! |--------|-------------------------|-----------------------------------|
//! | mkdir  | `mkdir -p <dir>`        | `<su> -c 'mkdir -p <dir>'`        |
//! | copy   | `cat <src> > <dst>`     | `cp -f <src> <dst>`               |
//! | chown  | `chown <uid>:<uid>`     | `chown <uid>.<uid>`               |
//! | label  | `chcon <label>`         | `chcon --reference=<pkg data dir>`|
//! | delete | `rm -f <path>`          | `<su> -c 'rm -f <path>'`          |

use std::path::Path;

use serde::Serialize;

use myinjector_core::channel::{file_exists, quote, quote_path, CommandChannel};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one privileged step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    /// The primary strategy failed but a fallback succeeded.
    Recovered { strategy: String, reason: String },
    Failed { reason: String },
    /// Not attempted.
    Skipped { reason: String },
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        StepOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        StepOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// `Ok` or `Recovered`.
    pub fn succeeded(&self) -> bool {
        matches!(self, StepOutcome::Ok | StepOutcome::Recovered { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }

    /// Short label for tables.
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Recovered { .. } => "recovered",
            StepOutcome::Failed { .. } => "failed",
            StepOutcome::Skipped { .. } => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            StepOutcome::Ok => None,
            StepOutcome::Recovered { reason, .. }
            | StepOutcome::Failed { reason }
            | StepOutcome::Skipped { reason } => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// One way of performing a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub name: &'static str,
    pub command: String,
}

/// Ordered alternatives for a single step.
#[derive(Debug, Clone)]
pub struct Chain {
    step: &'static str,
    strategies: Vec<Strategy>,
}

impl Chain {
    pub fn new(step: &'static str) -> Self {
        Self {
            step,
            strategies: Vec::new(),
        }
    }

    pub fn then(mut self, name: &'static str, command: impl Into<String>) -> Self {
        self.strategies.push(Strategy {
            name,
            command: command.into(),
        });
        self
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn run(&self, channel: &dyn CommandChannel) -> StepOutcome {
        self.run_verified(channel, |_| true)
    }

    /// Like [`Chain::run`], but a strategy only counts once `verify` holds
    /// after it.
    pub fn run_verified(
        &self,
        channel: &dyn CommandChannel,
        verify: impl Fn(&dyn CommandChannel) -> bool,
    ) -> StepOutcome {
        let mut failures: Vec<String> = Vec::new();
        for (i, strategy) in self.strategies.iter().enumerate() {
            let out = channel.execute(&strategy.command);
            let reason = if !out.success {
                out.reason()
            } else if !verify(channel) {
                "post-condition not met".to_string()
            } else if i == 0 {
                return StepOutcome::Ok;
            } else {
                tracing::info!("{}: recovered via {}", self.step, strategy.name);
                return StepOutcome::Recovered {
                    strategy: strategy.name.to_string(),
                    reason: failures.join("; "),
                };
            };
            tracing::warn!("{} via {} failed: {}", self.step, strategy.name, reason);
            failures.push(format!("{}: {}", strategy.name, reason));
        }
        if failures.is_empty() {
            return StepOutcome::skipped("no strategies");
        }
        tracing::error!("{} failed: {}", self.step, failures.join("; "));
        StepOutcome::Failed {
            reason: failures.join("; "),
        }
    }
}

// ---------------------------------------------------------------------------
// Chains used by the reconciler
// ---------------------------------------------------------------------------

/// `<su> -c '<command>'`
pub fn elevated(su: &str, command: &str) -> String {
    format!("{} -c {}", su, quote(command))
}

pub fn mkdir(su: &str, dir: &Path) -> Chain {
    let plain = format!("mkdir -p {}", quote_path(dir));
    Chain::new("mkdir")
        .then("mkdir", plain.clone())
        .then("elevated", elevated(su, &plain))
}

pub fn copy(src: &Path, dst: &Path) -> Chain {
    let (src, dst) = (quote_path(src), quote_path(dst));
    Chain::new("copy")
        .then("cat", format!("cat {src} > {dst}"))
        .then("cp", format!("cp -f {src} {dst}"))
}

pub fn chmod(mode: &str, path: &Path) -> Chain {
    Chain::new("chmod").then("chmod", format!("chmod {} {}", mode, quote_path(path)))
}

pub fn chown(uid: u32, path: &Path) -> Chain {
    let path = quote_path(path);
    Chain::new("chown")
        .then("colon", format!("chown {uid}:{uid} {path}"))
        .then("dot", format!("chown {uid}.{uid} {path}"))
}

pub fn label(label: &str, reference: &Path, path: &Path) -> Chain {
    let path = quote_path(path);
    Chain::new("label")
        .then("chcon", format!("chcon {} {}", quote(label), path))
        .then(
            "reference",
            format!("chcon --reference={} {}", quote_path(reference), path),
        )
}

pub fn delete(su: &str, path: &Path) -> Chain {
    let plain = format!("rm -f {}", quote_path(path));
    Chain::new("delete")
        .then("rm", plain.clone())
        .then("elevated", elevated(su, &plain))
}

/// Delete `path` and confirm it is gone.
pub fn delete_file(channel: &dyn CommandChannel, su: &str, path: &Path) -> StepOutcome {
    delete(su, path).run_verified(channel, |ch| !file_exists(ch, path))
}

/// Copy and confirm the destination exists.
pub fn copy_file(channel: &dyn CommandChannel, src: &Path, dst: &Path) -> StepOutcome {
    copy(src, dst).run_verified(channel, |ch| file_exists(ch, dst))
}
