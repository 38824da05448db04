//! Per-application reconciliation: make a sandbox match the document.
//!
//! ## Deploy order
//!
//! 1. Preconditions: valid package, non-empty selection, root shell.
//! 2. `mkdir -p <files dir>`, `chmod 755`.
//! 3. Resolve the package UID (`stat -c %u <data dir>`).
//! 4. Per payload: source check → copy (verified) → `chmod 755` → chown →
//!    SELinux label. A missing source or failed copy skips only that file.
//! 5. Gadget config, when one resolves for the package.
//!
//! Cleanup removes exactly the selected filenames plus the gadget config and
//! never touches the files directory itself.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use myinjector_core::channel::{file_exists, quote_path, CommandChannel};
use myinjector_core::settings::EngineSettings;
pub(crate) use myinjector_core::types::is_plain_file_name;
use myinjector_core::types::{AppConfig, GadgetConfig, PackageName, PayloadFile};

use crate::error::SyncError;
use crate::steps::{self, StepOutcome};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-file deployment outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub name: String,
    pub target: PathBuf,
    pub copy: StepOutcome,
    pub chmod: StepOutcome,
    pub chown: StepOutcome,
    pub label: StepOutcome,
}

impl FileReport {
    fn skipped(name: &str, target: PathBuf, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            target,
            copy: StepOutcome::failed(reason),
            chmod: StepOutcome::skipped(reason),
            chown: StepOutcome::skipped(reason),
            label: StepOutcome::skipped(reason),
        }
    }

    /// The file content landed in the sandbox.
    pub fn deployed(&self) -> bool {
        self.copy.succeeded()
    }

    /// Every step succeeded.
    pub fn complete(&self) -> bool {
        [&self.copy, &self.chmod, &self.chown, &self.label]
            .iter()
            .all(|s| s.succeeded())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentReport {
    pub package: PackageName,
    pub started_at: DateTime<Utc>,
    pub files_dir: PathBuf,
    pub directory: StepOutcome,
    pub uid: Option<u32>,
    pub files: Vec<FileReport>,
    pub gadget: Option<FileReport>,
}

impl DeploymentReport {
    pub fn deployed_names(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| f.deployed())
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&FileReport> {
        self.files.iter().filter(|f| !f.deployed()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.directory.succeeded()
            && self.files.iter().all(FileReport::complete)
            && self.gadget.as_ref().map_or(true, FileReport::complete)
    }
}

/// Per-file removal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub name: String,
    pub path: PathBuf,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub package: PackageName,
    pub started_at: DateTime<Utc>,
    pub files: Vec<RemovalReport>,
    pub gadget: Option<RemovalReport>,
}

impl CleanupReport {
    pub fn removed_names(&self) -> Vec<&str> {
        self.files
            .iter()
            .chain(self.gadget.iter())
            .filter(|r| r.outcome.succeeded())
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&RemovalReport> {
        self.files
            .iter()
            .chain(self.gadget.iter())
            .filter(|r| r.outcome.is_failed())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Drives the channel for one package at a time. Callers hold the package
/// lock.
pub struct Reconciler<'a> {
    channel: &'a dyn CommandChannel,
    settings: &'a EngineSettings,
}

impl<'a> Reconciler<'a> {
    pub fn new(channel: &'a dyn CommandChannel, settings: &'a EngineSettings) -> Self {
        Self { channel, settings }
    }

    pub fn deploy(
        &self,
        package: &PackageName,
        app: &AppConfig,
        gadget: Option<&GadgetConfig>,
    ) -> Result<DeploymentReport, SyncError> {
        check_package(package)?;
        if app.payloads.is_empty() {
            tracing::warn!("no payloads to deploy for {package}");
            return Err(SyncError::NothingToDeploy {
                package: package.clone(),
            });
        }
        self.require_privileged()?;

        let started_at = Utc::now();
        let files_dir = self.settings.files_dir(package);
        let data_dir = self.settings.package_data_dir(package);

        let mut directory = steps::mkdir(&self.settings.su_binary, &files_dir).run(self.channel);
        if directory.succeeded() {
            let mode = steps::chmod("755", &files_dir).run(self.channel);
            if mode.is_failed() {
                directory = mode;
            }
        }

        let uid = self.resolve_uid(package);
        if uid.is_none() {
            tracing::warn!("could not resolve uid for {package}; ownership steps will be skipped");
        }

        let files: Vec<FileReport> = app
            .payloads
            .iter()
            .map(|p| self.deploy_file(p, &files_dir, &data_dir, uid))
            .collect();

        let gadget = gadget.map(|cfg| self.deploy_gadget(package, cfg, &data_dir, uid));

        let report = DeploymentReport {
            package: package.clone(),
            started_at,
            files_dir,
            directory,
            uid,
            files,
            gadget,
        };
        tracing::info!(
            "deployed {}/{} payload(s) for {}",
            report.deployed_names().len(),
            report.files.len(),
            package
        );
        Ok(report)
    }

    fn deploy_file(
        &self,
        payload: &PayloadFile,
        files_dir: &Path,
        data_dir: &Path,
        uid: Option<u32>,
    ) -> FileReport {
        let target = files_dir.join(&payload.name);
        if !is_plain_file_name(&payload.name) {
            tracing::error!("refusing payload with unsafe name '{}'", payload.name);
            return FileReport::skipped(&payload.name, target, "unsafe file name");
        }
        let source = PathBuf::from(&payload.stored_path.0);
        if !file_exists(self.channel, &source) {
            tracing::error!("payload source not found, skipping: {}", source.display());
            return FileReport::skipped(&payload.name, target, "source not found");
        }

        let copy = steps::copy_file(self.channel, &source, &target);
        if !copy.succeeded() {
            let mut report = FileReport::skipped(&payload.name, target, "copy failed");
            report.copy = copy;
            return report;
        }
        let chmod = steps::chmod("755", &target).run(self.channel);
        let (chown, label) = self.own(&target, data_dir, uid);
        tracing::info!("deployed {} to {}", payload.name, target.display());
        FileReport {
            name: payload.name.clone(),
            target,
            copy,
            chmod,
            chown,
            label,
        }
    }

    fn deploy_gadget(
        &self,
        package: &PackageName,
        cfg: &GadgetConfig,
        data_dir: &Path,
        uid: Option<u32>,
    ) -> FileReport {
        let name = myinjector_gadget::config_file_name(&cfg.gadget_name);
        let target = myinjector_gadget::target_path(self.settings, package, cfg);
        match myinjector_gadget::materialize(self.channel, self.settings, package, cfg) {
            Ok(path) => {
                let (chown, label) = self.own(&path, data_dir, uid);
                FileReport {
                    name,
                    target: path,
                    copy: StepOutcome::Ok,
                    chmod: StepOutcome::Ok,
                    chown,
                    label,
                }
            }
            Err(e) => {
                let mut report = FileReport::skipped(&name, target, "gadget config not deployed");
                report.copy = StepOutcome::failed(e.to_string());
                report
            }
        }
    }

    /// chown to the package UID, then label like the sandbox's own files.
    pub(crate) fn own(
        &self,
        path: &Path,
        data_dir: &Path,
        uid: Option<u32>,
    ) -> (StepOutcome, StepOutcome) {
        let chown = match uid {
            Some(uid) => steps::chown(uid, path).run(self.channel),
            None => StepOutcome::skipped("uid unresolved"),
        };
        let label = match uid {
            Some(_) => steps::label(&self.settings.selinux_label, data_dir, path).run(self.channel),
            None => StepOutcome::skipped("uid unresolved"),
        };
        (chown, label)
    }

    pub fn cleanup(
        &self,
        package: &PackageName,
        app: &AppConfig,
        gadget: Option<&GadgetConfig>,
    ) -> Result<CleanupReport, SyncError> {
        check_package(package)?;
        if app.payloads.is_empty() {
            tracing::warn!("no payloads to clean up for {package}");
        }
        self.require_privileged()?;

        let started_at = Utc::now();
        let files_dir = self.settings.files_dir(package);
        let files = app
            .payloads
            .iter()
            .map(|p| {
                if is_plain_file_name(&p.name) {
                    self.remove(&p.name, files_dir.join(&p.name))
                } else {
                    RemovalReport {
                        name: p.name.clone(),
                        path: files_dir.join(&p.name),
                        outcome: StepOutcome::skipped("unsafe file name"),
                    }
                }
            })
            .collect();
        let gadget = gadget.map(|cfg| {
            let name = myinjector_gadget::config_file_name(&cfg.gadget_name);
            let path = myinjector_gadget::target_path(self.settings, package, cfg);
            if is_plain_file_name(&cfg.gadget_name) {
                self.remove(&name, path)
            } else {
                RemovalReport {
                    name,
                    path,
                    outcome: StepOutcome::skipped("unsafe gadget name"),
                }
            }
        });

        let report = CleanupReport {
            package: package.clone(),
            started_at,
            files,
            gadget,
        };
        tracing::info!(
            "cleaned up {} file(s) for {}",
            report.removed_names().len(),
            package
        );
        Ok(report)
    }

    /// Delete one deployed file if present.
    pub fn remove(&self, name: &str, path: PathBuf) -> RemovalReport {
        let outcome = if file_exists(self.channel, &path) {
            let outcome = steps::delete_file(self.channel, &self.settings.su_binary, &path);
            if outcome.succeeded() {
                tracing::info!("removed {}", path.display());
            }
            outcome
        } else {
            StepOutcome::skipped("not present")
        };
        RemovalReport {
            name: name.to_string(),
            path,
            outcome,
        }
    }

    /// Owner UID of the package's data directory.
    pub fn resolve_uid(&self, package: &PackageName) -> Option<u32> {
        let dir = self.settings.package_data_dir(package);
        let out = self
            .channel
            .execute(&format!("stat -c %u {}", quote_path(&dir)));
        if !out.success {
            tracing::warn!("stat {} failed: {}", dir.display(), out.reason());
            return None;
        }
        let parsed = out.first_line().and_then(|line| line.parse::<u32>().ok());
        if parsed.is_none() {
            tracing::warn!("unexpected stat output for {}: {:?}", dir.display(), out.stdout);
        }
        parsed
    }

    pub(crate) fn require_privileged(&self) -> Result<(), SyncError> {
        if self.channel.is_privileged() {
            Ok(())
        } else {
            tracing::error!("no root access available");
            Err(SyncError::NotPrivileged)
        }
    }
}

pub(crate) fn check_package(package: &PackageName) -> Result<(), SyncError> {
    if package.as_str().trim().is_empty() {
        return Err(SyncError::EmptyPackage);
    }
    package.validate()?;
    Ok(())
}
