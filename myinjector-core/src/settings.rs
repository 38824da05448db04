//! Engine settings and the on-device filesystem layout.
//!
//! # Layout
//!
//! ```text
//! /data/adb/modules/zygisk-myinjector/   (module_dir)
//!   config.json                          (persisted document, mode 0644)
//!   so_files/<name>                      (payload storage, mode 0755)
//!   run/myinjector.sock                  (daemon socket)
//!   logs/daemon.log
//! /data/data/<package>/files/<name>      (deployment target)
//! ```
//!
//! Every field has a default; a settings file only overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::PackageName;

pub const DEFAULT_MODULE_DIR: &str = "/data/adb/modules/zygisk-myinjector";
pub const DEFAULT_DATA_ROOT: &str = "/data/data";
pub const DEFAULT_SELINUX_LABEL: &str = "u:object_r:app_data_file:s0";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const SHELL_UID: u32 = 2000;
pub const ROOT_UID: u32 = 0;

/// How privileged commands are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    /// Wrap every command in `<su_binary> -c`.
    #[default]
    Su,
    /// Run through `sh -c`; the process is already root.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub module_dir: PathBuf,
    /// Defaults to `<module_dir>/config.json`.
    pub config_file: Option<PathBuf>,
    /// Defaults to `<module_dir>/so_files`.
    pub payload_dir: Option<PathBuf>,
    pub data_root: PathBuf,
    /// Local scratch space for files handed to the privileged copy.
    pub staging_dir: PathBuf,
    pub command_timeout_secs: u64,
    pub su_binary: String,
    pub privilege: PrivilegeMode,
    /// Skip the `id -u` probe and treat the channel as root. For rigs where
    /// every target directory is writable by the current user.
    pub assume_root: bool,
    pub trusted_uids: Vec<u32>,
    pub selinux_label: String,
    /// Defaults to `<module_dir>/run`.
    pub run_dir: Option<PathBuf>,
    /// Defaults to `<module_dir>/logs`.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            module_dir: PathBuf::from(DEFAULT_MODULE_DIR),
            config_file: None,
            payload_dir: None,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            staging_dir: std::env::temp_dir().join("myinjector"),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            su_binary: "su".to_string(),
            privilege: PrivilegeMode::Su,
            assume_root: false,
            trusted_uids: vec![ROOT_UID, SHELL_UID],
            selinux_label: DEFAULT_SELINUX_LABEL.to_string(),
            run_dir: None,
            log_dir: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from a YAML file. A missing file yields the defaults.
    pub fn load_at(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            log::debug!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let settings: Self = serde_yaml::from_str(&contents).map_err(|e| CoreError::Settings {
            path: path.to_path_buf(),
            source: e,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings rooted at `root` instead of the device paths, with commands
    /// run directly. Used for local sandboxes and tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            module_dir: root.join("module"),
            data_root: root.join("data"),
            staging_dir: root.join("staging"),
            privilege: PrivilegeMode::Direct,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.command_timeout_secs == 0 {
            return Err(CoreError::InvalidSetting {
                field: "command_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.su_binary.trim().is_empty() {
            return Err(CoreError::InvalidSetting {
                field: "su_binary",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.module_dir.join("config.json"))
    }

    /// `<staging_dir>/config.lock`, shared by every process using these
    /// settings.
    pub fn document_lock_file(&self) -> PathBuf {
        self.staging_dir.join("config.lock")
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.payload_dir
            .clone()
            .unwrap_or_else(|| self.module_dir.join("so_files"))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.run_dir
            .clone()
            .unwrap_or_else(|| self.module_dir.join("run"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.module_dir.join("logs"))
    }

    /// `<payload_dir>/<name>`: pure, no I/O.
    pub fn stored_path_for(&self, name: &str) -> PathBuf {
        self.payload_dir().join(name)
    }

    /// `<data_root>/<package>`
    pub fn package_data_dir(&self, package: &PackageName) -> PathBuf {
        self.data_root.join(package.as_str())
    }

    /// `<data_root>/<package>/files`
    pub fn files_dir(&self, package: &PackageName) -> PathBuf {
        self.package_data_dir(package).join("files")
    }

    pub fn is_trusted_uid(&self, uid: u32) -> bool {
        self.trusted_uids.contains(&uid)
    }
}
