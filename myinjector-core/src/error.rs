//! Error types for myinjector-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from settings loading and input validation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings YAML failed to parse; carries the file path and serde_yaml context.
    #[error("failed to parse settings at {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A package identifier that cannot name an application sandbox.
    #[error("invalid package name '{name}': {reason}")]
    InvalidPackage { name: String, reason: &'static str },

    /// A settings value outside its accepted range.
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Local staging I/O failed before the privileged copy could run.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization of the document failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The privileged copy into the module directory failed. The in-memory
    /// document is kept; the next successful save reconciles it.
    #[error("failed to persist config to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    /// No root shell is available.
    #[error("privileged command channel unavailable")]
    NotPrivileged,

    /// A privileged command failed.
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn store_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
