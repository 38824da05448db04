//! Error types for myinjector-sync.

use std::path::PathBuf;

use thiserror::Error;

use myinjector_core::error::{CoreError, StoreError};
use myinjector_core::types::PackageName;
use myinjector_gadget::GadgetError;

/// All errors that can arise from catalog, reconciliation and apply
/// operations.
///
/// Only hard preconditions and refused requests are errors. Failures of
/// individual privileged steps are recorded as [`crate::StepOutcome`]s in
/// the returned reports instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the configuration store.
    #[error("config store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid input rejected by the core model.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An error from gadget rendering.
    #[error("gadget error: {0}")]
    Gadget(#[from] GadgetError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error while reading a staged document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No root shell; nothing was changed.
    #[error("privileged command channel unavailable")]
    NotPrivileged,

    /// The package identifier was empty.
    #[error("package name is empty")]
    EmptyPackage,

    /// The package has no selected payloads.
    #[error("no payloads selected for {package}")]
    NothingToDeploy { package: PackageName },

    /// A catalog entry with this name already exists.
    #[error("payload '{name}' is already in the catalog")]
    DuplicatePayload { name: String },

    /// No catalog entry matched.
    #[error("payload '{name}' not found in the catalog")]
    PayloadNotFound { name: String },

    /// The import source cannot be used.
    #[error("invalid payload source {path}: {reason}")]
    InvalidSource { path: PathBuf, reason: String },

    /// A privileged step failed and the operation cannot continue.
    #[error("{step} failed: {reason}")]
    Step { step: &'static str, reason: String },

    /// The hide module refused or failed a request.
    #[error("hide module: {0}")]
    Hide(String),

    /// The entry is permanently hidden.
    #[error("'{name}' is always hidden and cannot be removed from the hide list")]
    ProtectedHiddenItem { name: String },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
