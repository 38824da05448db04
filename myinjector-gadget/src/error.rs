//! Error types for myinjector-gadget.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from rendering or deploying a gadget config.
#[derive(Debug, Error)]
pub enum GadgetError {
    /// JSON encoding of the gadget document failed.
    #[error("gadget config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A preview document that does not have the `interaction` shape.
    #[error("invalid gadget config document: {0}")]
    InvalidDocument(String),

    /// A gadget name that is not a single file name.
    #[error("unsafe gadget name {0:?}")]
    InvalidName(String),

    /// Local staging failed.
    #[error("gadget config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A privileged step of the deployment failed.
    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> GadgetError {
    GadgetError::Io {
        path: path.into(),
        source,
    }
}
