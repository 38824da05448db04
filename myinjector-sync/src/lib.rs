//! # myinjector-sync
//!
//! Payload catalog, per-application reconciliation and the [`Engine`] facade
//! that ties them to the configuration store.
//!
//! Call [`Engine::deploy_for_app`] to bring one sandbox in line with the
//! document, or [`Engine::deploy_all_enabled`] after boot. Remote callers go
//! through [`apply_remote`].

pub mod apply;
pub mod catalog;
pub mod diff;
pub mod drift;
pub mod engine;
pub mod error;
pub mod hide;
pub mod lock;
pub mod reconciler;
pub mod steps;

pub use apply::{apply_remote, authorize, ApplyReport, ApplyRequest};
pub use catalog::Persisted;
pub use diff::{diff_staged, ConfigDiff};
pub use drift::{DriftState, PackageStatus};
pub use engine::{Engine, MutationOutcome, Reconciliation};
pub use error::SyncError;
pub use hide::{HideEntry, HideList, HideModule, ListFileModule, SELF_LIBRARY};
pub use reconciler::{CleanupReport, DeploymentReport, FileReport, Reconciler};
pub use steps::StepOutcome;
