//! Privileged background service: Unix socket entry point with peer-UID
//! gating, a sequential job processor in front of the engine, and log
//! rotation.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_apply, request_deploy, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, run_with_engine, start_blocking, JobSummary};
