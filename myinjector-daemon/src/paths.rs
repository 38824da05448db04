use std::path::PathBuf;

use myinjector_core::EngineSettings;

pub const DAEMON_SOCKET: &str = "myinjector.sock";
pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";

pub fn socket_path(settings: &EngineSettings) -> PathBuf {
    settings.run_dir().join(DAEMON_SOCKET)
}

pub fn stdout_log_path(settings: &EngineSettings) -> PathBuf {
    settings.log_dir().join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(settings: &EngineSettings) -> PathBuf {
    settings.log_dir().join(DAEMON_STDERR_LOG)
}
