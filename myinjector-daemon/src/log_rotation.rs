//! Size-based rotation of the daemon's redirected output.
//!
//! The service script points the daemon's stdout and stderr at
//! `<log dir>/daemon.log` and `<log dir>/daemon-err.log`. Each is rotated
//! past 10 MiB, keeping five copies:
//!   daemon.log → daemon.log.1 → … → daemon.log.5

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use myinjector_core::EngineSettings;

use crate::paths::{stderr_log_path, stdout_log_path};

pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` once it reaches `max_bytes`. Returns `true` if it did.
///
/// The live file is truncated in place after its content is copied to
/// `.1`, so a process holding it open with `O_APPEND` keeps writing to the
/// fresh file. A missing log is not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }

    fs::copy(log_path, numbered_path(log_path, 1))?;
    fs::OpenOptions::new().write(true).open(log_path)?.set_len(0)?;
    Ok(true)
}

/// Rotate both daemon logs. Failures are logged and never stop the daemon.
pub fn rotate_logs(settings: &EngineSettings) {
    for log_path in [stdout_log_path(settings), stderr_log_path(settings)] {
        match rotate_if_needed(&log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon.log");
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL_LIMIT: u64 = 1024;

    fn write_log(path: &Path, bytes: usize, fill: u8) {
        fs::write(path, vec![fill; bytes]).unwrap();
    }

    #[test]
    fn small_file_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write_log(&log, 10, b'x');
        assert!(!rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_file_moves_to_first_copy() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write_log(&log, SMALL_LIMIT as usize + 1, b'x');

        assert!(rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(numbered_path(&log, 1)).unwrap().len(),
            SMALL_LIMIT + 1
        );
    }

    #[test]
    fn copies_are_capped_and_shifted() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        for n in 1..=MAX_ROTATED_FILES {
            fs::write(numbered_path(&log, n), format!("rotated-{n}")).unwrap();
        }
        write_log(&log, SMALL_LIMIT as usize, b'y');

        assert!(rotate_if_needed(&log, SMALL_LIMIT, MAX_ROTATED_FILES).unwrap());
        assert_eq!(
            fs::read_to_string(numbered_path(&log, MAX_ROTATED_FILES)).unwrap(),
            format!("rotated-{}", MAX_ROTATED_FILES - 1)
        );
        assert_eq!(fs::read_to_string(numbered_path(&log, 2)).unwrap(), "rotated-1");
        assert!(!numbered_path(&log, MAX_ROTATED_FILES + 1).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(!rotate_if_needed(&dir.path().join("none.log"), SMALL_LIMIT, 5).unwrap());
    }

    #[test]
    fn rotate_logs_uses_settings_log_dir() {
        let dir = TempDir::new().unwrap();
        let settings = EngineSettings::rooted_at(dir.path());
        fs::create_dir_all(settings.log_dir()).unwrap();
        rotate_logs(&settings);
        assert!(!stdout_log_path(&settings).exists());
    }
}
