//! Dry-run unified diff of a staged document against the live one.

use std::path::{Path, PathBuf};

use serde::Serialize;
use similar::TextDiff;

use myinjector_core::store::{parse_document, render_document};
use myinjector_core::types::ModuleConfig;

use crate::error::{io_err, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigDiff {
    pub staged_path: PathBuf,
    pub unified_diff: String,
    pub changed: bool,
}

/// Compare `current` with the document at `staged_path`.
///
/// Both sides go through the same lenient parse and pretty render, so the
/// diff shows what an apply would change rather than formatting noise.
/// Nothing is written.
pub fn diff_staged(current: &ModuleConfig, staged_path: &Path) -> Result<ConfigDiff, SyncError> {
    let text = std::fs::read_to_string(staged_path).map_err(|e| io_err(staged_path, e))?;
    let staged = parse_document(&text)?;

    let old = render_document(current)?;
    let new = render_document(&staged)?;
    let changed = old != new;

    let unified_diff = if changed {
        let name = staged_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "staged.json".to_string());
        let new_header = format!("b/{name}");
        TextDiff::from_lines(&old, &new)
            .unified_diff()
            .header("a/config.json", &new_header)
            .context_radius(3)
            .to_string()
    } else {
        String::new()
    };

    Ok(ConfigDiff {
        staged_path: staged_path.to_path_buf(),
        unified_diff,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identical_documents_have_no_diff() {
        let dir = TempDir::new().unwrap();
        let doc = ModuleConfig::default();
        let path = dir.path().join("staged.json");
        std::fs::write(&path, render_document(&doc).unwrap()).unwrap();

        let diff = diff_staged(&doc, &path).unwrap();
        assert!(!diff.changed);
        assert!(diff.unified_diff.is_empty());
    }

    #[test]
    fn changed_field_shows_in_hunk() {
        let dir = TempDir::new().unwrap();
        let current = ModuleConfig::default();
        let mut staged = current.clone();
        staged.injection_delay = 9;
        let path = dir.path().join("incoming.json");
        std::fs::write(&path, render_document(&staged).unwrap()).unwrap();

        let diff = diff_staged(&current, &path).unwrap();
        assert!(diff.changed);
        assert!(diff.unified_diff.contains("--- a/config.json"));
        assert!(diff.unified_diff.contains("+++ b/incoming.json"));
        assert!(diff.unified_diff.contains("+  \"injectionDelay\": 9"));
    }

    #[test]
    fn missing_staged_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let err = diff_staged(&ModuleConfig::default(), &dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
