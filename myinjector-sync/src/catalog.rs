//! Payload Catalog Manager.
//!
//! The catalog is the de-duplicated list of payload libraries stored flat in
//! `<module_dir>/so_files/`. Each file keeps its original base name, so a
//! second import under an existing name is refused rather than renamed.
//!
//! Catalog mutations never cascade into per-app selections: an app may keep
//! a reference to a removed payload, which deploy reports as a missing
//! source for that one file.
//!
//! Mutators return [`Persisted`]: a failed save does not undo the in-memory
//! change, it is reported next to the result.

use std::path::{Path, PathBuf};

use serde::Serialize;

use myinjector_core::channel::file_exists;
use myinjector_core::error::StoreError;
use myinjector_core::store::ConfigStore;
use myinjector_core::types::{AppConfig, GadgetConfig, PackageName, PayloadFile, StoredPath};

use crate::error::SyncError;
use crate::reconciler::is_plain_file_name;
use crate::steps::{self, StepOutcome};

/// A mutation result plus the outcome of persisting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Persisted<T> {
    pub value: T,
    pub persist_error: Option<String>,
}

impl<T> Persisted<T> {
    pub(crate) fn new(value: T, saved: Result<(), StoreError>) -> Self {
        let persist_error = saved.err().map(|e| {
            tracing::error!("config not persisted: {e}");
            e.to_string()
        });
        Self {
            value,
            persist_error,
        }
    }

    /// Nothing changed, nothing written.
    pub(crate) fn unchanged(value: T) -> Self {
        Self {
            value,
            persist_error: None,
        }
    }
}

/// Result of [`remove_global_payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedPayload {
    pub file: PayloadFile,
    pub delete: StepOutcome,
}

/// Copy `source` into payload storage and record it.
///
/// A source that already is the stored file is registered without copying
/// and is never deleted. Any failing step aborts before the catalog is
/// touched.
pub fn add_global_payload(
    store: &mut ConfigStore,
    source: &Path,
    delete_source: bool,
) -> Result<Persisted<PayloadFile>, SyncError> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| is_plain_file_name(n))
        .ok_or_else(|| SyncError::InvalidSource {
            path: source.to_path_buf(),
            reason: "no file name".into(),
        })?;

    if store.document().global_payload_named(&name).is_some() {
        tracing::warn!("payload with the same name already exists: {name}");
        return Err(SyncError::DuplicatePayload { name });
    }

    let channel = store.channel().clone();
    if !channel.is_privileged() {
        tracing::error!("no root access available");
        return Err(SyncError::NotPrivileged);
    }
    if !file_exists(channel.as_ref(), source) {
        return Err(SyncError::InvalidSource {
            path: source.to_path_buf(),
            reason: "not found".into(),
        });
    }
    store.ensure_module_directories()?;

    let su = store.settings().su_binary.clone();
    let stored = store.settings().stored_path_for(&name);
    let in_place = same_file(source, &stored);
    if in_place {
        tracing::info!("{} already sits in payload storage, registering it", source.display());
    } else {
        let copy = steps::copy_file(channel.as_ref(), source, &stored);
        if !copy.succeeded() {
            return Err(step_error("copy", &copy));
        }
    }
    let chmod = steps::chmod("755", &stored).run(channel.as_ref());
    if chmod.is_failed() {
        if !in_place {
            let _ = steps::delete_file(channel.as_ref(), &su, &stored);
        }
        return Err(step_error("chmod", &chmod));
    }

    let delete = delete_source && !in_place;
    if delete && !steps::delete_file(channel.as_ref(), &su, source).succeeded() {
        tracing::warn!("could not delete import source {}", source.display());
    }

    let file = PayloadFile {
        name,
        stored_path: StoredPath(stored.to_string_lossy().into_owned()),
        original_path: source.to_string_lossy().into_owned(),
    };
    let ((), saved) = store.update(|doc| doc.global_payloads.push(file.clone()));
    tracing::info!("added payload {} to catalog", file.name);
    Ok(Persisted::new(file, saved))
}

/// Whether both paths name one file. Paths this process cannot resolve are
/// compared as given.
fn same_file(a: &Path, b: &Path) -> bool {
    let resolve = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    resolve(a) == resolve(b)
}

/// Remove the catalog entry matching `key` and delete its backing file.
pub fn remove_global_payload(
    store: &mut ConfigStore,
    key: &StoredPath,
) -> Result<Persisted<RemovedPayload>, SyncError> {
    let file = store
        .document()
        .global_payloads
        .iter()
        .find(|p| p.key() == key)
        .cloned()
        .ok_or_else(|| SyncError::PayloadNotFound { name: key.0.clone() })?;

    let ((), saved) = store.update(|doc| doc.global_payloads.retain(|p| p.key() != key));

    let channel = store.channel().clone();
    let path = PathBuf::from(&file.stored_path.0);
    let delete = if file_exists(channel.as_ref(), &path) {
        steps::delete_file(channel.as_ref(), &store.settings().su_binary, &path)
    } else {
        StepOutcome::skipped("not present")
    };
    tracing::info!("removed payload {} from catalog", file.name);
    Ok(Persisted::new(RemovedPayload { file, delete }, saved))
}

/// Snapshot of the catalog.
pub fn all_payloads(store: &ConfigStore) -> Vec<PayloadFile> {
    store.document().global_payloads.clone()
}

/// Snapshot of one app's selection.
pub fn app_payloads(store: &ConfigStore, package: &PackageName) -> Vec<PayloadFile> {
    store.app(package).payloads
}

pub fn find_by_name(store: &ConfigStore, name: &str) -> Option<PayloadFile> {
    store.document().global_payload_named(name).cloned()
}

/// Select `file` for `package`. `value` is `false` if it was already
/// selected, in which case nothing is written.
pub fn add_payload_to_app(
    store: &mut ConfigStore,
    package: &PackageName,
    file: PayloadFile,
) -> Persisted<bool> {
    if store.app(package).has_payload(file.key()) {
        return Persisted::unchanged(false);
    }
    let (added, saved) = store.update(|doc| doc.app_entry(package).add_payload(file));
    Persisted::new(added, saved)
}

/// Deselect the entry with `key`; `value` is the removed entry, if any.
pub fn remove_payload_from_app(
    store: &mut ConfigStore,
    package: &PackageName,
    key: &StoredPath,
) -> Persisted<Option<PayloadFile>> {
    let Some(existing) = store.app(package).payloads.into_iter().find(|p| p.key() == key) else {
        return Persisted::unchanged(None);
    };
    let (_, saved) = store.update(|doc| doc.app_entry(package).remove_payload(key));
    Persisted::new(Some(existing), saved)
}

/// Swap the package's own gadget config.
///
/// Selected entries named after the previous gadget are dropped first; the
/// new gadget's library is then selected when it exists in payload storage.
/// Assigning a config opts the package out of the global gadget, clearing it
/// opts back in. `value` lists the dropped entries.
pub fn set_app_gadget(
    store: &mut ConfigStore,
    package: &PackageName,
    gadget: Option<GadgetConfig>,
) -> Persisted<Vec<PayloadFile>> {
    let old_name = store.app_gadget(package).map(|g| g.gadget_name);
    let gadget_file = gadget
        .as_ref()
        .and_then(|g| gadget_payload(store, &g.gadget_name));

    let (dropped, saved) = store.update(|doc| {
        let app = doc.app_entry(package);
        let dropped: Vec<PayloadFile> = match &old_name {
            Some(name) => {
                let dropped = app.payloads.iter().filter(|p| &p.name == name).cloned().collect();
                app.remove_payloads_named(name);
                dropped
            }
            None => Vec::new(),
        };
        app.use_global_gadget = gadget.is_none();
        app.gadget_config = gadget;
        if let Some(file) = gadget_file {
            select_unless_named(app, file);
        }
        dropped
    });
    Persisted::new(dropped, saved)
}

/// Select the gadget library for `package` without changing its config.
pub fn ensure_gadget_payload(
    store: &mut ConfigStore,
    package: &PackageName,
    gadget: &GadgetConfig,
) -> Persisted<bool> {
    let Some(file) = gadget_payload(store, &gadget.gadget_name) else {
        return Persisted::unchanged(false);
    };
    if store.app(package).payloads.iter().any(|p| p.name == file.name) {
        return Persisted::unchanged(false);
    }
    let ((), saved) = store.update(|doc| select_unless_named(doc.app_entry(package), file));
    Persisted::new(true, saved)
}

/// `so_files/<gadget name>` when present in storage.
fn gadget_payload(store: &ConfigStore, gadget_name: &str) -> Option<PayloadFile> {
    if !is_plain_file_name(gadget_name) {
        return None;
    }
    let path = store.settings().stored_path_for(gadget_name);
    if !file_exists(store.channel().as_ref(), &path) {
        tracing::warn!(
            "gadget library not found in storage: {}; import {} first",
            path.display(),
            gadget_name
        );
        return None;
    }
    let stored = path.to_string_lossy().into_owned();
    Some(PayloadFile {
        name: gadget_name.to_string(),
        stored_path: StoredPath(stored.clone()),
        original_path: stored,
    })
}

fn select_unless_named(app: &mut AppConfig, file: PayloadFile) {
    if app.payloads.iter().any(|p| p.name == file.name) {
        return;
    }
    tracing::info!("selected gadget library {}", file.name);
    app.payloads.push(file);
}

fn step_error(step: &'static str, outcome: &StepOutcome) -> SyncError {
    SyncError::Step {
        step,
        reason: outcome.reason().unwrap_or("unknown").to_string(),
    }
}
