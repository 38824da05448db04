//! The engine facade shared by the CLI and the daemon.
//!
//! [`Engine`] owns the configuration store, the command channel and the
//! per-package locks, and wires the state machine together:
//!
//! ```text
//! UNCONFIGURED ─┐
//!               ├─ set_app_enabled(true)  → deploy
//! DISABLED ⇄ ENABLED
//!               └─ set_app_enabled(false) → cleanup
//! selection / gadget change while ENABLED → redeploy
//! ```
//!
//! Lock order is always package lock, then store lock, then the
//! cross-process document lock. The store lock is released before any
//! sandbox work starts.
//!
//! Another process may rewrite `config.json` at any time, so every entry
//! point reads through `current`, which re-reads the file first.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use myinjector_core::channel::{CommandChannel, RootShell};
use myinjector_core::error::StoreError;
use myinjector_core::settings::EngineSettings;
use myinjector_core::store::ConfigStore;
use myinjector_core::types::{
    AppConfig, GadgetConfig, InjectionMethod, ModuleConfig, PackageName, PayloadFile, StoredPath,
};

use crate::catalog::{self, Persisted, RemovedPayload};
use crate::drift::{self, PackageStatus};
use crate::error::SyncError;
use crate::lock::PackageLocks;
use crate::reconciler::{
    check_package, is_plain_file_name, CleanupReport, DeploymentReport, Reconciler, RemovalReport,
};
use crate::steps::StepOutcome;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one sandbox as a side effect of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reconciliation {
    Deployed(DeploymentReport),
    Cleaned(CleanupReport),
    Skipped { package: PackageName, reason: String },
}

impl Reconciliation {
    pub fn package(&self) -> &PackageName {
        match self {
            Reconciliation::Deployed(r) => &r.package,
            Reconciliation::Cleaned(r) => &r.package,
            Reconciliation::Skipped { package, .. } => package,
        }
    }

    fn from_deploy(package: &PackageName, result: Result<DeploymentReport, SyncError>) -> Self {
        match result {
            Ok(report) => Reconciliation::Deployed(report),
            Err(e) => skipped(package, e),
        }
    }

    fn from_cleanup(package: &PackageName, result: Result<CleanupReport, SyncError>) -> Self {
        match result {
            Ok(report) => Reconciliation::Cleaned(report),
            Err(e) => skipped(package, e),
        }
    }
}

fn skipped(package: &PackageName, e: SyncError) -> Reconciliation {
    tracing::warn!("reconciliation of {package} skipped: {e}");
    Reconciliation::Skipped {
        package: package.clone(),
        reason: e.to_string(),
    }
}

/// Result of a document mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// `false` when the call was a no-op.
    pub changed: bool,
    /// Set when the document could not be written; the in-memory change is
    /// kept.
    pub persist_error: Option<String>,
    pub reconciliations: Vec<Reconciliation>,
}

impl MutationOutcome {
    fn saved(saved: Result<(), StoreError>) -> Self {
        Self::from_persisted(&Persisted::new((), saved))
    }

    fn from_persisted<T>(p: &Persisted<T>) -> Self {
        Self {
            changed: true,
            persist_error: p.persist_error.clone(),
            reconciliations: Vec::new(),
        }
    }

    fn unchanged() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    settings: EngineSettings,
    channel: Arc<dyn CommandChannel>,
    store: Mutex<ConfigStore>,
    locks: PackageLocks,
}

impl Engine {
    /// Load-or-default the document and take ownership of `channel`.
    pub fn open(settings: EngineSettings, channel: Arc<dyn CommandChannel>) -> Self {
        let store = ConfigStore::open(settings.clone(), channel.clone());
        Self {
            settings,
            channel,
            store: Mutex::new(store),
            locks: PackageLocks::new(),
        }
    }

    /// Open with a [`RootShell`] built from `settings`.
    pub fn from_settings(settings: EngineSettings) -> Self {
        let channel: Arc<dyn CommandChannel> = Arc::new(RootShell::from_settings(&settings));
        Self::open(settings, channel)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn channel(&self) -> &dyn CommandChannel {
        self.channel.as_ref()
    }

    pub fn locks(&self) -> &PackageLocks {
        &self.locks
    }

    pub(crate) fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self.channel.as_ref(), &self.settings)
    }

    fn store(&self) -> MutexGuard<'_, ConfigStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The store, refreshed from disk.
    fn current(&self) -> MutexGuard<'_, ConfigStore> {
        let mut store = self.store();
        store.refresh();
        store
    }

    /// Snapshot of the current document.
    pub fn document(&self) -> ModuleConfig {
        self.current().document().clone()
    }

    pub fn app(&self, package: &PackageName) -> AppConfig {
        self.current().app(package)
    }

    pub fn resolved_gadget(&self, package: &PackageName) -> Option<GadgetConfig> {
        self.current().resolved_gadget(package)
    }

    /// Pick up edits other processes saved. Unsaved changes are kept.
    pub fn refresh(&self) {
        self.store().refresh();
    }

    /// Run `install` with the document lock held, then reload when it
    /// succeeded. For writers that replace `config.json` wholesale.
    pub fn replace_config(&self, install: impl FnOnce() -> StepOutcome) -> StepOutcome {
        let mut store = self.store();
        let _lock = store.lock_document();
        let outcome = install();
        if outcome.succeeded() {
            store.reload();
        }
        outcome
    }

    pub fn ensure_module_directories(&self) -> Result<(), SyncError> {
        Ok(self.store().ensure_module_directories()?)
    }

    fn snapshot(&self, package: &PackageName) -> (AppConfig, Option<GadgetConfig>) {
        let store = self.current();
        (store.app(package), store.resolved_gadget(package))
    }

    // -----------------------------------------------------------------------
    // 1. Reconciliation
    // -----------------------------------------------------------------------

    pub fn deploy_for_app(&self, package: &PackageName) -> Result<DeploymentReport, SyncError> {
        check_package(package)?;
        self.locks.with(package, || {
            let (app, gadget) = self.snapshot(package);
            self.reconciler().deploy(package, &app, gadget.as_ref())
        })
    }

    pub fn cleanup_app(&self, package: &PackageName) -> Result<CleanupReport, SyncError> {
        check_package(package)?;
        self.locks.with(package, || {
            let (app, gadget) = self.snapshot(package);
            self.reconciler().cleanup(package, &app, gadget.as_ref())
        })
    }

    /// Deploy every enabled package. One entry per package; a failure never
    /// stops the loop.
    pub fn deploy_all_enabled(&self) -> Vec<Reconciliation> {
        let packages = self.current().enabled_packages();
        packages
            .iter()
            .map(|pkg| Reconciliation::from_deploy(pkg, self.deploy_for_app(pkg)))
            .collect()
    }

    /// Called with the package lock held.
    fn redeploy_if_enabled(&self, package: &PackageName) -> Option<Reconciliation> {
        let (app, gadget) = self.snapshot(package);
        if !app.enabled {
            return None;
        }
        Some(Reconciliation::from_deploy(
            package,
            self.reconciler().deploy(package, &app, gadget.as_ref()),
        ))
    }

    /// Remove deployed files that are no longer part of the package's
    /// desired state. Called with the package lock held.
    fn remove_stale(
        &self,
        package: &PackageName,
        dropped: &[PayloadFile],
        old_gadget: Option<&GadgetConfig>,
    ) -> Option<Reconciliation> {
        let (app, new_gadget) = self.snapshot(package);
        if !app.enabled {
            return None;
        }
        if let Err(e) = self.reconciler().require_privileged() {
            return Some(skipped(package, e));
        }
        let files_dir = self.settings.files_dir(package);
        let reconciler = self.reconciler();

        let files: Vec<RemovalReport> = dropped
            .iter()
            .filter(|p| is_plain_file_name(&p.name))
            .filter(|p| !app.payloads.iter().any(|kept| kept.name == p.name))
            .map(|p| reconciler.remove(&p.name, files_dir.join(&p.name)))
            .collect();

        let old_config = old_gadget
            .filter(|g| is_plain_file_name(&g.gadget_name))
            .map(|g| myinjector_gadget::config_file_name(&g.gadget_name));
        let new_config = new_gadget.map(|g| myinjector_gadget::config_file_name(&g.gadget_name));
        let gadget = match old_config {
            Some(name) if Some(&name) != new_config.as_ref() => {
                let path = files_dir.join(&name);
                Some(reconciler.remove(&name, path))
            }
            _ => None,
        };

        if files.is_empty() && gadget.is_none() {
            return None;
        }
        Some(Reconciliation::Cleaned(CleanupReport {
            package: package.clone(),
            started_at: chrono::Utc::now(),
            files,
            gadget,
        }))
    }

    // -----------------------------------------------------------------------
    // 2. Per-app settings
    // -----------------------------------------------------------------------

    /// Enabling deploys, disabling cleans up.
    pub fn set_app_enabled(
        &self,
        package: &PackageName,
        enabled: bool,
    ) -> Result<MutationOutcome, SyncError> {
        check_package(package)?;
        self.locks.with(package, || {
            let saved = self.store().set_app_enabled(package, enabled);
            let mut outcome = MutationOutcome::saved(saved);
            let (app, gadget) = self.snapshot(package);
            let reconciler = self.reconciler();
            outcome.reconciliations.push(if enabled {
                Reconciliation::from_deploy(package, reconciler.deploy(package, &app, gadget.as_ref()))
            } else {
                Reconciliation::from_cleanup(package, reconciler.cleanup(package, &app, gadget.as_ref()))
            });
            Ok(outcome)
        })
    }

    /// Read by the native module at process start; no redeploy.
    pub fn set_injection_method(
        &self,
        package: &PackageName,
        method: InjectionMethod,
    ) -> Result<MutationOutcome, SyncError> {
        check_package(package)?;
        let saved = self.store().set_injection_method(package, method);
        Ok(MutationOutcome::saved(saved))
    }

    pub fn add_payload_to_app(
        &self,
        package: &PackageName,
        name: &str,
    ) -> Result<MutationOutcome, SyncError> {
        check_package(package)?;
        let file = catalog::find_by_name(&self.current(), name).ok_or_else(|| {
            SyncError::PayloadNotFound {
                name: name.to_string(),
            }
        })?;
        self.locks.with(package, || {
            let added = catalog::add_payload_to_app(&mut self.current(), package, file);
            if !added.value {
                return Ok(MutationOutcome::unchanged());
            }
            let mut outcome = MutationOutcome::from_persisted(&added);
            outcome.reconciliations.extend(self.redeploy_if_enabled(package));
            Ok(outcome)
        })
    }

    /// Deselect a payload. While enabled, its deployed copy is removed and
    /// the package redeployed.
    pub fn remove_payload_from_app(
        &self,
        package: &PackageName,
        key: &StoredPath,
    ) -> Result<MutationOutcome, SyncError> {
        check_package(package)?;
        self.locks.with(package, || {
            let removed = catalog::remove_payload_from_app(&mut self.current(), package, key);
            let Some(file) = removed.value.clone() else {
                return Ok(MutationOutcome::unchanged());
            };
            let mut outcome = MutationOutcome::from_persisted(&removed);
            outcome
                .reconciliations
                .extend(self.remove_stale(package, &[file], None));
            outcome.reconciliations.extend(self.redeploy_if_enabled(package));
            Ok(outcome)
        })
    }

    /// Assign (or clear) the package's own gadget config.
    pub fn set_app_gadget(
        &self,
        package: &PackageName,
        gadget: Option<GadgetConfig>,
    ) -> Result<MutationOutcome, SyncError> {
        check_package(package)?;
        self.locks.with(package, || {
            let old = self.current().resolved_gadget(package);
            let swapped = catalog::set_app_gadget(&mut self.store(), package, gadget);
            let mut outcome = MutationOutcome::from_persisted(&swapped);
            outcome
                .reconciliations
                .extend(self.remove_stale(package, &swapped.value, old.as_ref()));
            outcome.reconciliations.extend(self.redeploy_if_enabled(package));
            Ok(outcome)
        })
    }

    pub fn set_use_global_gadget(
        &self,
        package: &PackageName,
        use_global: bool,
    ) -> Result<MutationOutcome, SyncError> {
        check_package(package)?;
        self.locks.with(package, || {
            let mut store = self.current();
            let old = store.resolved_gadget(package);
            let saved = store.set_use_global_gadget(package, use_global);
            let mut outcome = MutationOutcome::saved(saved);
            if use_global {
                if let Some(global) = store.global_gadget() {
                    let ensured = catalog::ensure_gadget_payload(&mut store, package, &global);
                    if ensured.persist_error.is_some() {
                        outcome.persist_error = ensured.persist_error;
                    }
                }
            }
            drop(store);
            outcome
                .reconciliations
                .extend(self.remove_stale(package, &[], old.as_ref()));
            outcome.reconciliations.extend(self.redeploy_if_enabled(package));
            Ok(outcome)
        })
    }

    // -----------------------------------------------------------------------
    // 3. Global settings
    // -----------------------------------------------------------------------

    /// Replace the global gadget; enabled packages that use it are
    /// redeployed.
    pub fn set_global_gadget(&self, gadget: Option<GadgetConfig>) -> MutationOutcome {
        let (affected, saved) = {
            let mut store = self.current();
            let affected: Vec<(PackageName, Option<GadgetConfig>)> = store
                .document()
                .apps
                .iter()
                .filter(|(_, app)| app.enabled && app.use_global_gadget)
                .map(|(pkg, _)| (pkg.clone(), store.resolved_gadget(pkg)))
                .collect();
            (affected, store.set_global_gadget(gadget))
        };
        let mut outcome = MutationOutcome::saved(saved);
        for (pkg, old) in affected {
            self.locks.with(&pkg, || {
                outcome
                    .reconciliations
                    .extend(self.remove_stale(&pkg, &[], old.as_ref()));
                outcome.reconciliations.extend(self.redeploy_if_enabled(&pkg));
            });
        }
        outcome
    }

    pub fn set_injection_delay(&self, seconds: u32) -> MutationOutcome {
        MutationOutcome::saved(self.store().set_injection_delay(seconds))
    }

    pub fn set_hide_injection(&self, hide: bool) -> MutationOutcome {
        MutationOutcome::saved(self.store().set_hide_injection(hide))
    }

    /// Explicitly drop per-app entries for packages not in `keep`.
    pub fn prune_packages(&self, keep: &[PackageName]) -> Result<Vec<PackageName>, SyncError> {
        Ok(self.current().prune_packages(keep)?)
    }

    // -----------------------------------------------------------------------
    // 4. Catalog
    // -----------------------------------------------------------------------

    pub fn payloads(&self) -> Vec<PayloadFile> {
        catalog::all_payloads(&self.current())
    }

    pub fn app_payloads(&self, package: &PackageName) -> Vec<PayloadFile> {
        catalog::app_payloads(&self.current(), package)
    }

    pub fn add_global_payload(
        &self,
        source: &Path,
        delete_source: bool,
    ) -> Result<Persisted<PayloadFile>, SyncError> {
        catalog::add_global_payload(&mut self.current(), source, delete_source)
    }

    pub fn remove_global_payload(&self, name: &str) -> Result<Persisted<RemovedPayload>, SyncError> {
        let mut store = self.current();
        let file = catalog::find_by_name(&store, name).ok_or_else(|| SyncError::PayloadNotFound {
            name: name.to_string(),
        })?;
        catalog::remove_global_payload(&mut store, file.key())
    }

    // -----------------------------------------------------------------------
    // 5. Status
    // -----------------------------------------------------------------------

    pub fn status(&self, package: &PackageName) -> PackageStatus {
        let (app, gadget) = {
            let store = self.current();
            (store.document().app(package).cloned(), store.resolved_gadget(package))
        };
        drift::check(
            self.channel.as_ref(),
            &self.settings,
            package,
            app.as_ref(),
            gadget.as_ref(),
        )
    }

    /// Status of every configured package, sorted by name.
    pub fn status_all(&self) -> Vec<PackageStatus> {
        let packages: Vec<PackageName> = self.current().document().apps.keys().cloned().collect();
        packages.iter().map(|pkg| self.status(pkg)).collect()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("module_dir", &self.settings.module_dir)
            .finish()
    }
}
