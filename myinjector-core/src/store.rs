//! The Configuration Store.
//!
//! Owns the in-memory [`ModuleConfig`] and its persisted copy at
//! `<module_dir>/config.json`. The module directory is root-owned, so both
//! directions go through the [`CommandChannel`]:
//!
//! ```text
//! load:  cat <config>                      → parse (lenient) → upgrade
//! save:  serialize → <staging>/config.<pid>.json
//!        cp <staging> <config> && chmod 644 <config>
//!        remove staging file
//! ```
//!
//! # Failure policy
//!
//! `load` never fails: an absent, unreadable or malformed document yields
//! [`ModuleConfig::default`]. `save` reports failure but never rolls back the
//! in-memory document, which stays the intended state until the next
//! successful save.
//!
//! # Other writers
//!
//! The CLI and the daemon edit the same file. Every mutation takes the
//! [`DocumentLock`], re-reads the document, applies the change and saves, so
//! the file on disk is always the latest intent. The re-read is skipped while
//! the store holds unsaved changes.
//!
//! Every mutator persists before returning. Side effects on application
//! sandboxes (deploy on enable, cleanup on disable) live one layer up, in the
//! sync engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channel::{quote_path, CommandChannel};
use crate::error::{store_io_err, StoreError};
use crate::lockfile::DocumentLock;
use crate::settings::EngineSettings;
use crate::types::{
    AppConfig, GadgetConfig, InjectionMethod, ModuleConfig, PackageName, MAX_INJECTION_DELAY,
};

// ---------------------------------------------------------------------------
// 1. Document codec
// ---------------------------------------------------------------------------

/// Parse a document with the lenient field rules and upgrade it to the
/// current schema.
pub fn parse_document(text: &str) -> Result<ModuleConfig, serde_json::Error> {
    let mut doc: ModuleConfig = serde_json::from_str(text)?;
    doc.upgrade();
    Ok(doc)
}

/// Pretty-printed JSON, the form written to disk.
pub fn render_document(doc: &ModuleConfig) -> Result<String, serde_json::Error> {
    let mut text = serde_json::to_string_pretty(doc)?;
    text.push('\n');
    Ok(text)
}

// ---------------------------------------------------------------------------
// 2. Store
// ---------------------------------------------------------------------------

pub struct ConfigStore {
    settings: EngineSettings,
    channel: Arc<dyn CommandChannel>,
    doc: ModuleConfig,
    /// The in-memory document differs from the file and must not be
    /// replaced by a re-read.
    dirty: bool,
}

impl ConfigStore {
    /// Load-or-default. Never fails.
    pub fn open(settings: EngineSettings, channel: Arc<dyn CommandChannel>) -> Self {
        let doc = load_document(&settings, channel.as_ref());
        Self {
            settings,
            channel,
            doc,
            dirty: false,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    pub fn document(&self) -> &ModuleConfig {
        &self.doc
    }

    /// Replace the in-memory document from disk. Nothing is merged and
    /// unsaved changes are dropped.
    pub fn reload(&mut self) {
        self.doc = load_document(&self.settings, self.channel.as_ref());
        self.dirty = false;
    }

    /// Pick up changes other processes made to the file. Unsaved changes
    /// win over the file until they are persisted.
    pub fn refresh(&mut self) {
        if self.dirty {
            log::debug!("unsaved changes pending, not re-reading the config");
            return;
        }
        self.doc = load_document(&self.settings, self.channel.as_ref());
    }

    /// Whether the in-memory document holds changes the file lacks.
    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }

    /// Hold the cross-process document lock. `None` when the lock file cannot
    /// be opened; the caller proceeds unlocked.
    pub fn lock_document(&self) -> Option<DocumentLock> {
        let path = self.settings.document_lock_file();
        match DocumentLock::acquire(&path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                log::warn!("could not lock {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Replace the document wholesale and persist it.
    pub fn replace_document(&mut self, doc: ModuleConfig) -> Result<(), StoreError> {
        let _lock = self.lock_document();
        self.doc = doc;
        self.save()
    }

    /// Apply `f` to the document, then persist.
    ///
    /// The mutation is kept even when persisting fails.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut ModuleConfig) -> R) -> Result<R, StoreError> {
        let (out, saved) = self.update(f);
        saved.map(|()| out)
    }

    /// Like [`ConfigStore::mutate`], but hands back `f`'s result alongside
    /// the save result.
    pub fn update<R>(
        &mut self,
        f: impl FnOnce(&mut ModuleConfig) -> R,
    ) -> (R, Result<(), StoreError>) {
        let _lock = self.lock_document();
        self.refresh();
        let out = f(&mut self.doc);
        let saved = self.save();
        (out, saved)
    }

    /// `mkdir -p` the module and payload directories, `chmod 755` both.
    pub fn ensure_module_directories(&self) -> Result<(), StoreError> {
        let dirs = format!(
            "{} {}",
            quote_path(&self.settings.module_dir),
            quote_path(&self.settings.payload_dir())
        );
        self.run(&format!("mkdir -p {dirs} && chmod 755 {dirs}"))
    }

    /// Persist the in-memory document. Callers that did not go through
    /// [`ConfigStore::update`] should hold [`ConfigStore::lock_document`].
    pub fn save(&mut self) -> Result<(), StoreError> {
        let saved = self.write_document();
        self.dirty = saved.is_err();
        saved
    }

    /// Serialize, stage locally, then copy into place through the channel.
    fn write_document(&self) -> Result<(), StoreError> {
        let target = self.settings.config_file();
        if !self.channel.is_privileged() {
            log::error!("cannot persist {}: no root shell", target.display());
            return Err(StoreError::NotPrivileged);
        }
        let text = render_document(&self.doc)?;
        let staged = self.stage(&text)?;

        let command = format!(
            "cp {src} {dst} && chmod 644 {dst}",
            src = quote_path(&staged),
            dst = quote_path(&target)
        );
        let out = self.channel.execute(&command);
        if let Err(e) = std::fs::remove_file(&staged) {
            log::warn!("could not remove staging file {}: {}", staged.display(), e);
        }

        if out.success {
            log::debug!("config saved to {}", target.display());
            Ok(())
        } else {
            log::error!("failed to save config to {}: {}", target.display(), out.reason());
            Err(StoreError::Persist {
                path: target,
                reason: out.reason(),
            })
        }
    }

    fn stage(&self, text: &str) -> Result<PathBuf, StoreError> {
        let dir = &self.settings.staging_dir;
        std::fs::create_dir_all(dir).map_err(|e| store_io_err(dir, e))?;
        let staged = dir.join(format!("config.{}.json", std::process::id()));
        std::fs::write(&staged, text).map_err(|e| store_io_err(&staged, e))?;
        Ok(staged)
    }

    fn run(&self, command: &str) -> Result<(), StoreError> {
        let out = self.channel.execute(command);
        if out.success {
            Ok(())
        } else {
            Err(StoreError::Command {
                command: command.to_string(),
                reason: out.reason(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // 3. Accessors and mutators
    // -----------------------------------------------------------------------

    /// Owned copy; all defaults when the package was never configured.
    pub fn app(&self, package: &PackageName) -> AppConfig {
        self.doc.app_or_default(package)
    }

    /// Entry for `package`, created on first touch. Does not persist; the
    /// store counts as having unsaved changes until the next save.
    pub fn app_mut(&mut self, package: &PackageName) -> &mut AppConfig {
        self.dirty = true;
        self.doc.app_entry(package)
    }

    pub fn is_app_enabled(&self, package: &PackageName) -> bool {
        self.doc.is_app_enabled(package)
    }

    pub fn set_app_enabled(&mut self, package: &PackageName, enabled: bool) -> Result<(), StoreError> {
        self.mutate(|doc| doc.app_entry(package).enabled = enabled)
    }

    pub fn injection_method(&self, package: &PackageName) -> InjectionMethod {
        self.doc
            .app(package)
            .map(|a| a.injection_method)
            .unwrap_or_default()
    }

    pub fn set_injection_method(
        &mut self,
        package: &PackageName,
        method: InjectionMethod,
    ) -> Result<(), StoreError> {
        self.mutate(|doc| doc.app_entry(package).injection_method = method)
    }

    pub fn injection_delay(&self) -> u32 {
        self.doc.injection_delay
    }

    /// Values above the maximum are clamped.
    pub fn set_injection_delay(&mut self, seconds: u32) -> Result<(), StoreError> {
        if seconds > MAX_INJECTION_DELAY {
            log::warn!("injection delay {seconds}s clamped to {MAX_INJECTION_DELAY}s");
        }
        self.mutate(|doc| doc.injection_delay = seconds.min(MAX_INJECTION_DELAY))
    }

    pub fn hide_injection(&self) -> bool {
        self.doc.hide_injection
    }

    pub fn set_hide_injection(&mut self, hide: bool) -> Result<(), StoreError> {
        self.mutate(|doc| doc.hide_injection = hide)
    }

    pub fn global_gadget(&self) -> Option<GadgetConfig> {
        self.doc.global_gadget_config.clone()
    }

    pub fn set_global_gadget(&mut self, gadget: Option<GadgetConfig>) -> Result<(), StoreError> {
        self.mutate(|doc| doc.global_gadget_config = gadget)
    }

    /// The package's own gadget config, ignoring the global one.
    pub fn app_gadget(&self, package: &PackageName) -> Option<GadgetConfig> {
        self.doc.app(package).and_then(|a| a.gadget_config.clone())
    }

    pub fn use_global_gadget(&self, package: &PackageName) -> bool {
        self.doc
            .app(package)
            .map(|a| a.use_global_gadget)
            .unwrap_or(true)
    }

    pub fn set_use_global_gadget(&mut self, package: &PackageName, use_global: bool) -> Result<(), StoreError> {
        self.mutate(|doc| doc.app_entry(package).use_global_gadget = use_global)
    }

    /// The gadget config this package deploys, if any.
    pub fn resolved_gadget(&self, package: &PackageName) -> Option<GadgetConfig> {
        self.doc.resolved_gadget(package)
    }

    pub fn enabled_packages(&self) -> Vec<PackageName> {
        self.doc.enabled_packages()
    }

    /// Drop every per-app entry whose package is not in `keep`.
    ///
    /// Only runs when asked; entries for uninstalled packages are otherwise
    /// retained indefinitely.
    pub fn prune_packages(&mut self, keep: &[PackageName]) -> Result<Vec<PackageName>, StoreError> {
        let stale: Vec<PackageName> = self
            .doc
            .apps
            .keys()
            .filter(|pkg| !keep.contains(pkg))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }
        for pkg in &stale {
            log::info!("pruning config for {pkg}");
        }
        self.mutate(|doc| doc.apps.retain(|pkg, _| keep.contains(pkg)))?;
        Ok(stale)
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("config_file", &self.settings.config_file())
            .field("apps", &self.doc.apps.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// 4. Load
// ---------------------------------------------------------------------------

/// Read `config.json` through the channel, falling back to the default
/// document on any failure.
pub fn load_document(settings: &EngineSettings, channel: &dyn CommandChannel) -> ModuleConfig {
    let path = settings.config_file();
    match read_text(channel, &path) {
        Some(text) if !text.trim().is_empty() => match parse_document(&text) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("malformed config at {}, using defaults: {}", path.display(), e);
                ModuleConfig::default()
            }
        },
        _ => {
            log::info!("no config at {}, using defaults", path.display());
            ModuleConfig::default()
        }
    }
}

fn read_text(channel: &dyn CommandChannel, path: &Path) -> Option<String> {
    let out = channel.execute(&format!("cat {}", quote_path(path)));
    if !out.success {
        log::debug!("cat {} failed: {}", path.display(), out.reason());
        return None;
    }
    Some(out.stdout.join("\n"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RootShell;
    use crate::types::{PayloadFile, StoredPath};
    use std::time::Duration;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> ConfigStore {
        let settings = EngineSettings::rooted_at(tmp.path());
        let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
        let store = ConfigStore::open(settings, Arc::new(shell));
        store.ensure_module_directories().expect("module dirs");
        store
    }

    #[test]
    fn absent_document_loads_as_default() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        assert_eq!(store.document(), &ModuleConfig::default());
    }

    #[test]
    fn save_then_reload_is_identity() {
        let tmp = TempDir::new().unwrap();
        let mut store = store_in(&tmp);
        let pkg = PackageName::from("com.example.app");
        store
            .mutate(|doc| {
                doc.hide_injection = true;
                doc.injection_delay = 7;
                let app = doc.app_entry(&pkg);
                app.enabled = true;
                app.injection_method = InjectionMethod::Riru;
                app.add_payload(PayloadFile {
                    name: "liba.so".into(),
                    stored_path: StoredPath::from("/m/so_files/liba.so"),
                    original_path: "/sdcard/liba.so".into(),
                });
            })
            .expect("save");
        let before = store.document().clone();

        store.reload();
        assert_eq!(store.document(), &before);
        assert_eq!(store.injection_method(&pkg), InjectionMethod::Riru);
    }

    #[test]
    fn saved_file_is_world_readable_and_staging_is_cleaned() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let mut store = store_in(&tmp);
        store.set_hide_injection(true).expect("save");

        let path = store.settings().config_file();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        let lock = store.settings().document_lock_file();
        let leftovers: Vec<_> = std::fs::read_dir(&store.settings().staging_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| *p != lock)
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn failed_persist_keeps_memory_state() {
        let tmp = TempDir::new().unwrap();
        let settings = EngineSettings {
            config_file: Some(tmp.path().join("missing-dir").join("config.json")),
            ..EngineSettings::rooted_at(tmp.path())
        };
        let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
        let mut store = ConfigStore::open(settings, Arc::new(shell));

        let err = store.set_injection_delay(9).unwrap_err();
        assert!(matches!(err, StoreError::Persist { .. }));
        assert_eq!(store.injection_delay(), 9);
    }

    #[test]
    fn mutation_builds_on_what_another_writer_saved() {
        let tmp = TempDir::new().unwrap();
        let mut ours = store_in(&tmp);
        let mut theirs = store_in(&tmp);
        let pkg = PackageName::from("com.example.app");

        theirs.set_app_enabled(&pkg, true).expect("save");
        ours.set_injection_delay(5).expect("save");
        assert!(ours.is_app_enabled(&pkg));

        theirs.refresh();
        assert_eq!(theirs.injection_delay(), 5);
        assert!(theirs.is_app_enabled(&pkg));
    }

    #[test]
    fn unsaved_changes_are_not_replaced_by_refresh() {
        let tmp = TempDir::new().unwrap();
        let settings = EngineSettings {
            config_file: Some(tmp.path().join("missing-dir").join("config.json")),
            ..EngineSettings::rooted_at(tmp.path())
        };
        let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
        let mut store = ConfigStore::open(settings, Arc::new(shell));

        assert!(store.set_hide_injection(true).is_err());
        assert!(store.has_unsaved_changes());
        store.refresh();
        assert!(store.hide_injection());

        store.reload();
        assert!(!store.has_unsaved_changes());
        assert!(!store.hide_injection());
    }

    #[test]
    fn delay_is_clamped() {
        let tmp = TempDir::new().unwrap();
        let mut store = store_in(&tmp);
        store.set_injection_delay(500).expect("save");
        assert_eq!(store.injection_delay(), MAX_INJECTION_DELAY);
    }

    #[test]
    fn prune_drops_only_unlisted_packages() {
        let tmp = TempDir::new().unwrap();
        let mut store = store_in(&tmp);
        let keep = PackageName::from("com.keep");
        let gone = PackageName::from("com.gone");
        store.set_app_enabled(&keep, true).unwrap();
        store.set_app_enabled(&gone, true).unwrap();

        let pruned = store.prune_packages(&[keep.clone()]).unwrap();
        assert_eq!(pruned, vec![gone.clone()]);
        assert_eq!(store.enabled_packages(), vec![keep]);
    }
}
