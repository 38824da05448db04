//! Hide-list capability.
//!
//! [`HideList`] wraps any [`HideModule`] and keeps the injector's own library
//! on the list at all times. [`ListFileModule`] is the module the CLI drives:
//! one library name per line in `<module_dir>/hide_list`, next to
//! `config.json`, active while the document's `hideInjection` flag is set.

use std::path::PathBuf;

use serde::Serialize;

use myinjector_core::channel::quote_path;
use myinjector_core::types::is_plain_file_name;

use crate::engine::Engine;
use crate::error::{io_err, SyncError};

/// The injector's own library. Always hidden.
pub const SELF_LIBRARY: &str = "libmyinjector.so";

/// A module that hides shared libraries from the target process.
pub trait HideModule {
    fn is_loaded(&self) -> bool;
    /// Libraries that could be hidden.
    fn available(&self) -> Result<Vec<String>, SyncError>;
    /// Libraries currently hidden.
    fn hidden(&self) -> Result<Vec<String>, SyncError>;
    fn add_hidden(&mut self, name: &str) -> Result<(), SyncError>;
    fn remove_hidden(&mut self, name: &str) -> Result<(), SyncError>;
    fn reload(&mut self) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HideEntry {
    pub name: String,
    pub hidden: bool,
    /// Cannot be unhidden.
    pub fixed: bool,
}

#[derive(Debug)]
pub struct HideList<M> {
    module: M,
}

impl<M: HideModule> HideList<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_loaded()
    }

    /// Every available library with its current state.
    pub fn entries(&self) -> Result<Vec<HideEntry>, SyncError> {
        let hidden = self.module.hidden()?;
        Ok(self
            .module
            .available()?
            .into_iter()
            .map(|name| {
                let fixed = name == SELF_LIBRARY;
                HideEntry {
                    hidden: fixed || hidden.contains(&name),
                    fixed,
                    name,
                }
            })
            .collect())
    }

    /// Add `SELF_LIBRARY` if the module lost it. Returns `true` if it had
    /// to be re-added.
    pub fn ensure_self_hidden(&mut self) -> Result<bool, SyncError> {
        if self.module.hidden()?.iter().any(|n| n == SELF_LIBRARY) {
            return Ok(false);
        }
        tracing::warn!("{SELF_LIBRARY} missing from hide list, re-adding");
        self.module.add_hidden(SELF_LIBRARY)?;
        Ok(true)
    }

    pub fn hide(&mut self, name: &str) -> Result<(), SyncError> {
        if self.module.hidden()?.iter().any(|n| n == name) {
            return Ok(());
        }
        self.module.add_hidden(name)?;
        tracing::info!("hiding {name}");
        Ok(())
    }

    pub fn unhide(&mut self, name: &str) -> Result<(), SyncError> {
        if name == SELF_LIBRARY {
            tracing::warn!("refusing to unhide {name}");
            return Err(SyncError::ProtectedHiddenItem {
                name: name.to_string(),
            });
        }
        self.module.remove_hidden(name)?;
        tracing::info!("unhiding {name}");
        Ok(())
    }

    /// Reload the module and put `SELF_LIBRARY` back if needed.
    pub fn reload(&mut self) -> Result<(), SyncError> {
        self.module.reload()?;
        self.ensure_self_hidden()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// List file module
// ---------------------------------------------------------------------------

/// Hide list persisted as a plain list file in the module directory.
pub struct ListFileModule<'a> {
    engine: &'a Engine,
    names: Vec<String>,
}

impl<'a> ListFileModule<'a> {
    /// Read the list file; absent means empty.
    pub fn open(engine: &'a Engine) -> Self {
        let names = read_list(engine);
        Self { engine, names }
    }

    pub fn path(engine: &Engine) -> PathBuf {
        engine.settings().module_dir.join("hide_list")
    }

    fn save(&self) -> Result<(), SyncError> {
        if !self.engine.channel().is_privileged() {
            return Err(SyncError::NotPrivileged);
        }
        let settings = self.engine.settings();
        let dir = &settings.staging_dir;
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let staged = dir.join(format!("hide_list.{}", std::process::id()));
        let mut text = self.names.join("\n");
        text.push('\n');
        std::fs::write(&staged, text).map_err(|e| io_err(&staged, e))?;

        let target = Self::path(self.engine);
        let out = self.engine.channel().execute(&format!(
            "cp {src} {dst} && chmod 644 {dst}",
            src = quote_path(&staged),
            dst = quote_path(&target)
        ));
        if let Err(e) = std::fs::remove_file(&staged) {
            tracing::warn!("could not remove staging file {}: {}", staged.display(), e);
        }
        if out.success {
            Ok(())
        } else {
            Err(SyncError::Step {
                step: "save hide list",
                reason: out.reason(),
            })
        }
    }
}

fn read_list(engine: &Engine) -> Vec<String> {
    let path = ListFileModule::path(engine);
    let out = engine.channel().execute(&format!("cat {}", quote_path(&path)));
    if !out.success {
        tracing::debug!("no hide list at {}", path.display());
        return Vec::new();
    }
    let mut names: Vec<String> = Vec::new();
    for line in out.stdout.iter().map(|l| l.trim()) {
        if is_plain_file_name(line) && !names.iter().any(|n| n == line) {
            names.push(line.to_string());
        }
    }
    names
}

impl HideModule for ListFileModule<'_> {
    fn is_loaded(&self) -> bool {
        self.engine.document().hide_injection
    }

    /// The injector plus every catalog payload; listed names stay available.
    fn available(&self) -> Result<Vec<String>, SyncError> {
        let mut names = vec![SELF_LIBRARY.to_string()];
        names.extend(self.engine.payloads().into_iter().map(|p| p.name));
        names.extend(self.names.iter().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn hidden(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.names.clone())
    }

    fn add_hidden(&mut self, name: &str) -> Result<(), SyncError> {
        if !is_plain_file_name(name) {
            return Err(SyncError::Hide(format!("{name:?} is not a library file name")));
        }
        self.names.push(name.to_string());
        self.save()
    }

    fn remove_hidden(&mut self, name: &str) -> Result<(), SyncError> {
        let before = self.names.len();
        self.names.retain(|n| n != name);
        if self.names.len() == before {
            return Ok(());
        }
        self.save()
    }

    fn reload(&mut self) -> Result<(), SyncError> {
        self.names = read_list(self.engine);
        Ok(())
    }
}
