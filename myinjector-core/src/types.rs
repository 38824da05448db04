//! Domain types for the injector configuration document.
//!
//! The JSON shape is shared with the native injection module, which reads
//! `config.json` inside the zygote. Field names are therefore camelCase and
//! every field carries a default, so documents written by older releases keep
//! loading. Enum-valued strings are parsed leniently (see `lenient`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::lenient::{self, Choice};

/// Current `schemaVersion` written by this release.
pub const SCHEMA_VERSION: u32 = 1;
pub const MAX_INJECTION_DELAY: u32 = 60;
pub const DEFAULT_INJECTION_DELAY: u32 = 2;
pub const DEFAULT_GADGET_NAME: &str = "libgadget.so";
pub const DEFAULT_GADGET_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_GADGET_PORT: u16 = 27042;
pub const DEFAULT_SCRIPT_PATH: &str = "/data/local/tmp/script.js";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// An Android package identifier, e.g. `com.example.app`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageName(pub String);

impl PackageName {
    /// Parse and validate a package identifier.
    ///
    /// Package names end up in sandbox paths, so only the characters the
    /// platform allows in them (`[A-Za-z0-9_.]`) are accepted.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let name = Self::from(raw.trim());
        name.validate()?;
        Ok(name)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason| CoreError::InvalidPackage {
            name: self.0.clone(),
            reason,
        };
        if self.0.is_empty() {
            return Err(invalid("package name is empty"));
        }
        if self.0.starts_with('.') || self.0.contains("..") {
            return Err(invalid("package name has an empty segment"));
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(invalid("package name may only contain [A-Za-z0-9_.]"));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single path component that cannot escape the directory it is joined
/// onto. Payload and gadget names must pass before they touch a sandbox.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Canonical location of a payload inside the payload storage directory.
///
/// This is the identity key of a [`PayloadFile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoredPath(pub String);

impl fmt::Display for StoredPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for StoredPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StoredPath {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How the native module maps payloads into the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMethod {
    #[default]
    Standard,
    Riru,
    CustomLinker,
}

impl InjectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionMethod::Standard => "standard",
            InjectionMethod::Riru => "riru",
            InjectionMethod::CustomLinker => "custom_linker",
        }
    }
}

impl Choice for InjectionMethod {
    const FIELD: &'static str = "injectionMethod";

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "standard" => Some(Self::Standard),
            "riru" => Some(Self::Riru),
            "custom_linker" => Some(Self::CustomLinker),
            _ => None,
        }
    }
}

impl FromStr for InjectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as Choice>::parse(&s.to_ascii_lowercase()).ok_or_else(|| {
            format!("unknown injection method '{s}'; expected: standard, riru, custom_linker")
        })
    }
}

impl fmt::Display for InjectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gadget interaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GadgetMode {
    #[default]
    Server,
    Script,
}

impl Choice for GadgetMode {
    const FIELD: &'static str = "mode";

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "server" => Some(Self::Server),
            "script" => Some(Self::Script),
            _ => None,
        }
    }
}

impl GadgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GadgetMode::Server => "server",
            GadgetMode::Script => "script",
        }
    }
}

impl FromStr for GadgetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as Choice>::parse(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown gadget mode '{s}'; expected: server, script"))
    }
}

/// Listener behavior when the configured port is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortConflict {
    #[default]
    Fail,
    PickNext,
}

impl PortConflict {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortConflict::Fail => "fail",
            PortConflict::PickNext => "pick-next",
        }
    }
}

impl Choice for PortConflict {
    const FIELD: &'static str = "onPortConflict";

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fail" => Some(Self::Fail),
            "pick-next" => Some(Self::PickNext),
            _ => None,
        }
    }
}

impl FromStr for PortConflict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as Choice>::parse(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown port conflict policy '{s}'; expected: fail, pick-next"))
    }
}

/// Whether the gadget blocks process start-up until a client attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnLoad {
    #[default]
    Wait,
    Resume,
}

impl OnLoad {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnLoad::Wait => "wait",
            OnLoad::Resume => "resume",
        }
    }
}

impl Choice for OnLoad {
    const FIELD: &'static str = "onLoad";

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "wait" => Some(Self::Wait),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

impl FromStr for OnLoad {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as Choice>::parse(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown on-load policy '{s}'; expected: wait, resume"))
    }
}

// ---------------------------------------------------------------------------
// Document structs
// ---------------------------------------------------------------------------

/// A payload library known to the catalog.
///
/// Identity is the stored path alone: two values with the same
/// `stored_path` are the same entry whatever their `name` or provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PayloadFile {
    /// Display name and deployed filename inside the sandbox.
    pub name: String,
    pub stored_path: StoredPath,
    /// Where the file was imported from. Provenance only.
    pub original_path: String,
}

impl PayloadFile {
    pub fn key(&self) -> &StoredPath {
        &self.stored_path
    }
}

impl PartialEq for PayloadFile {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PayloadFile {}

/// Instrumentation gadget settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GadgetConfig {
    #[serde(deserialize_with = "lenient::choice")]
    pub mode: GadgetMode,
    pub address: String,
    #[serde(deserialize_with = "lenient::port")]
    pub port: u16,
    #[serde(deserialize_with = "lenient::choice")]
    pub on_port_conflict: PortConflict,
    #[serde(deserialize_with = "lenient::choice")]
    pub on_load: OnLoad,
    pub script_path: String,
    /// Payload file backing the gadget.
    pub gadget_name: String,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            mode: GadgetMode::Server,
            address: DEFAULT_GADGET_ADDRESS.to_string(),
            port: DEFAULT_GADGET_PORT,
            on_port_conflict: PortConflict::Fail,
            on_load: OnLoad::Wait,
            script_path: DEFAULT_SCRIPT_PATH.to_string(),
            gadget_name: DEFAULT_GADGET_NAME.to_string(),
        }
    }
}

/// Per-package injection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub enabled: bool,
    #[serde(rename = "soFiles", deserialize_with = "lenient::or_default")]
    pub payloads: Vec<PayloadFile>,
    #[serde(deserialize_with = "lenient::choice")]
    pub injection_method: InjectionMethod,
    pub gadget_config: Option<GadgetConfig>,
    pub use_global_gadget: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            payloads: Vec::new(),
            injection_method: InjectionMethod::Standard,
            gadget_config: None,
            use_global_gadget: true,
        }
    }
}

impl AppConfig {
    pub fn has_payload(&self, key: &StoredPath) -> bool {
        self.payloads.iter().any(|p| p.key() == key)
    }

    /// Append `file` unless an entry with the same stored path exists.
    pub fn add_payload(&mut self, file: PayloadFile) -> bool {
        if self.has_payload(file.key()) {
            return false;
        }
        self.payloads.push(file);
        true
    }

    pub fn remove_payload(&mut self, key: &StoredPath) -> bool {
        let before = self.payloads.len();
        self.payloads.retain(|p| p.key() != key);
        self.payloads.len() != before
    }

    /// Drop every selected entry deployed under `name`.
    pub fn remove_payloads_named(&mut self, name: &str) -> usize {
        let before = self.payloads.len();
        self.payloads.retain(|p| p.name != name);
        before - self.payloads.len()
    }

    /// The gadget this package deploys.
    ///
    /// With `use_global_gadget` the global config wins; a package that opted
    /// into the global config while none exists keeps its own.
    pub fn resolved_gadget<'a>(
        &'a self,
        global: Option<&'a GadgetConfig>,
    ) -> Option<&'a GadgetConfig> {
        if self.use_global_gadget {
            global.or(self.gadget_config.as_ref())
        } else {
            self.gadget_config.as_ref()
        }
    }
}

/// Root of `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleConfig {
    /// Absent in documents written before versioning; read as 0.
    #[serde(default)]
    pub schema_version: u32,
    pub enabled: bool,
    pub hide_injection: bool,
    #[serde(deserialize_with = "lenient::injection_delay")]
    pub injection_delay: u32,
    #[serde(rename = "globalSoFiles", deserialize_with = "lenient::or_default")]
    pub global_payloads: Vec<PayloadFile>,
    #[serde(rename = "perAppConfig", deserialize_with = "lenient::or_default")]
    pub apps: BTreeMap<PackageName, AppConfig>,
    pub global_gadget_config: Option<GadgetConfig>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            enabled: true,
            hide_injection: false,
            injection_delay: DEFAULT_INJECTION_DELAY,
            global_payloads: Vec::new(),
            apps: BTreeMap::new(),
            global_gadget_config: None,
        }
    }
}

impl ModuleConfig {
    /// Bring a freshly parsed document up to the current schema.
    pub fn upgrade(&mut self) {
        if self.schema_version < SCHEMA_VERSION {
            log::info!(
                "upgrading config document from schema {} to {}",
                self.schema_version,
                SCHEMA_VERSION
            );
            self.schema_version = SCHEMA_VERSION;
        }
        self.injection_delay = self.injection_delay.min(MAX_INJECTION_DELAY);
    }

    pub fn app(&self, package: &PackageName) -> Option<&AppConfig> {
        self.apps.get(package)
    }

    /// Absent entries read as an all-defaults [`AppConfig`].
    pub fn app_or_default(&self, package: &PackageName) -> AppConfig {
        self.apps.get(package).cloned().unwrap_or_default()
    }

    /// Mutable entry for `package`, created on first touch.
    pub fn app_entry(&mut self, package: &PackageName) -> &mut AppConfig {
        self.apps.entry(package.clone()).or_default()
    }

    pub fn is_app_enabled(&self, package: &PackageName) -> bool {
        self.apps.get(package).map(|a| a.enabled).unwrap_or(false)
    }

    pub fn enabled_packages(&self) -> Vec<PackageName> {
        self.apps
            .iter()
            .filter(|(_, app)| app.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn global_payload_named(&self, name: &str) -> Option<&PayloadFile> {
        self.global_payloads.iter().find(|p| p.name == name)
    }

    pub fn has_global_payload(&self, key: &StoredPath) -> bool {
        self.global_payloads.iter().any(|p| p.key() == key)
    }

    pub fn resolved_gadget(&self, package: &PackageName) -> Option<GadgetConfig> {
        let global = self.global_gadget_config.as_ref();
        match self.apps.get(package) {
            Some(app) => app.resolved_gadget(global).cloned(),
            None => global.cloned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, stored: &str, original: &str) -> PayloadFile {
        PayloadFile {
            name: name.to_string(),
            stored_path: StoredPath::from(stored),
            original_path: original.to_string(),
        }
    }

    #[test]
    fn payload_identity_is_stored_path() {
        let a = payload("liba.so", "/s/liba.so", "/sdcard/liba.so");
        let b = payload("renamed.so", "/s/liba.so", "/tmp/other.so");
        let c = payload("liba.so", "/s/libc.so", "/sdcard/liba.so");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn add_payload_dedups_by_stored_path() {
        let mut app = AppConfig::default();
        assert!(app.add_payload(payload("a.so", "/s/a.so", "/x/a.so")));
        assert!(!app.add_payload(payload("a.so", "/s/a.so", "/y/a.so")));
        assert_eq!(app.payloads.len(), 1);
        assert!(app.remove_payload(&StoredPath::from("/s/a.so")));
        assert!(app.payloads.is_empty());
    }

    #[test]
    fn missing_app_reads_as_defaults() {
        let doc = ModuleConfig::default();
        let pkg = PackageName::from("com.example");
        let app = doc.app_or_default(&pkg);
        assert!(!app.enabled);
        assert!(app.use_global_gadget);
        assert_eq!(app.injection_method, InjectionMethod::Standard);
        assert!(!doc.is_app_enabled(&pkg));
    }

    #[test]
    fn resolved_gadget_prefers_global_when_opted_in() {
        let global = GadgetConfig {
            port: 1234,
            ..GadgetConfig::default()
        };
        let own = GadgetConfig {
            port: 4321,
            ..GadgetConfig::default()
        };
        let mut app = AppConfig {
            gadget_config: Some(own.clone()),
            ..AppConfig::default()
        };
        assert_eq!(app.resolved_gadget(Some(&global)), Some(&global));
        assert_eq!(app.resolved_gadget(None), Some(&own));
        app.use_global_gadget = false;
        assert_eq!(app.resolved_gadget(Some(&global)), Some(&own));
    }

    #[test]
    fn package_name_validation() {
        assert!(PackageName::parse("com.example.app").is_ok());
        assert!(PackageName::parse("").is_err());
        assert!(PackageName::parse("../etc").is_err());
        assert!(PackageName::parse("com.x; rm -rf /").is_err());
    }

    #[test]
    fn enum_display_and_parse() {
        assert_eq!(InjectionMethod::CustomLinker.to_string(), "custom_linker");
        assert_eq!(
            "RIRU".parse::<InjectionMethod>().unwrap(),
            InjectionMethod::Riru
        );
        assert_eq!("pick-next".parse::<PortConflict>().unwrap(), PortConflict::PickNext);
        assert!("sometimes".parse::<OnLoad>().is_err());
    }
}
