//! Drift classification: does a sandbox match the document?
//!
//! Precedence:
//! 1. `Unconfigured` (no per-app entry)
//! 2. `Disabled` (entry present, injection off; lists selected files still
//!    present in the sandbox)
//! 3. `Drifted` (enabled, but selected files or the gadget config missing)
//! 4. `Current`

use serde::Serialize;

use myinjector_core::channel::{file_exists, CommandChannel};
use myinjector_core::settings::EngineSettings;
use myinjector_core::types::{
    is_plain_file_name, AppConfig, GadgetConfig, InjectionMethod, PackageName,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriftState {
    Unconfigured,
    Disabled { leftovers: Vec<String> },
    Drifted { missing: Vec<String> },
    Current,
}

impl DriftState {
    pub fn label(&self) -> &'static str {
        match self {
            DriftState::Unconfigured => "unconfigured",
            DriftState::Disabled { .. } => "disabled",
            DriftState::Drifted { .. } => "drifted",
            DriftState::Current => "current",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageStatus {
    pub package: PackageName,
    pub enabled: bool,
    pub injection_method: InjectionMethod,
    pub payloads: Vec<String>,
    /// Deployed gadget config filename, when a gadget resolves.
    pub gadget_config: Option<String>,
    pub state: DriftState,
}

/// Inspect the sandbox of `package` through the channel.
pub fn check(
    channel: &dyn CommandChannel,
    settings: &EngineSettings,
    package: &PackageName,
    app: Option<&AppConfig>,
    gadget: Option<&GadgetConfig>,
) -> PackageStatus {
    let Some(app) = app else {
        return PackageStatus {
            package: package.clone(),
            enabled: false,
            injection_method: InjectionMethod::default(),
            payloads: Vec::new(),
            gadget_config: None,
            state: DriftState::Unconfigured,
        };
    };

    let files_dir = settings.files_dir(package);
    let mut expected: Vec<String> = app.payloads.iter().map(|p| p.name.clone()).collect();
    let gadget_config = gadget
        .filter(|g| is_plain_file_name(&g.gadget_name))
        .map(|g| myinjector_gadget::config_file_name(&g.gadget_name));
    expected.extend(gadget_config.iter().cloned());

    let (present, absent): (Vec<String>, Vec<String>) = expected
        .into_iter()
        .partition(|name| file_exists(channel, &files_dir.join(name)));

    let state = if !app.enabled {
        DriftState::Disabled { leftovers: present }
    } else if !absent.is_empty() {
        DriftState::Drifted { missing: absent }
    } else {
        DriftState::Current
    };

    PackageStatus {
        package: package.clone(),
        enabled: app.enabled,
        injection_method: app.injection_method,
        payloads: app.payloads.iter().map(|p| p.name.clone()).collect(),
        gadget_config,
        state,
    }
}
