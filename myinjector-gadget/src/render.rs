//! Gadget config rendering and preview parsing.
//!
//! # Output shapes
//!
//! | Mode   | Document                                                                                   |
//! |--------|--------------------------------------------------------------------------------------------|
//! | server | `{"interaction":{"type":"listen","address":…,"port":…,"on_port_conflict":…,"on_load":…}}`  |
//! | script | `{"interaction":{"type":"script","path":…}}`                                               |
//!
//! Key order is part of the format: the structs below serialize their fields
//! in declaration order and the tag is always emitted first.

use serde::Serialize;
use serde_json::Value;

use myinjector_core::types::{GadgetConfig, GadgetMode, OnLoad, PortConflict};

use crate::error::GadgetError;

#[derive(Serialize)]
struct Document<'a> {
    interaction: Interaction<'a>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Interaction<'a> {
    Listen {
        address: &'a str,
        port: u16,
        on_port_conflict: &'static str,
        on_load: &'static str,
    },
    Script {
        path: &'a str,
    },
}

impl<'a> From<&'a GadgetConfig> for Document<'a> {
    fn from(cfg: &'a GadgetConfig) -> Self {
        let interaction = match cfg.mode {
            GadgetMode::Server => Interaction::Listen {
                address: &cfg.address,
                port: cfg.port,
                on_port_conflict: cfg.on_port_conflict.as_str(),
                on_load: cfg.on_load.as_str(),
            },
            GadgetMode::Script => Interaction::Script {
                path: &cfg.script_path,
            },
        };
        Document { interaction }
    }
}

/// Compact rendering, the exact bytes deployed next to the gadget.
pub fn render(cfg: &GadgetConfig) -> Result<String, GadgetError> {
    Ok(serde_json::to_string(&Document::from(cfg))?)
}

/// Indented rendering for display.
pub fn render_pretty(cfg: &GadgetConfig) -> Result<String, GadgetError> {
    Ok(serde_json::to_string_pretty(&Document::from(cfg))?)
}

/// Read an edited preview document back into a config.
///
/// Fields the document does not mention keep their value from `base`
/// (notably `gadget_name`, which the document never carries). Unknown
/// `on_port_conflict`/`on_load` values read as `fail`/`wait`.
pub fn parse_preview(text: &str, base: &GadgetConfig) -> Result<GadgetConfig, GadgetError> {
    let root: Value = serde_json::from_str(text)?;
    let interaction = root
        .get("interaction")
        .and_then(Value::as_object)
        .ok_or_else(|| GadgetError::InvalidDocument("missing \"interaction\" object".into()))?;
    let kind = interaction
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GadgetError::InvalidDocument("missing \"interaction.type\"".into()))?;

    let mut cfg = base.clone();
    if kind == "script" {
        cfg.mode = GadgetMode::Script;
        if let Some(path) = interaction.get("path").and_then(Value::as_str) {
            cfg.script_path = path.to_string();
        }
        return Ok(cfg);
    }

    cfg.mode = GadgetMode::Server;
    let field = |name: &str| {
        interaction
            .get(name)
            .ok_or_else(|| GadgetError::InvalidDocument(format!("missing \"interaction.{name}\"")))
    };
    cfg.address = field("address")?
        .as_str()
        .ok_or_else(|| GadgetError::InvalidDocument("address must be a string".into()))?
        .to_string();
    cfg.port = field("port")?
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| GadgetError::InvalidDocument("port must be in 1..=65535".into()))?;
    cfg.on_port_conflict = match field("on_port_conflict")?.as_str() {
        Some("pick-next") => PortConflict::PickNext,
        _ => PortConflict::Fail,
    };
    cfg.on_load = match field("on_load")?.as_str() {
        Some("resume") => OnLoad::Resume,
        _ => OnLoad::Wait,
    };
    Ok(cfg)
}
