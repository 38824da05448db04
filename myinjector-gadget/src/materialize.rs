//! Deploy a rendered gadget config into an application sandbox.
//!
//! ```text
//! render → <staging>/<package>.<gadgetName>.config
//!        → cp  <staging file> <files dir>/<gadgetName, ".so" → ".config.so">
//!        → chmod 644
//!        → remove staging file
//! ```
//!
//! Failures are logged here and returned to the caller, who records them
//! without aborting the surrounding deployment.

use std::path::{Path, PathBuf};

use myinjector_core::channel::{quote_path, CommandChannel};
use myinjector_core::settings::EngineSettings;
use myinjector_core::types::{is_plain_file_name, GadgetConfig, PackageName};

use crate::error::{io_err, GadgetError};
use crate::render::render;

/// `libgadget.so` → `libgadget.config.so`; other names get `.config.so`
/// appended.
pub fn config_file_name(gadget_name: &str) -> String {
    match gadget_name.strip_suffix(".so") {
        Some(stem) => format!("{stem}.config.so"),
        None => format!("{gadget_name}.config.so"),
    }
}

/// `<data_root>/<package>/files/<config file name>`
pub fn target_path(settings: &EngineSettings, package: &PackageName, cfg: &GadgetConfig) -> PathBuf {
    settings
        .files_dir(package)
        .join(config_file_name(&cfg.gadget_name))
}

/// Render `cfg` and install it next to the package's payloads.
///
/// The files directory must already exist. Returns the deployed path.
/// Names that are not a single file name are refused before any I/O.
pub fn materialize(
    channel: &dyn CommandChannel,
    settings: &EngineSettings,
    package: &PackageName,
    cfg: &GadgetConfig,
) -> Result<PathBuf, GadgetError> {
    if !is_plain_file_name(&cfg.gadget_name) {
        log::error!("refusing gadget config for {package}: bad name {:?}", cfg.gadget_name);
        return Err(GadgetError::InvalidName(cfg.gadget_name.clone()));
    }
    let target = target_path(settings, package, cfg);
    let result = install(channel, &settings.staging_dir, package, cfg, &target);
    match &result {
        Ok(_) => log::info!("deployed gadget config to {}", target.display()),
        Err(e) => log::error!("failed to deploy gadget config for {package}: {e}"),
    }
    result.map(|_| target)
}

fn install(
    channel: &dyn CommandChannel,
    staging_dir: &Path,
    package: &PackageName,
    cfg: &GadgetConfig,
    target: &Path,
) -> Result<(), GadgetError> {
    let text = render(cfg)?;
    std::fs::create_dir_all(staging_dir).map_err(|e| io_err(staging_dir, e))?;
    let staged = staging_dir.join(format!("{}.{}.config", package, cfg.gadget_name));
    std::fs::write(&staged, text).map_err(|e| io_err(&staged, e))?;

    let copied = run(
        channel,
        format!("cp {} {}", quote_path(&staged), quote_path(target)),
    );
    if let Err(e) = std::fs::remove_file(&staged) {
        log::warn!("could not remove staging file {}: {}", staged.display(), e);
    }
    copied?;
    run(channel, format!("chmod 644 {}", quote_path(target)))
}

fn run(channel: &dyn CommandChannel, command: String) -> Result<(), GadgetError> {
    let out = channel.execute(&command);
    if out.success {
        Ok(())
    } else {
        Err(GadgetError::Command {
            reason: out.reason(),
            command,
        })
    }
}
