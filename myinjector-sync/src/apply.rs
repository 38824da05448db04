//! Remote apply: externally staged config files pushed into the engine.
//!
//! ```text
//! 1. reject empty package
//! 2. ensure module directories
//! 3. staged config?         cp → <config file>, chmod 644, reload
//! 4. staged gadget config?  mkdir files dir, cp under its own name,
//!                           chmod 644, chown, label
//! 5. deploy iff !deploy_only || no staged files
//! 6. rm -f every staged file, whatever happened above
//! ```
//!
//! Callers are gated by UID before any of this runs; see [`authorize`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use myinjector_core::channel::{file_exists, quote_path};
use myinjector_core::types::PackageName;

use crate::engine::{Engine, Reconciliation};
use crate::error::SyncError;
use crate::reconciler::{check_package, FileReport};
use crate::steps::{self, StepOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub package: String,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub gadget_config_path: Option<PathBuf>,
    #[serde(default)]
    pub deploy_only: bool,
}

impl ApplyRequest {
    /// Deploy unless this is a deploy-only request that also carries files.
    pub fn should_deploy(&self) -> bool {
        !self.deploy_only || (self.config_path.is_none() && self.gadget_config_path.is_none())
    }

    fn staged_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.config_path.iter().chain(self.gadget_config_path.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub package: PackageName,
    pub config: Option<StepOutcome>,
    pub gadget_config: Option<FileReport>,
    pub deployment: Option<Reconciliation>,
    pub staged_removed: Vec<RemovalOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub path: PathBuf,
    pub outcome: StepOutcome,
}

/// Whether a caller UID may trigger an apply.
pub fn authorize(uid: u32, trusted: &[u32]) -> bool {
    let ok = trusted.contains(&uid);
    if !ok {
        tracing::warn!("unauthorized request from uid {uid}");
    }
    ok
}

/// Run an apply request. Staged files are removed on every path out.
pub fn apply_remote(engine: &Engine, request: &ApplyRequest) -> Result<ApplyReport, SyncError> {
    let result = run(engine, request);
    let removed = remove_staged(engine, request);
    result.map(|mut report| {
        report.staged_removed = removed;
        report
    })
}

fn run(engine: &Engine, request: &ApplyRequest) -> Result<ApplyReport, SyncError> {
    let package = PackageName::from(request.package.trim());
    check_package(&package)?;
    tracing::info!(
        "apply for {} (config: {:?}, gadget config: {:?}, deploy_only: {})",
        package,
        request.config_path,
        request.gadget_config_path,
        request.deploy_only
    );
    if !engine.channel().is_privileged() {
        tracing::error!("no root access available");
        return Err(SyncError::NotPrivileged);
    }
    engine.ensure_module_directories()?;

    let config = request
        .config_path
        .as_deref()
        .map(|path| install_config(engine, path));

    let gadget_config = request
        .gadget_config_path
        .as_deref()
        .map(|path| engine.locks().with(&package, || install_gadget_config(engine, &package, path)));

    let deployment = request
        .should_deploy()
        .then(|| match engine.deploy_for_app(&package) {
            Ok(report) => Reconciliation::Deployed(report),
            Err(e) => {
                tracing::warn!("apply deploy for {package} skipped: {e}");
                Reconciliation::Skipped {
                    package: package.clone(),
                    reason: e.to_string(),
                }
            }
        });

    Ok(ApplyReport {
        package,
        config,
        gadget_config,
        deployment,
        staged_removed: Vec::new(),
    })
}

fn install_config(engine: &Engine, staged: &Path) -> StepOutcome {
    let channel = engine.channel();
    if !file_exists(channel, staged) {
        tracing::warn!("staged config not found: {}", staged.display());
        return StepOutcome::skipped("staged file not found");
    }
    let target = engine.settings().config_file();
    let outcome = engine.replace_config(|| {
        steps::Chain::new("install config")
            .then(
                "cp",
                format!(
                    "cp {src} {dst} && chmod 644 {dst}",
                    src = quote_path(staged),
                    dst = quote_path(&target)
                ),
            )
            .run(channel)
    });
    if outcome.succeeded() {
        tracing::info!("config replaced from {}", staged.display());
    }
    outcome
}

fn install_gadget_config(engine: &Engine, package: &PackageName, staged: &Path) -> FileReport {
    let channel = engine.channel();
    let settings = engine.settings();
    let files_dir = settings.files_dir(package);
    let name = staged
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = files_dir.join(&name);
    let not_done = |copy: StepOutcome, reason: &str| FileReport {
        name: name.clone(),
        target: target.clone(),
        copy,
        chmod: StepOutcome::skipped(reason),
        chown: StepOutcome::skipped(reason),
        label: StepOutcome::skipped(reason),
    };

    if name.is_empty() || !file_exists(channel, staged) {
        tracing::warn!("staged gadget config not found: {}", staged.display());
        return not_done(StepOutcome::skipped("staged file not found"), "not copied");
    }
    let dir = steps::mkdir(&settings.su_binary, &files_dir).run(channel);
    if dir.is_failed() {
        return not_done(dir, "files directory missing");
    }
    let copy = steps::copy_file(channel, staged, &target);
    if !copy.succeeded() {
        return not_done(copy, "copy failed");
    }
    let chmod = steps::chmod("644", &target).run(channel);
    let reconciler = engine.reconciler();
    let uid = reconciler.resolve_uid(package);
    let (chown, label) = reconciler.own(&target, &settings.package_data_dir(package), uid);
    tracing::info!("gadget config installed at {}", target.display());
    FileReport {
        name,
        target,
        copy,
        chmod,
        chown,
        label,
    }
}

fn remove_staged(engine: &Engine, request: &ApplyRequest) -> Vec<RemovalOutcome> {
    request
        .staged_paths()
        .map(|path| {
            let outcome = steps::Chain::new("remove staged")
                .then("rm", format!("rm -f {}", quote_path(path)))
                .run(engine.channel());
            RemovalOutcome {
                path: path.clone(),
                outcome,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, false, false, true)]
    #[case(false, true, false, true)]
    #[case(false, false, true, true)]
    #[case(true, false, false, true)]
    #[case(true, true, false, false)]
    #[case(true, false, true, false)]
    #[case(true, true, true, false)]
    fn deploy_truth_table(
        #[case] deploy_only: bool,
        #[case] config: bool,
        #[case] gadget: bool,
        #[case] expected: bool,
    ) {
        let request = ApplyRequest {
            package: "com.example".into(),
            config_path: config.then(|| PathBuf::from("/data/local/tmp/config.json")),
            gadget_config_path: gadget.then(|| PathBuf::from("/data/local/tmp/g.config.so")),
            deploy_only,
        };
        assert_eq!(request.should_deploy(), expected);
    }

    #[rstest]
    #[case(0, true)]
    #[case(2000, true)]
    #[case(10123, false)]
    fn trusted_uids(#[case] uid: u32, #[case] expected: bool) {
        assert_eq!(authorize(uid, &[0, 2000]), expected);
    }

    #[test]
    fn request_fields_default_when_absent() {
        let request: ApplyRequest = serde_json::from_str(r#"{"package":"com.x"}"#).unwrap();
        assert_eq!(request.package, "com.x");
        assert!(request.config_path.is_none());
        assert!(!request.deploy_only);
        assert!(request.should_deploy());
    }
}
