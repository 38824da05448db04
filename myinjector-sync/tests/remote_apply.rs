//! Remote apply against a temp device tree.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use myinjector_core::store::render_document;
use myinjector_core::{EngineSettings, PackageName, RootShell};
use myinjector_sync::{apply_remote, diff_staged, ApplyRequest, Engine, SyncError};
use rstest::rstest;
use tempfile::TempDir;

const PKG: &str = "com.example.target";

struct Device {
    tmp: TempDir,
    engine: Engine,
}

impl Device {
    /// Enabled package with one deployed payload.
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let settings = EngineSettings::rooted_at(tmp.path());
        fs::create_dir_all(settings.package_data_dir(&pkg())).unwrap();
        let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
        let engine = Engine::open(settings, Arc::new(shell));
        engine.ensure_module_directories().unwrap();

        let source = tmp.path().join("a.so");
        fs::write(&source, "ELF").unwrap();
        engine.add_global_payload(&source, true).unwrap();
        engine.add_payload_to_app(&pkg(), "a.so").unwrap();
        engine.set_app_enabled(&pkg(), true).unwrap();
        Self { tmp, engine }
    }

    fn inbox(&self) -> PathBuf {
        let dir = self.tmp.path().join("local_tmp");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Current document with the delay changed, written to the inbox.
    fn stage_config(&self, delay: u32) -> PathBuf {
        let mut doc = self.engine.document();
        doc.injection_delay = delay;
        let path = self.inbox().join("config.json");
        fs::write(&path, render_document(&doc).unwrap()).unwrap();
        path
    }

    fn stage_gadget_config(&self) -> PathBuf {
        let path = self.inbox().join("libgadget.config.so");
        fs::write(&path, "{\"interaction\":{\"type\":\"script\",\"path\":\"/x.js\"}}").unwrap();
        path
    }

    fn files_dir(&self) -> PathBuf {
        self.engine.settings().files_dir(&pkg())
    }
}

fn pkg() -> PackageName {
    PackageName::from(PKG)
}

#[rstest]
#[case::redeploy_only(false, false, false, true)]
#[case::config_and_deploy(false, true, false, true)]
#[case::gadget_and_deploy(false, false, true, true)]
#[case::deploy_only_without_files(true, false, false, true)]
#[case::deploy_only_config(true, true, false, false)]
#[case::deploy_only_gadget(true, false, true, false)]
#[case::deploy_only_both(true, true, true, false)]
fn apply_truth_table(
    #[case] deploy_only: bool,
    #[case] with_config: bool,
    #[case] with_gadget: bool,
    #[case] deploys: bool,
) {
    let device = Device::new();
    let config_path = with_config.then(|| device.stage_config(17));
    let gadget_config_path = with_gadget.then(|| device.stage_gadget_config());
    let request = ApplyRequest {
        package: PKG.into(),
        config_path: config_path.clone(),
        gadget_config_path: gadget_config_path.clone(),
        deploy_only,
    };

    let report = apply_remote(&device.engine, &request).unwrap();

    assert_eq!(report.deployment.is_some(), deploys);
    assert_eq!(report.config.is_some(), with_config);
    if with_config {
        assert!(report.config.as_ref().unwrap().succeeded());
        assert_eq!(device.engine.document().injection_delay, 17);
    }
    if with_gadget {
        assert!(report.gadget_config.as_ref().unwrap().deployed());
        assert!(device.files_dir().join("libgadget.config.so").is_file());
    }
    for staged in config_path.iter().chain(gadget_config_path.iter()) {
        assert!(!staged.exists(), "{} should be removed", staged.display());
    }
    assert_eq!(
        report.staged_removed.len(),
        usize::from(with_config) + usize::from(with_gadget)
    );
}

#[test]
fn staged_files_are_removed_when_apply_fails() {
    let device = Device::new();
    let staged = device.stage_config(5);
    let request = ApplyRequest {
        package: "  ".into(),
        config_path: Some(staged.clone()),
        ..ApplyRequest::default()
    };

    let err = apply_remote(&device.engine, &request).unwrap_err();
    assert!(matches!(err, SyncError::EmptyPackage));
    assert!(!staged.exists());
    assert_ne!(device.engine.document().injection_delay, 5);
}

#[test]
fn missing_staged_config_is_skipped() {
    let device = Device::new();
    let request = ApplyRequest {
        package: PKG.into(),
        config_path: Some(device.inbox().join("absent.json")),
        ..ApplyRequest::default()
    };
    let report = apply_remote(&device.engine, &request).unwrap();
    assert_eq!(report.config.as_ref().unwrap().label(), "skipped");
    assert!(report.deployment.is_some());
}

#[test]
fn staged_config_diff_previews_apply() {
    let device = Device::new();
    let staged = device.stage_config(33);

    let diff = diff_staged(&device.engine.document(), &staged).unwrap();
    assert!(diff.changed);
    assert!(diff.unified_diff.contains("\"injectionDelay\": 33"));
    assert!(staged.exists());
    assert_ne!(device.engine.document().injection_delay, 33);
}
