//! Engine flows against a temp directory standing in for the device, run
//! through the direct (`sh -c`) channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use myinjector_core::types::{GadgetConfig, PackageName};
use myinjector_core::{EngineSettings, RootShell};
use myinjector_sync::{
    DriftState, Engine, HideList, ListFileModule, Reconciliation, SyncError, SELF_LIBRARY,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PKG: &str = "com.example.target";

fn device() -> (TempDir, Engine) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let settings = EngineSettings::rooted_at(tmp.path());
    fs::create_dir_all(settings.package_data_dir(&pkg())).unwrap();
    let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
    let engine = Engine::open(settings, Arc::new(shell));
    engine.ensure_module_directories().unwrap();
    (tmp, engine)
}

/// A second engine over the same tree, as the daemon would hold it.
fn other_process(engine: &Engine) -> Engine {
    let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
    Engine::open(engine.settings().clone(), Arc::new(shell))
}

fn pkg() -> PackageName {
    PackageName::from(PKG)
}

/// Write an import source and add it to the catalog.
fn import(tmp: &TempDir, engine: &Engine, name: &str) -> PathBuf {
    let dir = tmp.path().join("incoming");
    fs::create_dir_all(&dir).unwrap();
    let source = dir.join(name);
    fs::write(&source, format!("ELF {name}")).unwrap();
    let added = engine.add_global_payload(&source, false).unwrap();
    assert!(added.persist_error.is_none());
    PathBuf::from(&added.value.stored_path.0)
}

fn files_dir(engine: &Engine) -> PathBuf {
    engine.settings().files_dir(&pkg())
}

fn present(dir: &Path, name: &str) -> bool {
    dir.join(name).is_file()
}

fn deployed(outcome: &Reconciliation) -> Vec<String> {
    match outcome {
        Reconciliation::Deployed(r) => r.deployed_names().iter().map(|s| s.to_string()).collect(),
        other => panic!("expected a deployment, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn missing_source_does_not_stop_other_files() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    let gone = import(&tmp, &engine, "missing.so");
    import(&tmp, &engine, "b.so");
    fs::remove_file(gone).unwrap();

    for name in ["a.so", "missing.so", "b.so"] {
        engine.add_payload_to_app(&pkg(), name).unwrap();
    }
    let outcome = engine.set_app_enabled(&pkg(), true).unwrap();

    assert_eq!(outcome.reconciliations.len(), 1);
    assert_eq!(deployed(&outcome.reconciliations[0]), vec!["a.so", "b.so"]);
    let Reconciliation::Deployed(report) = &outcome.reconciliations[0] else {
        unreachable!()
    };
    assert_eq!(report.files.len(), 3);
    assert_eq!(report.failed().len(), 1);
    assert!(!report.files[1].deployed());

    let dir = files_dir(&engine);
    assert!(present(&dir, "a.so"));
    assert!(present(&dir, "b.so"));
    assert!(!present(&dir, "missing.so"));
}

#[test]
fn deploy_is_idempotent() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();

    let first = fs::read(files_dir(&engine).join("a.so")).unwrap();
    let again = engine.deploy_for_app(&pkg()).unwrap();
    assert_eq!(again.deployed_names(), vec!["a.so"]);
    assert_eq!(fs::read(files_dir(&engine).join("a.so")).unwrap(), first);
}

#[test]
fn disable_removes_only_selected_files() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    import(&tmp, &engine, "b.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.add_payload_to_app(&pkg(), "b.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();

    let dir = files_dir(&engine);
    fs::write(dir.join("keep.txt"), "app data").unwrap();

    let outcome = engine.set_app_enabled(&pkg(), false).unwrap();
    match &outcome.reconciliations[0] {
        Reconciliation::Cleaned(report) => {
            assert_eq!(report.removed_names(), vec!["a.so", "b.so"]);
        }
        other => panic!("expected cleanup, got {other:?}"),
    }
    assert!(!present(&dir, "a.so"));
    assert!(!present(&dir, "b.so"));
    assert!(present(&dir, "keep.txt"));
    assert!(!engine.app(&pkg()).enabled);
    assert_eq!(engine.app_payloads(&pkg()).len(), 2);
}

#[test]
fn enabling_without_payloads_is_reported() {
    let (_tmp, engine) = device();
    let outcome = engine.set_app_enabled(&pkg(), true).unwrap();
    assert!(engine.app(&pkg()).enabled);
    assert!(matches!(
        &outcome.reconciliations[0],
        Reconciliation::Skipped { reason, .. } if reason.contains("no payloads selected")
    ));
}

#[test]
fn gadget_swap_replaces_deployed_files() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    import(&tmp, &engine, "libgadget.so");
    import(&tmp, &engine, "libother.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();

    engine
        .set_app_gadget(&pkg(), Some(GadgetConfig::default()))
        .unwrap();
    let dir = files_dir(&engine);
    assert!(present(&dir, "libgadget.so"));
    assert!(present(&dir, "libgadget.config.so"));
    assert!(!engine.app(&pkg()).use_global_gadget);

    let other = GadgetConfig {
        gadget_name: "libother.so".into(),
        ..GadgetConfig::default()
    };
    engine.set_app_gadget(&pkg(), Some(other)).unwrap();

    assert!(!present(&dir, "libgadget.so"));
    assert!(!present(&dir, "libgadget.config.so"));
    assert!(present(&dir, "libother.so"));
    assert!(present(&dir, "libother.config.so"));
    assert!(present(&dir, "a.so"));
    let names: Vec<String> = engine.app_payloads(&pkg()).into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["a.so", "libother.so"]);

    engine.set_app_gadget(&pkg(), None).unwrap();
    assert!(!present(&dir, "libother.config.so"));
    assert!(engine.app(&pkg()).use_global_gadget);
}

#[test]
fn deselecting_removes_the_deployed_copy() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    import(&tmp, &engine, "b.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.add_payload_to_app(&pkg(), "b.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();

    let key = engine.app_payloads(&pkg())[1].stored_path.clone();
    let outcome = engine.remove_payload_from_app(&pkg(), &key).unwrap();
    assert!(outcome.changed);

    let dir = files_dir(&engine);
    assert!(present(&dir, "a.so"));
    assert!(!present(&dir, "b.so"));
}

#[test]
fn duplicate_import_name_is_refused() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");

    let elsewhere = tmp.path().join("elsewhere");
    fs::create_dir_all(&elsewhere).unwrap();
    fs::write(elsewhere.join("a.so"), "different").unwrap();
    let err = engine
        .add_global_payload(&elsewhere.join("a.so"), false)
        .unwrap_err();

    assert!(matches!(err, SyncError::DuplicatePayload { ref name } if name == "a.so"));
    assert_eq!(engine.payloads().len(), 1);
    let stored = engine.settings().stored_path_for("a.so");
    assert_eq!(fs::read_to_string(stored).unwrap(), "ELF a.so");
}

#[test]
fn import_can_consume_its_source() {
    let (tmp, engine) = device();
    let source = tmp.path().join("drop.so");
    fs::write(&source, "ELF").unwrap();
    engine.add_global_payload(&source, true).unwrap();
    assert!(!source.exists());
    assert!(engine.settings().stored_path_for("drop.so").is_file());
}

#[test]
fn removing_from_catalog_keeps_app_reference() {
    let (tmp, engine) = device();
    let stored = import(&tmp, &engine, "a.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();

    let removed = engine.remove_global_payload("a.so").unwrap();
    assert!(removed.value.delete.succeeded());
    assert!(!stored.exists());
    assert!(engine.payloads().is_empty());
    assert_eq!(engine.app_payloads(&pkg()).len(), 1);
}

#[test]
fn status_tracks_sandbox_drift() {
    let (tmp, engine) = device();
    assert_eq!(
        engine.status(&PackageName::from("com.unknown")).state,
        DriftState::Unconfigured
    );

    import(&tmp, &engine, "a.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();
    assert_eq!(engine.status(&pkg()).state, DriftState::Current);

    fs::remove_file(files_dir(&engine).join("a.so")).unwrap();
    assert_eq!(
        engine.status(&pkg()).state,
        DriftState::Drifted {
            missing: vec!["a.so".into()]
        }
    );

    engine.deploy_for_app(&pkg()).unwrap();
    engine.set_app_enabled(&pkg(), false).unwrap();
    assert_eq!(
        engine.status(&pkg()).state,
        DriftState::Disabled { leftovers: vec![] }
    );
    assert_eq!(engine.status_all().len(), 1);
}

#[test]
fn global_gadget_change_redeploys_followers() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();

    let outcome = engine.set_global_gadget(Some(GadgetConfig::default()));
    assert_eq!(outcome.reconciliations.len(), 1);
    assert!(present(&files_dir(&engine), "libgadget.config.so"));

    engine.set_global_gadget(None);
    assert!(!present(&files_dir(&engine), "libgadget.config.so"));
}

#[test]
fn deploy_all_reports_every_enabled_package() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    let second = PackageName::from("com.example.second");
    fs::create_dir_all(engine.settings().package_data_dir(&second)).unwrap();

    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    engine.set_app_enabled(&pkg(), true).unwrap();
    engine.set_app_enabled(&second, true).unwrap();

    let results = engine.deploy_all_enabled();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].package(), &second);
    assert!(matches!(results[0], Reconciliation::Skipped { .. }));
    assert!(matches!(results[1], Reconciliation::Deployed(_)));
}

#[test]
fn empty_package_is_rejected() {
    let (_tmp, engine) = device();
    let err = engine.deploy_for_app(&PackageName::from("")).unwrap_err();
    assert!(matches!(err, SyncError::EmptyPackage));
}

#[test]
fn deploy_follows_edits_saved_by_another_process() {
    let (tmp, cli) = device();
    let daemon = other_process(&cli);

    import(&tmp, &cli, "a.so");
    cli.add_payload_to_app(&pkg(), "a.so").unwrap();

    let report = daemon.deploy_for_app(&pkg()).unwrap();
    assert_eq!(report.deployed_names(), vec!["a.so"]);
    assert!(present(&files_dir(&daemon), "a.so"));
}

#[test]
fn writers_in_two_processes_keep_each_others_edits() {
    let (_tmp, cli) = device();
    let daemon = other_process(&cli);

    cli.set_app_enabled(&pkg(), true).unwrap();
    daemon.set_injection_delay(9);
    cli.set_hide_injection(true);

    let fresh = other_process(&cli).document();
    assert!(fresh.is_app_enabled(&pkg()));
    assert_eq!(fresh.injection_delay, 9);
    assert!(fresh.hide_injection);
    assert_eq!(daemon.document(), fresh);
}

#[test]
fn importing_a_file_already_in_storage_keeps_its_bytes() {
    let (_tmp, engine) = device();
    let stored = engine.settings().stored_path_for("x.so");
    fs::write(&stored, "ELF-payload").unwrap();

    let added = engine.add_global_payload(&stored, true).unwrap();

    assert_eq!(fs::read_to_string(&stored).unwrap(), "ELF-payload");
    assert_eq!(added.value.stored_path.0, stored.to_string_lossy());
    assert_eq!(engine.payloads().len(), 1);
}

#[test]
fn gadget_name_cannot_reach_outside_the_files_dir() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");
    engine.add_payload_to_app(&pkg(), "a.so").unwrap();
    let outside = engine.settings().package_data_dir(&pkg()).join("x.config.so");
    fs::write(&outside, "app owned").unwrap();
    let escaping = GadgetConfig {
        gadget_name: "../x.so".into(),
        ..GadgetConfig::default()
    };

    engine.set_app_gadget(&pkg(), Some(escaping)).unwrap();
    let deployed = engine.set_app_enabled(&pkg(), true).unwrap();
    let Reconciliation::Deployed(report) = &deployed.reconciliations[0] else {
        panic!("expected a deployment, got {:?}", deployed.reconciliations[0]);
    };
    assert!(report.gadget.as_ref().is_some_and(|g| g.copy.is_failed()));

    let cleaned = engine.set_app_enabled(&pkg(), false).unwrap();
    let Reconciliation::Cleaned(report) = &cleaned.reconciliations[0] else {
        panic!("expected cleanup, got {:?}", cleaned.reconciliations[0]);
    };
    assert_eq!(report.removed_names(), vec!["a.so"]);
    assert!(report.gadget.as_ref().is_some_and(|g| !g.outcome.succeeded()));
    assert_eq!(fs::read_to_string(&outside).unwrap(), "app owned");
}

#[test]
fn hide_list_file_always_keeps_the_injector() {
    let (tmp, engine) = device();
    import(&tmp, &engine, "a.so");

    let mut list = HideList::new(ListFileModule::open(&engine));
    assert!(list.ensure_self_hidden().unwrap());
    list.hide("a.so").unwrap();
    let err = list.unhide(SELF_LIBRARY).unwrap_err();
    assert!(matches!(err, SyncError::ProtectedHiddenItem { .. }));

    let text = fs::read_to_string(ListFileModule::path(&engine)).unwrap();
    assert_eq!(text, format!("{SELF_LIBRARY}\na.so\n"));

    let reopened = HideList::new(ListFileModule::open(&engine));
    let entries = reopened.entries().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.so", SELF_LIBRARY]);
    assert!(entries.iter().all(|e| e.hidden));

    assert!(!reopened.is_loaded());
    engine.set_hide_injection(true);
    assert!(reopened.is_loaded());
}
