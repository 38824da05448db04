//! Full daemon over a real Unix socket in a temp tree.

use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use myinjector_core::{EngineSettings, PackageName, RootShell};
use myinjector_daemon::paths::socket_path;
use myinjector_daemon::{
    request_apply, request_deploy, request_status, request_stop, run_with_engine, DaemonError,
};
use myinjector_sync::{ApplyRequest, Engine};
use tempfile::TempDir;
use tokio::task::{spawn_blocking, JoinHandle};

const PKG: &str = "com.example.target";

fn current_uid() -> u32 {
    let out = Command::new("id").arg("-u").output().unwrap();
    String::from_utf8(out.stdout).unwrap().trim().parse().unwrap()
}

fn settings(tmp: &TempDir, trusted: Vec<u32>) -> EngineSettings {
    EngineSettings {
        trusted_uids: trusted,
        ..EngineSettings::rooted_at(tmp.path())
    }
}

async fn start(settings: EngineSettings) -> JoinHandle<Result<(), DaemonError>> {
    let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
    let engine = Arc::new(Engine::open(settings.clone(), Arc::new(shell)));
    let handle = tokio::spawn(run_with_engine(engine));

    let socket = socket_path(&settings);
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(socket.exists(), "daemon socket never appeared");
    handle
}

/// One enabled package with a payload, written straight into the tree.
fn seed(settings: &EngineSettings) {
    let shell = RootShell::direct(Duration::from_secs(10)).assume_privileged();
    let engine = Engine::open(settings.clone(), Arc::new(shell));
    engine.ensure_module_directories().unwrap();
    fs::create_dir_all(settings.package_data_dir(&PackageName::from(PKG))).unwrap();
    let source = settings.module_dir.join("a.so");
    fs::write(&source, "ELF").unwrap();
    engine.add_global_payload(&source, true).unwrap();
    engine.add_payload_to_app(&PackageName::from(PKG), "a.so").unwrap();
    engine.set_app_enabled(&PackageName::from(PKG), true).unwrap();
    fs::remove_dir_all(settings.files_dir(&PackageName::from(PKG))).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trusted_client_drives_the_engine() {
    let tmp = TempDir::new().unwrap();
    let settings = settings(&tmp, vec![current_uid()]);
    seed(&settings);
    let daemon = start(settings.clone()).await;

    let s = settings.clone();
    let status = spawn_blocking(move || request_status(&s)).await.unwrap().unwrap();
    assert_eq!(status["running"], serde_json::json!(true));
    assert_eq!(status["packages"].as_array().unwrap().len(), 1);

    let s = settings.clone();
    let deployed = spawn_blocking(move || request_deploy(&s, Some(PKG.to_string())))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployed["job"], serde_json::json!(format!("deploy {PKG}")));
    assert!(settings.files_dir(&PackageName::from(PKG)).join("a.so").is_file());

    let staged = tmp.path().join("libgadget.config.so");
    fs::write(&staged, "{}").unwrap();
    let s = settings.clone();
    let request = ApplyRequest {
        package: PKG.into(),
        gadget_config_path: Some(staged.clone()),
        deploy_only: true,
        ..ApplyRequest::default()
    };
    let applied = spawn_blocking(move || request_apply(&s, request))
        .await
        .unwrap()
        .unwrap();
    assert!(applied["report"]["deployment"].is_null());
    assert!(!staged.exists());
    assert!(settings
        .files_dir(&PackageName::from(PKG))
        .join("libgadget.config.so")
        .is_file());

    let s = settings.clone();
    let bad = spawn_blocking(move || request_deploy(&s, Some("../etc".into())))
        .await
        .unwrap();
    assert!(matches!(bad, Err(DaemonError::Protocol(_))));

    let s = settings.clone();
    spawn_blocking(move || request_stop(&s)).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
    assert!(!socket_path(&settings).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untrusted_peer_gets_no_response() {
    let tmp = TempDir::new().unwrap();
    let settings = settings(&tmp, vec![current_uid().wrapping_add(1)]);
    let daemon = start(settings.clone()).await;

    let s = settings.clone();
    let err = spawn_blocking(move || request_status(&s))
        .await
        .unwrap()
        .unwrap_err();
    // Depending on timing the close shows up on write or on read.
    assert!(matches!(
        err,
        DaemonError::Protocol(_) | DaemonError::Io { .. }
    ));

    daemon.abort();
}
