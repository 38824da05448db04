use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use myinjector_core::{EngineSettings, PackageName};
use myinjector_sync::{apply_remote, authorize, ApplyRequest, Engine};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::protocol::{DaemonRequest, DaemonResponse};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Job {
    Apply(ApplyRequest),
    Deploy(Option<PackageName>),
}

impl Job {
    fn label(&self) -> String {
        match self {
            Job::Apply(request) => format!("apply {}", request.package),
            Job::Deploy(Some(package)) => format!("deploy {package}"),
            Job::Deploy(None) => "deploy all".to_string(),
        }
    }
}

struct EngineJob {
    job: Job,
    source: &'static str,
    respond_to: oneshot::Sender<Result<JobSummary, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub source: String,
    pub duration_ms: u128,
    pub report: Value,
}

/// Counters shown by `status`.
#[derive(Debug, Clone, Default)]
struct JobStats {
    processed: u64,
    failed: u64,
    last_job_at_unix: u64,
}

type SharedStats = Arc<RwLock<JobStats>>;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Start the daemon and block the current thread until it exits.
pub fn start_blocking(settings: EngineSettings) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(settings))
}

/// Run with a root shell built from `settings`.
pub async fn run(settings: EngineSettings) -> Result<(), DaemonError> {
    let engine = tokio::task::spawn_blocking(move || Engine::from_settings(settings))
        .await
        .map_err(|err| DaemonError::Protocol(format!("engine start join error: {err}")))?;
    run_with_engine(Arc::new(engine)).await
}

/// Run the socket server, job processor and log rotation around `engine`.
///
/// Every enabled package is deployed once at startup.
pub async fn run_with_engine(engine: Arc<Engine>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(engine.settings())?;
    let started_at_unix = unix_seconds_now();
    let stats: SharedStats = Arc::new(RwLock::new(JobStats::default()));

    let (job_tx, job_rx) = mpsc::channel::<EngineJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let stats = stats.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = job_processor_task(engine, stats, job_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let startup_handle = {
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            match enqueue(&job_tx, Job::Deploy(None), "startup").await {
                Ok(summary) => tracing::info!(
                    duration_ms = summary.duration_ms,
                    "startup deploy completed"
                ),
                Err(err) => tracing::error!(error = %err, "startup deploy failed"),
            }
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let stats = stats.clone();
        let job_tx = job_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(
                engine,
                stats,
                job_tx,
                shutdown.clone(),
                shutdown_rx,
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };
    drop(job_tx);

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let settings = engine.settings().clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = log_rotation_task(settings, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!(
        module_dir = %engine.settings().module_dir.display(),
        socket = %socket_path(engine.settings()).display(),
        "daemon started"
    );

    let (processor_result, socket_result, rotation_result, signal_result, _) = tokio::join!(
        processor_handle,
        socket_handle,
        rotation_handle,
        signal_handle,
        startup_handle
    );

    handle_join("job_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// The only place engine work runs; jobs execute one after another.
async fn job_processor_task(
    engine: Arc<Engine>,
    stats: SharedStats,
    mut job_rx: mpsc::Receiver<EngineJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let started = Instant::now();
                let label = job.job.label();
                tracing::info!(job = %label, source = job.source, "job started");

                let engine = engine.clone();
                let work = job.job.clone();
                let result = tokio::task::spawn_blocking(move || execute(&engine, work))
                    .await
                    .map_err(|err| DaemonError::Protocol(format!("job join error: {err}")))?;

                {
                    let mut stats = stats.write().await;
                    stats.processed += 1;
                    stats.last_job_at_unix = unix_seconds_now();
                    if result.is_err() {
                        stats.failed += 1;
                    }
                }

                let outcome = result
                    .map(|report| JobSummary {
                        job: label.clone(),
                        source: job.source.to_string(),
                        duration_ms: started.elapsed().as_millis(),
                        report,
                    })
                    .map_err(|err| {
                        tracing::error!(job = %label, error = %err, "job failed");
                        err.to_string()
                    });
                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(())
}

fn execute(engine: &Engine, job: Job) -> Result<Value, DaemonError> {
    engine.refresh();
    let report = match job {
        Job::Apply(request) => json!(apply_remote(engine, &request)?),
        Job::Deploy(Some(package)) => json!(engine.deploy_for_app(&package)?),
        Job::Deploy(None) => json!(engine.deploy_all_enabled()),
    };
    Ok(report)
}

async fn socket_server_task(
    engine: Arc<Engine>,
    stats: SharedStats,
    job_tx: mpsc::Sender<EngineJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(engine.settings());
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let engine = engine.clone();
                let stats = stats.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        engine,
                        stats,
                        job_tx,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    engine: Arc<Engine>,
    stats: SharedStats,
    job_tx: mpsc::Sender<EngineJob>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let uid = stream
        .peer_cred()
        .map_err(|e| io_err("daemon socket peer credentials", e))?
        .uid();
    if !authorize(uid, &engine.settings().trusted_uids) {
        tracing::warn!(uid, "dropping connection from untrusted peer");
        return Ok(());
    }

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };
        tracing::debug!(uid, cmd = request.name(), "request received");

        let stop = matches!(request, DaemonRequest::Stop);
        let response = match request {
            DaemonRequest::Status => {
                match build_status_payload(engine.clone(), stats.clone(), started_at_unix).await {
                    Ok(payload) => DaemonResponse::ok(payload),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            DaemonRequest::Apply(request) => {
                summary_response(enqueue(&job_tx, Job::Apply(request), "socket").await)
            }
            DaemonRequest::Deploy { package } => {
                let target = package
                    .map(|p| PackageName::parse(&p))
                    .transpose()
                    .map_err(|e| e.to_string());
                match target {
                    Ok(target) => {
                        summary_response(enqueue(&job_tx, Job::Deploy(target), "socket").await)
                    }
                    Err(err) => DaemonResponse::error(err),
                }
            }
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

fn summary_response(result: Result<JobSummary, DaemonError>) -> DaemonResponse {
    match result {
        Ok(summary) => DaemonResponse::ok(json!(summary)),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

async fn build_status_payload(
    engine: Arc<Engine>,
    stats: SharedStats,
    started_at_unix: u64,
) -> Result<Value, DaemonError> {
    let snapshot = stats.read().await.clone();
    let settings = engine.settings().clone();
    let packages = tokio::task::spawn_blocking(move || engine.status_all())
        .await
        .map_err(|err| DaemonError::Protocol(format!("status join error: {err}")))?;

    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": started_at_unix,
        "last_job_at_unix": snapshot.last_job_at_unix,
        "jobs_processed": snapshot.processed,
        "jobs_failed": snapshot.failed,
        "socket": socket_path(&settings).display().to_string(),
        "module_dir": settings.module_dir.display().to_string(),
        "packages": packages,
    }))
}

async fn enqueue(
    job_tx: &mpsc::Sender<EngineJob>,
    job: Job,
    source: &'static str,
) -> Result<JobSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(EngineJob {
            job,
            source,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("job queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("job response"))?;
    outcome.map_err(DaemonError::Protocol)
}

async fn log_rotation_task(
    settings: EngineSettings,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let settings = settings.clone();
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&settings);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(settings: &EngineSettings) -> Result<(), DaemonError> {
    for dir in [settings.run_dir(), settings.log_dir()] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Any local UID may connect; peers are authorized by credentials.
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use myinjector_core::RootShell;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> Arc<Engine> {
        let settings = EngineSettings::rooted_at(tmp.path());
        let shell = RootShell::direct(Duration::from_secs(5)).assume_privileged();
        Arc::new(Engine::open(settings, Arc::new(shell)))
    }

    #[test]
    fn job_labels() {
        assert_eq!(Job::Deploy(None).label(), "deploy all");
        assert_eq!(
            Job::Deploy(Some(PackageName::from("com.x"))).label(),
            "deploy com.x"
        );
        let apply = Job::Apply(ApplyRequest {
            package: "com.y".into(),
            ..ApplyRequest::default()
        });
        assert_eq!(apply.label(), "apply com.y");
    }

    #[tokio::test]
    async fn status_payload_before_any_job() {
        let tmp = TempDir::new().unwrap();
        let stats: SharedStats = Arc::new(RwLock::new(JobStats::default()));

        let payload = build_status_payload(engine(&tmp), stats, 1_000_000)
            .await
            .unwrap();

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["last_job_at_unix"], json!(0u64));
        assert_eq!(payload["jobs_processed"], json!(0u64));
        assert!(payload["packages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn processor_runs_jobs_and_counts_failures() {
        let tmp = TempDir::new().unwrap();
        let stats: SharedStats = Arc::new(RwLock::new(JobStats::default()));
        let (job_tx, job_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);

        let processor = tokio::spawn(job_processor_task(
            engine(&tmp),
            stats.clone(),
            job_rx,
            shutdown_tx.subscribe(),
        ));

        let all = enqueue(&job_tx, Job::Deploy(None), "test").await.unwrap();
        assert_eq!(all.job, "deploy all");
        assert_eq!(all.report, json!([]));

        let missing = enqueue(
            &job_tx,
            Job::Deploy(Some(PackageName::from("com.none"))),
            "test",
        )
        .await
        .unwrap_err();
        assert!(missing.to_string().contains("no payloads selected"));

        let snapshot = stats.read().await.clone();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.failed, 1);
        assert!(snapshot.last_job_at_unix > 0);

        let _ = shutdown_tx.send(());
        processor.await.unwrap().unwrap();
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("stale.sock");
        fs::write(&socket, "").unwrap();
        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }
}
