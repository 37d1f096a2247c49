//! End-to-end tests: the whole worker against an in-process stub of the
//! lock service, the notification endpoint and a job source.
//!
//! The JVM is replaced by `/bin/sh -c <script>`, so these tests need a
//! Unix shell but no Java installation.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tempfile::TempDir;

use iped_worker::config::{ToolConfig, WorkerConfig};
use iped_worker::events::{Event, EventType};
use iped_worker::Job;

#[derive(Clone, Default)]
struct Hub {
    /// `(endpoint, event)` in arrival order.
    received: Arc<Mutex<Vec<(String, Event)>>>,
    reject: Arc<Mutex<Option<EventType>>>,
    jobs: Arc<Mutex<String>>,
}

impl Hub {
    fn types(&self) -> Vec<EventType> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.event_type)
            .collect()
    }

    fn endpoint_of(&self, event_type: EventType) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.event_type == event_type)
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    fn find(&self, event_type: EventType) -> Option<Event> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .find(|(_, e)| e.event_type == event_type)
            .map(|(_, e)| e.clone())
    }
}

async fn record(
    State(hub): State<Hub>,
    UrlPath(endpoint): UrlPath<String>,
    Json(event): Json<Event>,
) -> StatusCode {
    let rejected = *hub.reject.lock().unwrap() == Some(event.event_type);
    hub.received.lock().unwrap().push((endpoint, event));
    if rejected {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn pending_jobs(State(hub): State<Hub>) -> String {
    std::mem::replace(&mut *hub.jobs.lock().unwrap(), "[]".to_string())
}

/// Starts the stub and returns its base URL.
async fn start_hub(hub: Hub) -> String {
    let app = Router::new()
        .route("/jobs", get(pending_jobs))
        .route("/{endpoint}", post(record))
        .with_state(hub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

fn worker_config(base: &str, script: &str) -> WorkerConfig {
    let tool = ToolConfig::new("/opt/iped/iped.jar")
        .with_java("/bin/sh")
        .with_jvm_option("-c")
        .with_jvm_option(script)
        .with_jvm_option("fake-java")
        .with_hostname("pipeline-host");
    WorkerConfig::new(tool, format!("{}/lock", base), format!("{}/notify", base)).with_port(0)
}

fn evidence(tmp: &Path) -> String {
    let path = tmp.join("case1");
    fs::create_dir_all(&path).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_single_job_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let hub = Hub::default();
    let base = start_hub(hub.clone()).await;
    let job = Job::new(evidence(tmp.path())).with_output("OUT");
    let config = worker_config(
        &base,
        "echo \"2020-04-24 [MSG] Processando 2153/3591 (7%) 23GB/h\"\nexit 0",
    )
    .with_job(job);

    iped_worker::cli::run_worker(config).await.unwrap();

    assert_eq!(
        hub.types(),
        vec![
            EventType::Lock,
            EventType::Running,
            EventType::Progress,
            EventType::Done,
            EventType::Unlock
        ]
    );
    assert_eq!(hub.endpoint_of(EventType::Lock), vec!["lock"]);
    assert_eq!(hub.endpoint_of(EventType::Unlock), vec!["lock"]);
    assert_eq!(hub.endpoint_of(EventType::Done), vec!["notify"]);

    let progress = hub.find(EventType::Progress).unwrap();
    assert!(progress.progress_text().unwrap().contains("Processando 2153/3591"));

    let out = tmp.path().join("OUT");
    let mode = fs::metadata(&out).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);

    let log = fs::read_to_string(out.join("IPED.log")).unwrap();
    assert!(log.lines().next().unwrap().contains("pipeline-host"));
    assert!(log.contains("Processando 2153/3591"));
}

#[tokio::test]
async fn test_failing_tool_reports_failed_and_unlocks() {
    let tmp = TempDir::new().unwrap();
    let hub = Hub::default();
    let base = start_hub(hub.clone()).await;
    let job = Job::new(evidence(tmp.path())).with_output("OUT");
    let config = worker_config(&base, "echo boom 1>&2\nexit 1").with_job(job);

    let err = iped_worker::cli::run_worker(config).await.unwrap_err();

    assert!(format!("{:#}", err).contains("Execution error"));
    assert_eq!(
        hub.types(),
        vec![
            EventType::Lock,
            EventType::Running,
            EventType::Failed,
            EventType::Unlock
        ]
    );
    let failed = hub.find(EventType::Failed).unwrap();
    assert!(failed.progress_text().is_some());
}

#[tokio::test]
async fn test_rejected_lock_runs_nothing() {
    let tmp = TempDir::new().unwrap();
    let hub = Hub::default();
    *hub.reject.lock().unwrap() = Some(EventType::Lock);
    let base = start_hub(hub.clone()).await;
    let job = Job::new(evidence(tmp.path())).with_output("OUT");
    let config = worker_config(&base, "exit 0").with_job(job);

    let err = iped_worker::cli::run_worker(config).await.unwrap_err();

    assert!(format!("{:#}", err).contains("Lock error"));
    assert_eq!(hub.types(), vec![EventType::Lock]);
    assert!(!tmp.path().join("OUT").exists());
}

#[tokio::test]
async fn test_watch_runs_fetched_batch_and_relocates() {
    let tmp = TempDir::new().unwrap();
    let hub = Hub::default();
    let dest = tmp.path().join("archive").join("case1");
    let job = Job::new(evidence(tmp.path()))
        .with_output("OUT")
        .with_relocate_path(dest.to_string_lossy());
    *hub.jobs.lock().unwrap() = serde_json::to_string(&vec![job]).unwrap();
    let base = start_hub(hub.clone()).await;
    let config = worker_config(&base, "exit 0").with_watch_url(format!("{}/jobs", base));

    iped_worker::cli::run_worker(config).await.unwrap();

    assert_eq!(
        hub.types(),
        vec![
            EventType::Lock,
            EventType::Running,
            EventType::Done,
            EventType::Unlock
        ]
    );
    assert!(dest.join("IPED.log").exists());
    assert!(!tmp.path().join("OUT").exists());
}
