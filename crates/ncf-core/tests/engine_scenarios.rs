//! End-to-end engine scenarios: scripted terminal, real HTTP exporter and
//! repository client against in-process doubles, in-memory store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use serde_json::{json, Value};

use ncf_auth::Sealer;
use ncf_core::api::{ApiTarget, ConfigExporter, HttpExporter};
use ncf_core::cli::{CliTarget, TerminalClient};
use ncf_core::device::DeviceFacts;
use ncf_core::progress::{JobState, ProgressBus, ProgressEvent};
use ncf_core::resolver::CredentialResolver;
use ncf_core::store::{JobStore, NewResult, ResultState, StoreError};
use ncf_core::{BackupEngine, CancelToken, DeviceError, EngineConfig, Platform};
use ncf_git::RepoClient;

// ── In-memory store ───────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Debug)]
struct JobRow {
    total: i64,
    completed: i64,
    failed: i64,
    state: JobState,
    started: bool,
    finalized: bool,
}

#[derive(Default)]
struct MemoryState {
    facts: Vec<DeviceFacts>,
    jobs: HashMap<i64, JobRow>,
    results: Vec<NewResult>,
    fail_loads: bool,
}

#[derive(Clone, Default)]
struct MemoryStore(Arc<Mutex<MemoryState>>);

impl MemoryStore {
    fn add_device(&self, facts: DeviceFacts) {
        self.0.lock().unwrap().facts.push(facts);
    }

    fn add_job(&self, job_id: i64, total: i64) {
        self.0.lock().unwrap().jobs.insert(
            job_id,
            JobRow {
                total,
                completed: 0,
                failed: 0,
                state: JobState::Running,
                started: false,
                finalized: false,
            },
        );
    }

    fn job(&self, job_id: i64) -> JobRow {
        self.0.lock().unwrap().jobs[&job_id]
    }

    fn results(&self) -> Vec<NewResult> {
        self.0.lock().unwrap().results.clone()
    }

    fn fail_loads(&self) {
        self.0.lock().unwrap().fail_loads = true;
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn load_device_facts(
        &self,
        device_ids: &[i64],
    ) -> Result<Vec<DeviceFacts>, StoreError> {
        let state = self.0.lock().unwrap();
        if state.fail_loads {
            return Err(StoreError("database unavailable".to_string()));
        }
        Ok(state
            .facts
            .iter()
            .filter(|f| device_ids.contains(&f.device_id))
            .cloned()
            .collect())
    }

    async fn mark_job_started(&self, job_id: i64) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError("no such job".to_string()))?;
        job.started = true;
        Ok(())
    }

    async fn job_total(&self, job_id: i64) -> Result<i64, StoreError> {
        self.0
            .lock()
            .unwrap()
            .jobs
            .get(&job_id)
            .map(|j| j.total)
            .ok_or_else(|| StoreError("no such job".to_string()))
    }

    async fn insert_result(&self, result: NewResult) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        let duplicate = state
            .results
            .iter()
            .any(|r| r.job_id == result.job_id && r.device_id == result.device_id);
        if duplicate {
            return Err(StoreError("duplicate (job, device) result".to_string()));
        }
        state.results.push(result);
        Ok(())
    }

    async fn add_completed(&self, job_id: i64) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.completed += 1;
        }
        Ok(())
    }

    async fn add_failed(&self, job_id: i64) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.failed += 1;
        }
        Ok(())
    }

    async fn latest_success(
        &self,
        device_id: i64,
    ) -> Result<Option<(String, String)>, StoreError> {
        let state = self.0.lock().unwrap();
        Ok(state
            .results
            .iter()
            .rev()
            .find(|r| r.device_id == device_id && r.state == ResultState::Success)
            .map(|r| (r.content_hash.clone(), r.commit_id.clone().unwrap_or_default())))
    }

    async fn finalize_job(&self, job_id: i64, state: JobState) -> Result<(), StoreError> {
        let mut guard = self.0.lock().unwrap();
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            job.state = state;
            job.finalized = true;
        }
        Ok(())
    }
}

// ── Scripted transports ───────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedTerminal {
    outputs: HashMap<String, Result<String, DeviceError>>,
    delay: Option<Duration>,
}

impl ScriptedTerminal {
    fn device(mut self, hostname: &str, result: Result<&str, DeviceError>) -> Self {
        self.outputs
            .insert(hostname.to_string(), result.map(String::from));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl TerminalClient for ScriptedTerminal {
    async fn fetch_running_config(&self, target: &CliTarget) -> Result<String, DeviceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outputs
            .get(&target.facts.hostname)
            .cloned()
            .unwrap_or_else(|| Ok(format!("hostname {}\n", target.facts.hostname)))
    }
}

#[derive(Default)]
struct ScriptedExporter {
    outputs: HashMap<String, Result<String, DeviceError>>,
}

impl ScriptedExporter {
    fn device(mut self, hostname: &str, result: Result<&str, DeviceError>) -> Self {
        self.outputs
            .insert(hostname.to_string(), result.map(String::from));
        self
    }
}

#[async_trait]
impl ConfigExporter for ScriptedExporter {
    async fn export_config(&self, target: &ApiTarget) -> Result<String, DeviceError> {
        self.outputs
            .get(&target.facts.hostname)
            .cloned()
            .unwrap_or_else(|| Ok("<config/>\n".to_string()))
    }
}

// ── Repository-service double ─────────────────────────────────────────────

#[derive(Default)]
struct RepoServiceState {
    repos: Vec<String>,
    repo_creates: u64,
    files: HashMap<(String, String), Vec<(String, Vec<u8>)>>,
    seq: u64,
}

type RepoShared = Arc<Mutex<RepoServiceState>>;

async fn start_repo_double() -> (SocketAddr, RepoShared) {
    let state: RepoShared = Arc::default();

    async fn repo_exists(
        State(s): State<RepoShared>,
        Path((_, repo)): Path<(String, String)>,
    ) -> StatusCode {
        if s.lock().unwrap().repos.contains(&repo) {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn create_repo(
        State(s): State<RepoShared>,
        Path(_org): Path<String>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        let mut s = s.lock().unwrap();
        s.repo_creates += 1;
        if s.repos.contains(&name) {
            return StatusCode::CONFLICT;
        }
        s.repos.push(name);
        StatusCode::CREATED
    }

    async fn get_contents(
        State(s): State<RepoShared>,
        Path((_, repo, path)): Path<(String, String, String)>,
    ) -> impl IntoResponse {
        let s = s.lock().unwrap();
        match s.files.get(&(repo, path)).and_then(|revs| revs.last()) {
            Some((sha, bytes)) => (
                StatusCode::OK,
                Json(json!({ "sha": sha, "content": B64_STD.encode(bytes) })),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn put_contents(
        State(s): State<RepoShared>,
        Path((_, repo, path)): Path<(String, String, String)>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let mut s = s.lock().unwrap();
        let key = (repo, path);
        let current = s
            .files
            .get(&key)
            .and_then(|revs| revs.last())
            .map(|(sha, _)| sha.clone());
        if body.get("sha").and_then(Value::as_str).map(String::from) != current {
            return StatusCode::CONFLICT.into_response();
        }
        let bytes = B64_STD
            .decode(body["content"].as_str().unwrap_or_default())
            .expect("client sends well-formed base64");
        s.seq += 1;
        let sha = format!("sha-{}", s.seq);
        s.files.entry(key).or_default().push((sha.clone(), bytes));
        (StatusCode::CREATED, Json(json!({ "commit": { "sha": sha } }))).into_response()
    }

    let app = Router::new()
        .route("/repos/:org/:repo", get(repo_exists))
        .route("/orgs/:org", get(|| async { StatusCode::OK }))
        .route("/orgs/:org/repos", post(create_repo))
        .route("/repos/:org/:repo/contents/:path", get(get_contents))
        .route("/repos/:org/:repo/contents/:path", put(put_contents))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, state)
}

// ── Harness ───────────────────────────────────────────────────────────────

fn facts(id: i64, hostname: &str, platform: Platform) -> DeviceFacts {
    DeviceFacts {
        device_id: id,
        hostname: hostname.to_string(),
        address: format!("10.0.0.{id}"),
        platform,
        site_code: "nyc".to_string(),
        repo_name: "nyc-configs".to_string(),
        cred_username: None,
        sealed_password: None,
        tls_verify: None,
    }
}

struct Harness {
    store: MemoryStore,
    bus: ProgressBus,
    engine: BackupEngine,
    repo_state: RepoShared,
}

async fn harness(
    terminal: ScriptedTerminal,
    exporter: Arc<dyn ConfigExporter>,
) -> Harness {
    let (addr, repo_state) = start_repo_double().await;
    let store = MemoryStore::default();
    let bus = ProgressBus::new(Duration::from_secs(30));
    let resolver = CredentialResolver::new(
        Sealer::new(&Sealer::generate_key()).unwrap(),
        Some(("netops".to_string(), "fallback-pw".to_string())),
    );
    let engine = BackupEngine::new(
        Arc::new(store.clone()),
        RepoClient::new(&format!("http://{addr}"), "token").unwrap(),
        bus.clone(),
        resolver,
        Arc::new(terminal),
        exporter,
        EngineConfig {
            org: "ncf".to_string(),
            cli_workers: 5,
            api_workers: 5,
            always_commit: true,
        },
    );
    Harness {
        store,
        bus,
        engine,
        repo_state,
    }
}

fn committed_text(state: &RepoShared, repo: &str, path: &str) -> String {
    let state = state.lock().unwrap();
    let revs = &state.files[&(repo.to_string(), path.to_string())];
    String::from_utf8(revs.last().unwrap().1.clone()).unwrap()
}

// ── Scenarios ─────────────────────────────────────────────────────────────

const IOS_RAW: &str = "! Last configuration change at 12:00:01 EST Mon Jan 1 2024 by admin\n\
hostname core-1\n\
core-1 uptime is 42 weeks, 1 day\n\
interface Loopback0\n";

#[tokio::test]
async fn ios_happy_path_commits_scrubbed_config() {
    let h = harness(
        ScriptedTerminal::default().device("core-1", Ok(IOS_RAW)),
        Arc::new(ScriptedExporter::default()),
    )
    .await;
    h.store.add_device(facts(1, "core-1", Platform::Ios));
    h.store.add_job(100, 1);

    h.engine
        .run_job(100, vec![1], CancelToken::new())
        .await
        .unwrap();

    let job = h.store.job(100);
    assert_eq!(job.state, JobState::Complete);
    assert_eq!((job.completed, job.failed), (1, 0));

    let results = h.store.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, ResultState::Success);
    assert_eq!(results[0].content_hash.len(), 64);
    assert!(results[0].commit_id.as_deref().is_some_and(|c| !c.is_empty()));

    let text = committed_text(&h.repo_state, "nyc-configs", "core-1.txt");
    assert!(text.starts_with("! Last configuration change at <timestamp>"));
    assert!(text.contains("uptime is <uptime>"));
    assert!(!text.contains("42 weeks"));

    // Re-running against an unchanged device produces the same hash.
    let first_hash = results[0].content_hash.clone();
    h.store.add_job(101, 1);
    h.engine
        .run_job(101, vec![1], CancelToken::new())
        .await
        .unwrap();
    let second = h
        .store
        .results()
        .into_iter()
        .find(|r| r.job_id == 101)
        .unwrap();
    assert_eq!(second.content_hash, first_hash);

    // Unchanged config still commits: the history records "we checked".
    let state = h.repo_state.lock().unwrap();
    let revisions = &state.files[&("nyc-configs".to_string(), "core-1.txt".to_string())];
    assert_eq!(revisions.len(), 2);
}

#[tokio::test]
async fn panos_auth_failure_fails_device_but_completes_job() {
    // Real exporter against a keygen endpoint that refuses the credentials.
    let app = Router::new().route("/api/", get(|| async { StatusCode::FORBIDDEN }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fw_addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let exporter = HttpExporter::new(Duration::from_secs(10), false)
        .unwrap()
        .with_scheme("http");
    let h = harness(ScriptedTerminal::default(), Arc::new(exporter)).await;

    let mut fw = facts(1, "fw-1", Platform::Panos);
    fw.address = fw_addr.to_string();
    h.store.add_device(fw);
    h.store.add_job(200, 1);

    h.engine
        .run_job(200, vec![1], CancelToken::new())
        .await
        .unwrap();

    let job = h.store.job(200);
    assert_eq!(job.state, JobState::Complete);
    assert_eq!((job.completed, job.failed), (0, 1));

    let results = h.store.results();
    assert_eq!(results[0].state, ResultState::Failed);
    assert!(results[0]
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("auth_rejected")));
}

#[tokio::test]
async fn mixed_job_counts_and_progress_stream() {
    let terminal = ScriptedTerminal::default()
        .device("core-1", Ok("hostname core-1\n"))
        .device("core-2", Ok("hostname core-2\n"))
        .device(
            "core-3",
            Err(DeviceError::Unreachable("connect refused".to_string())),
        );
    let exporter = ScriptedExporter::default()
        .device("fw-1", Ok("<config>fw-1</config>\n"))
        .device("fw-2", Ok("<config>fw-2</config>\n"));
    let h = harness(terminal, Arc::new(exporter)).await;

    for (id, hostname, platform) in [
        (1, "core-1", Platform::Ios),
        (2, "core-2", Platform::Ios),
        (3, "core-3", Platform::Ios),
        (4, "fw-1", Platform::Panos),
        (5, "fw-2", Platform::Panos),
    ] {
        h.store.add_device(facts(id, hostname, platform));
    }
    h.store.add_job(300, 5);

    let (_, mut rx) = h.bus.subscribe(300);
    let events = tokio::spawn(async move {
        let mut events: Vec<ProgressEvent> = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.state.is_terminal();
                    events.push(event);
                    if terminal {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        events
    });

    h.engine
        .run_job(300, (1..=5).collect(), CancelToken::new())
        .await
        .unwrap();

    let job = h.store.job(300);
    assert_eq!(job.state, JobState::Complete);
    assert_eq!((job.total, job.completed, job.failed), (5, 4, 1));

    let events = events.await.unwrap();
    let non_terminal = events.iter().filter(|e| !e.state.is_terminal()).count();
    assert!(non_terminal >= 5, "one event per device plus the initial");
    let last = events.last().unwrap();
    assert_eq!(last.state, JobState::Complete);
    assert_eq!((last.completed, last.failed, last.total), (4, 1, 5));
}

#[tokio::test]
async fn repo_is_created_once_per_site_per_job() {
    let terminal = ScriptedTerminal::default()
        .device("core-1", Ok("hostname core-1\n"))
        .device("core-2", Ok("hostname core-2\n"));
    let h = harness(terminal, Arc::new(ScriptedExporter::default())).await;

    let mut a = facts(1, "core-1", Platform::Ios);
    let mut b = facts(2, "core-2", Platform::Ios);
    for f in [&mut a, &mut b] {
        f.site_code = "lon".to_string();
        f.repo_name = "lon-configs".to_string();
    }
    h.store.add_device(a);
    h.store.add_device(b);
    h.store.add_job(400, 2);

    h.engine
        .run_job(400, vec![1, 2], CancelToken::new())
        .await
        .unwrap();

    let state = h.repo_state.lock().unwrap();
    assert_eq!(state.repos, vec!["lon-configs".to_string()]);
    assert_eq!(state.repo_creates, 1, "second device reuses the memoized ensure");
    drop(state);

    for r in h.store.results() {
        assert_eq!(r.state, ResultState::Success);
        assert!(r.commit_id.as_deref().is_some_and(|c| !c.is_empty()));
    }
}

#[tokio::test]
async fn all_devices_failing_still_completes_the_job() {
    let terminal = ScriptedTerminal::default()
        .device("a", Err(DeviceError::Timeout("no response".to_string())))
        .device("b", Err(DeviceError::AuthRejected));
    let h = harness(terminal, Arc::new(ScriptedExporter::default())).await;
    h.store.add_device(facts(1, "a", Platform::Ios));
    h.store.add_device(facts(2, "b", Platform::Eos));
    h.store.add_job(500, 2);

    h.engine
        .run_job(500, vec![1, 2], CancelToken::new())
        .await
        .unwrap();

    let job = h.store.job(500);
    assert_eq!(job.state, JobState::Complete);
    assert_eq!((job.completed, job.failed), (0, 2));
}

#[tokio::test]
async fn cancellation_reaches_complete_with_full_accounting() {
    let terminal =
        ScriptedTerminal::default().with_delay(Duration::from_millis(10));
    let h = harness(terminal, Arc::new(ScriptedExporter::default())).await;

    for id in 1..=100 {
        h.store.add_device(facts(id, &format!("dev-{id}"), Platform::Ios));
    }
    h.store.add_job(600, 100);

    let cancel = CancelToken::new();
    let (_, mut rx) = h.bus.subscribe(600);
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let mut outcomes = 0;
        while let Ok(event) = rx.recv().await {
            if event.last_device.is_some() {
                outcomes += 1;
            }
            if outcomes >= 20 {
                trigger.cancel();
                break;
            }
        }
    });

    h.engine
        .run_job(600, (1..=100).collect(), cancel)
        .await
        .unwrap();

    let job = h.store.job(600);
    assert_eq!(job.state, JobState::Complete, "cancelled jobs complete, not fail");

    let results = h.store.results();
    assert_eq!(results.len(), 100, "every device has a terminal result");
    let skipped = results.iter().filter(|r| r.state == ResultState::Skipped).count() as i64;
    assert!(skipped > 0);
    assert_eq!(job.completed + job.failed + skipped, 100);
}

#[tokio::test]
async fn inventory_load_failure_is_fatal() {
    let h = harness(
        ScriptedTerminal::default(),
        Arc::new(ScriptedExporter::default()),
    )
    .await;
    h.store.add_job(700, 3);
    h.store.fail_loads();

    let (_, mut rx) = h.bus.subscribe(700);
    let err = h
        .engine
        .run_job(700, vec![1, 2, 3], CancelToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("fatal"));
    assert_eq!(h.store.job(700).state, JobState::Failed);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.state, JobState::Failed);
}

#[tokio::test]
async fn unresolvable_devices_fail_before_any_connection() {
    let h = harness(
        ScriptedTerminal::default(),
        Arc::new(ScriptedExporter::default()),
    )
    .await;
    // Build a resolver-visible gap: no credential set and no fallback.
    let resolver = CredentialResolver::new(Sealer::new(&Sealer::generate_key()).unwrap(), None);
    let engine = BackupEngine::new(
        Arc::new(h.store.clone()),
        RepoClient::new("http://127.0.0.1:9", "token").unwrap(),
        h.bus.clone(),
        resolver,
        Arc::new(ScriptedTerminal::default()),
        Arc::new(ScriptedExporter::default()),
        EngineConfig {
            org: "ncf".to_string(),
            cli_workers: 5,
            api_workers: 5,
            always_commit: true,
        },
    );

    h.store.add_device(facts(1, "core-1", Platform::Ios));
    h.store.add_job(800, 1);
    engine.run_job(800, vec![1], CancelToken::new()).await.unwrap();

    let results = h.store.results();
    assert_eq!(results[0].state, ResultState::Failed);
    assert!(results[0]
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("no_credentials")));
    assert_eq!(h.store.job(800).state, JobState::Complete);
}

#[tokio::test]
async fn no_result_or_event_carries_the_fallback_password() {
    let terminal = ScriptedTerminal::default()
        .device("core-1", Err(DeviceError::AuthRejected));
    let h = harness(terminal, Arc::new(ScriptedExporter::default())).await;
    h.store.add_device(facts(1, "core-1", Platform::Ios));
    h.store.add_job(900, 1);

    let (_, mut rx) = h.bus.subscribe(900);
    h.engine
        .run_job(900, vec![1], CancelToken::new())
        .await
        .unwrap();

    for r in h.store.results() {
        if let Some(e) = &r.error {
            assert!(!e.contains("fallback-pw"));
        }
    }
    while let Ok(event) = rx.try_recv() {
        let rendered = serde_json::to_string(&event).unwrap();
        assert!(!rendered.contains("fallback-pw"));
    }
}
