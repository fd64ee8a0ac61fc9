//! Wire-level tests for `RepoClient` against an in-process service double.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use serde_json::{json, Value};

use ncf_git::RepoClient;

#[derive(Default)]
struct FileState {
    // (commit sha, blob sha, bytes), newest last
    revisions: Vec<(String, String, Vec<u8>)>,
}

#[derive(Default)]
struct ServiceState {
    orgs: Vec<String>,
    repos: Vec<(String, String)>,
    files: HashMap<(String, String, String), FileState>,
    seq: u64,
    repo_creates: u64,
    conflict_next_put: bool,
}

type Shared = Arc<Mutex<ServiceState>>;

async fn get_repo(State(s): State<Shared>, Path((org, repo)): Path<(String, String)>) -> StatusCode {
    let s = s.lock().unwrap();
    if s.repos.contains(&(org, repo)) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_org(State(s): State<Shared>, Path(org): Path<String>) -> StatusCode {
    let s = s.lock().unwrap();
    if s.orgs.contains(&org) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn create_org(State(s): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    let name = body["username"].as_str().unwrap_or_default().to_string();
    let mut s = s.lock().unwrap();
    if s.orgs.contains(&name) {
        return StatusCode::CONFLICT;
    }
    s.orgs.push(name);
    StatusCode::CREATED
}

async fn create_repo(
    State(s): State<Shared>,
    Path(org): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let mut s = s.lock().unwrap();
    s.repo_creates += 1;
    if s.repos.contains(&(org.clone(), name.clone())) {
        return StatusCode::CONFLICT;
    }
    s.repos.push((org, name));
    StatusCode::CREATED
}

async fn get_contents(
    State(s): State<Shared>,
    Path((org, repo, path)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let s = s.lock().unwrap();
    match s.files.get(&(org, repo, path)).and_then(|f| f.revisions.last()) {
        Some((_, blob, bytes)) => (
            StatusCode::OK,
            Json(json!({ "sha": blob, "content": B64_STD.encode(bytes) })),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_contents(
    State(s): State<Shared>,
    Path((org, repo, path)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut s = s.lock().unwrap();
    if s.conflict_next_put {
        s.conflict_next_put = false;
        return StatusCode::CONFLICT.into_response();
    }
    let key = (org, repo, path);
    let current_blob = s
        .files
        .get(&key)
        .and_then(|f| f.revisions.last())
        .map(|(_, blob, _)| blob.clone());
    if body.get("sha").and_then(Value::as_str).map(String::from) != current_blob {
        return StatusCode::CONFLICT.into_response();
    }
    let bytes = B64_STD
        .decode(body["content"].as_str().unwrap_or_default())
        .expect("well-formed base64 from the client");
    s.seq += 1;
    let commit = format!("commit-{}", s.seq);
    let blob = format!("blob-{}", s.seq);
    s.files
        .entry(key)
        .or_default()
        .revisions
        .push((commit.clone(), blob, bytes));
    (StatusCode::CREATED, Json(json!({ "commit": { "sha": commit } }))).into_response()
}

async fn list_commits(
    State(s): State<Shared>,
    Path((org, repo)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let path = params.get("path").cloned().unwrap_or_default();
    let s = s.lock().unwrap();
    let shas: Vec<Value> = s
        .files
        .get(&(org, repo, path))
        .map(|f| {
            f.revisions
                .iter()
                .rev()
                .take(2)
                .map(|(commit, _, _)| json!({ "sha": commit }))
                .collect()
        })
        .unwrap_or_default();
    Json(Value::Array(shas))
}

async fn compare(
    State(s): State<Shared>,
    Path((org, repo, range)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let range = range.trim_end_matches(".diff");
    let (older, newer) = range.split_once("...").unwrap_or_default();
    let s = s.lock().unwrap();
    for ((o, r, path), file) in &s.files {
        if (o.as_str(), r.as_str()) != (org.as_str(), repo.as_str()) {
            continue;
        }
        let find = |sha: &str| {
            file.revisions
                .iter()
                .find(|(commit, _, _)| commit == sha)
                .map(|(_, _, bytes)| String::from_utf8_lossy(bytes).into_owned())
        };
        if let (Some(a), Some(b)) = (find(older), find(newer)) {
            return (StatusCode::OK, naive_diff(path, &a, &b)).into_response();
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

fn naive_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    for line in old.lines().filter(|l| !new.lines().any(|n| n == *l)) {
        out.push_str(&format!("-{line}\n"));
    }
    for line in new.lines().filter(|l| !old.lines().any(|o| o == *l)) {
        out.push_str(&format!("+{line}\n"));
    }
    out
}

async fn start_double() -> (SocketAddr, Shared) {
    let state: Shared = Arc::default();
    let app = Router::new()
        .route("/repos/:org/:repo", get(get_repo))
        .route("/orgs/:org", get(get_org))
        .route("/orgs", post(create_org))
        .route("/orgs/:org/repos", post(create_repo))
        .route("/repos/:org/:repo/contents/:path", get(get_contents))
        .route("/repos/:org/:repo/contents/:path", put(put_contents))
        .route("/repos/:org/:repo/commits", get(list_commits))
        .route("/repos/:org/:repo/compare/:range", get(compare))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, state)
}

fn client(addr: SocketAddr) -> RepoClient {
    RepoClient::new(&format!("http://{addr}"), "test-token").unwrap()
}

#[tokio::test]
async fn ensure_repo_creates_once_and_converges() {
    let (addr, state) = start_double().await;
    let client = client(addr);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = client.clone();
        handles.push(tokio::spawn(async move {
            c.ensure_repo("ncf", "nyc-configs", "nyc").await
        }));
    }
    for h in handles {
        h.await.unwrap().expect("every concurrent caller succeeds");
    }

    let s = state.lock().unwrap();
    assert_eq!(s.repos, vec![("ncf".to_string(), "nyc-configs".to_string())]);
    // Losing racers observed "exists" and treated it as success.
    assert!(s.repo_creates >= 1);
}

#[tokio::test]
async fn ensure_repo_is_a_noop_when_present() {
    let (addr, state) = start_double().await;
    state
        .lock()
        .unwrap()
        .repos
        .push(("ncf".to_string(), "lon-configs".to_string()));
    client(addr).ensure_repo("ncf", "lon-configs", "lon").await.unwrap();
    assert_eq!(state.lock().unwrap().repo_creates, 0);
}

#[tokio::test]
async fn commit_then_read_back_round_trips() {
    let (addr, state) = start_double().await;
    state
        .lock()
        .unwrap()
        .repos
        .push(("ncf".to_string(), "nyc-configs".to_string()));
    let client = client(addr);

    let text = "hostname core-1\ninterface Loopback0\n";
    let commit = client
        .commit_file("ncf", "nyc-configs", "core-1.txt", text, "backup job 1: core-1")
        .await
        .unwrap();
    assert!(!commit.is_empty());

    let bytes = client
        .read_file("ncf", "nyc-configs", "core-1.txt")
        .await
        .unwrap()
        .expect("file exists after commit");
    assert_eq!(bytes, text.as_bytes());
}

#[tokio::test]
async fn update_sends_precondition_and_survives_one_conflict() {
    let (addr, state) = start_double().await;
    state
        .lock()
        .unwrap()
        .repos
        .push(("ncf".to_string(), "nyc-configs".to_string()));
    let client = client(addr);

    let first = client
        .commit_file("ncf", "nyc-configs", "core-1.txt", "v1\n", "backup job 1: core-1")
        .await
        .unwrap();

    // Lose the precondition race exactly once; the client re-reads and retries.
    state.lock().unwrap().conflict_next_put = true;
    let second = client
        .commit_file("ncf", "nyc-configs", "core-1.txt", "v2\n", "backup job 2: core-1")
        .await
        .unwrap();
    assert_ne!(first, second);

    let bytes = client
        .read_file("ncf", "nyc-configs", "core-1.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes, b"v2\n");
}

#[tokio::test]
async fn diff_is_none_until_two_revisions() {
    let (addr, state) = start_double().await;
    state
        .lock()
        .unwrap()
        .repos
        .push(("ncf".to_string(), "nyc-configs".to_string()));
    let client = client(addr);

    assert!(client.diff("ncf", "nyc-configs", "core-1.txt").await.unwrap().is_none());

    client
        .commit_file("ncf", "nyc-configs", "core-1.txt", "v1\n", "backup job 1: core-1")
        .await
        .unwrap();
    assert!(client.diff("ncf", "nyc-configs", "core-1.txt").await.unwrap().is_none());

    client
        .commit_file("ncf", "nyc-configs", "core-1.txt", "v2\n", "backup job 2: core-1")
        .await
        .unwrap();
    let diff = client
        .diff("ncf", "nyc-configs", "core-1.txt")
        .await
        .unwrap()
        .expect("two revisions now exist");
    assert!(diff.contains("-v1"));
    assert!(diff.contains("+v2"));
}

#[tokio::test]
async fn diff_is_empty_when_revisions_are_identical() {
    let (addr, state) = start_double().await;
    state
        .lock()
        .unwrap()
        .repos
        .push(("ncf".to_string(), "nyc-configs".to_string()));
    let client = client(addr);

    for job in 1..=2 {
        client
            .commit_file(
                "ncf",
                "nyc-configs",
                "core-1.txt",
                "same\n",
                &format!("backup job {job}: core-1"),
            )
            .await
            .unwrap();
    }
    let diff = client
        .diff("ncf", "nyc-configs", "core-1.txt")
        .await
        .unwrap()
        .unwrap();
    assert!(diff.is_empty());
}

#[tokio::test]
async fn unreachable_service_maps_to_unavailable() {
    // Nothing listens on this port.
    let client = RepoClient::new("http://127.0.0.1:9", "t").unwrap();
    let err = client.ensure_repo("ncf", "r", "s").await.unwrap_err();
    assert!(err.to_string().contains("unavailable"));
}
