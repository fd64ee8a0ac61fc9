//! Repository-service REST client.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{RepoError, Result};

/// Attempts for a conditional update that keeps losing the precondition race.
const COMMIT_ATTEMPTS: u32 = 3;

/// Base delay between conflict retries; grows linearly per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct PutResponse {
    #[serde(default)]
    commit: Option<CommitRef>,
}

/// Client for the per-site configuration repositories.
#[derive(Clone)]
pub struct RepoClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl RepoClient {
    /// Build a client against `base_url`, authenticating every request with
    /// the long-lived bearer `token`.
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(RepoError::transport)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.put(self.url(path)).bearer_auth(&self.token)
    }

    /// Ensure `{org}/{repo_name}` exists, creating the organization and the
    /// repository as needed.
    ///
    /// Idempotent under concurrency: any "already exists" answer from the
    /// service counts as success, so racing callers converge on one repo.
    pub async fn ensure_repo(&self, org: &str, repo_name: &str, site_code: &str) -> Result<()> {
        let probe = self
            .get(&format!("/repos/{org}/{repo_name}"))
            .send()
            .await
            .map_err(RepoError::transport)?;
        if probe.status().is_success() {
            debug!(org, repo = repo_name, "repository already exists");
            return Ok(());
        }

        let org_probe = self
            .get(&format!("/orgs/{org}"))
            .send()
            .await
            .map_err(RepoError::transport)?;
        if org_probe.status() == StatusCode::NOT_FOUND {
            let created = self
                .post("/orgs")
                .json(&json!({ "username": org, "visibility": "private" }))
                .send()
                .await
                .map_err(RepoError::transport)?;
            if !created.status().is_success() && !already_exists(created.status()) {
                // The repo create below still stands a chance if another
                // caller won the org race; only warn here.
                warn!(org, status = %created.status(), "organization create refused");
            }
        }

        let resp = self
            .post(&format!("/orgs/{org}/repos"))
            .json(&json!({
                "name": repo_name,
                "description": format!("Config backups — site {site_code}"),
                "private": true,
                "auto_init": true,
                "default_branch": "main",
            }))
            .send()
            .await
            .map_err(RepoError::transport)?;
        let status = resp.status();
        if status.is_success() || already_exists(status) {
            info!(org, repo = repo_name, "repository ready");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RepoError::status(status.as_u16(), &body))
    }

    /// Create or update `path` in `{org}/{repo}` and return the commit id.
    ///
    /// The current blob sha is read first and sent as the update
    /// precondition; a conflicting concurrent writer costs a re-read and a
    /// retry, bounded by `COMMIT_ATTEMPTS`.
    pub async fn commit_file(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        text: &str,
        message: &str,
    ) -> Result<String> {
        let encoded = B64_STD.encode(text.as_bytes());
        let contents_path = format!("/repos/{org}/{repo}/contents/{path}");

        for attempt in 1..=COMMIT_ATTEMPTS {
            let current_sha = self.blob_sha(&contents_path).await?;

            let mut payload = json!({
                "message": message,
                "content": encoded,
                "branch": "main",
            });
            if let Some(sha) = &current_sha {
                payload["sha"] = json!(sha);
            }

            let resp = self
                .put(&contents_path)
                .json(&payload)
                .send()
                .await
                .map_err(RepoError::transport)?;
            let status = resp.status();

            if status.is_success() {
                let body: PutResponse = resp.json().await.map_err(RepoError::transport)?;
                let commit_id = body.commit.map(|c| c.sha).unwrap_or_default();
                info!(repo, path, commit = %commit_id, "committed");
                return Ok(commit_id);
            }

            if is_conflict(status) && attempt < COMMIT_ATTEMPTS {
                debug!(repo, path, attempt, "commit precondition lost, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(RepoError::status(status.as_u16(), &body));
        }
        unreachable!("commit retry loop returns on every path")
    }

    /// Read the current bytes of `path`, or `None` if the file is absent.
    pub async fn read_file(&self, org: &str, repo: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .get(&format!("/repos/{org}/{repo}/contents/{path}"))
            .send()
            .await
            .map_err(RepoError::transport)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RepoError::status(status, &body));
        }
        let contents: ContentsResponse = resp.json().await.map_err(RepoError::transport)?;
        let encoded: String = contents
            .content
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = B64_STD
            .decode(encoded)
            .map_err(|e| RepoError::status(200, &format!("undecodable content: {e}")))?;
        Ok(Some(bytes))
    }

    /// Unified diff between the two most recent revisions touching `path`.
    ///
    /// `None` when fewer than two revisions exist; `Some("")` when the two
    /// revisions left the file byte-identical.
    pub async fn diff(&self, org: &str, repo: &str, path: &str) -> Result<Option<String>> {
        let resp = self
            .get(&format!("/repos/{org}/{repo}/commits"))
            .query(&[("path", path), ("limit", "2")])
            .send()
            .await
            .map_err(RepoError::transport)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RepoError::status(status, &body));
        }
        let commits: Vec<CommitRef> = resp.json().await.map_err(RepoError::transport)?;
        if commits.len() < 2 {
            return Ok(None);
        }

        let newer = &commits[0].sha;
        let older = &commits[1].sha;
        let resp = self
            .get(&format!("/repos/{org}/{repo}/compare/{older}...{newer}.diff"))
            .send()
            .await
            .map_err(RepoError::transport)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RepoError::status(status, &body));
        }
        let diff = resp.text().await.map_err(RepoError::transport)?;
        Ok(Some(diff))
    }

    async fn blob_sha(&self, contents_path: &str) -> Result<Option<String>> {
        let resp = self
            .get(contents_path)
            .send()
            .await
            .map_err(RepoError::transport)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RepoError::status(status, &body));
        }
        let contents: ContentsResponse = resp.json().await.map_err(RepoError::transport)?;
        Ok(Some(contents.sha))
    }
}

fn already_exists(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY
}

fn is_conflict(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED
}
