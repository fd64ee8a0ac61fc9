//! Bounded HTTP worker pool for API-managed platforms.
//!
//! PAN-OS exports via the XML API (keygen, then export); FortiOS via the
//! REST API (token login, then config backup). TLS verification is chosen
//! per device, defaulting to the boot-level flag; the verifying and
//! non-verifying clients are both built once and shared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::device::{Credentials, DeviceFacts, DeviceOutcome, FetchOutcome};
use crate::error::DeviceError;
use crate::platform::Platform;

/// One device queued for the HTTP pool.
pub struct ApiTarget {
    pub facts: DeviceFacts,
    pub creds: Credentials,
}

/// Export seam mirroring `TerminalClient`.
#[async_trait]
pub trait ConfigExporter: Send + Sync {
    /// Run the vendor flow and return the configuration body.
    async fn export_config(&self, target: &ApiTarget) -> Result<String, DeviceError>;
}

/// Bounded FIFO pool over a config exporter.
pub struct ApiPool {
    exporter: Arc<dyn ConfigExporter>,
    workers: usize,
}

impl ApiPool {
    pub fn new(exporter: Arc<dyn ConfigExporter>, workers: usize) -> Self {
        Self { exporter, workers }
    }

    /// Stream outcomes for `targets` into `tx`, at most `workers` in flight.
    pub async fn run(
        &self,
        targets: Vec<ApiTarget>,
        cancel: CancelToken,
        tx: mpsc::Sender<DeviceOutcome>,
    ) {
        let sem = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut workers = JoinSet::new();

        for target in targets {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&sem).acquire_owned() => {
                    Some(permit.expect("pool semaphore is never closed"))
                }
            };

            let Some(permit) = permit else {
                let _ = tx
                    .send(DeviceOutcome {
                        device_id: target.facts.device_id,
                        hostname: target.facts.hostname.clone(),
                        outcome: FetchOutcome::Skipped,
                        duration_ms: 0,
                    })
                    .await;
                continue;
            };

            let exporter = Arc::clone(&self.exporter);
            let cancel = cancel.clone();
            let tx = tx.clone();
            workers.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        FetchOutcome::Failed(DeviceError::Timeout(
                            "cancelled before completion".to_string(),
                        ))
                    }
                    res = exporter.export_config(&target) => match res {
                        Ok(config) => FetchOutcome::Config(config),
                        Err(err) => FetchOutcome::Failed(err),
                    },
                };
                let _ = tx
                    .send(DeviceOutcome {
                        device_id: target.facts.device_id,
                        hostname: target.facts.hostname.clone(),
                        outcome,
                        duration_ms: started.elapsed().as_millis() as i64,
                    })
                    .await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "api worker aborted");
            }
        }
    }
}

// ── Real HTTPS exporter ───────────────────────────────────────────────────

static PANOS_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<key>([^<]+)</key>").expect("panos key pattern"));

/// HTTPS exporter for PAN-OS and FortiOS appliances.
pub struct HttpExporter {
    verified: reqwest::Client,
    insecure: reqwest::Client,
    default_verify: bool,
    timeout: Duration,
    scheme: String,
}

impl HttpExporter {
    /// Build both shared clients. `default_verify` applies to devices with
    /// no per-device TLS setting.
    pub fn new(timeout: Duration, default_verify: bool) -> Result<Self, DeviceError> {
        let verified = reqwest::Client::builder()
            .build()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        let insecure = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(Self {
            verified,
            insecure,
            default_verify,
            timeout,
            scheme: "https".to_string(),
        })
    }

    /// Use plain HTTP instead of HTTPS. Lab and test fixtures only.
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    fn client_for(&self, facts: &DeviceFacts) -> &reqwest::Client {
        if facts.tls_verify.unwrap_or(self.default_verify) {
            &self.verified
        } else {
            &self.insecure
        }
    }

    async fn panos(&self, target: &ApiTarget) -> Result<String, DeviceError> {
        let client = self.client_for(&target.facts);
        let base = format!("{}://{}/api/", self.scheme, target.facts.address);

        let resp = client
            .get(&base)
            .query(&[
                ("type", "keygen"),
                ("user", target.creds.username.as_str()),
                ("password", target.creds.password.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;
        check_auth(resp.status(), "keygen")?;
        let body = resp.text().await.map_err(request_error)?;
        let key = PANOS_KEY
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| DeviceError::Protocol("keygen response missing <key>".to_string()))?;

        let resp = client
            .get(&base)
            .query(&[
                ("type", "export"),
                ("category", "configuration"),
                ("key", key.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;
        check_auth(resp.status(), "export")?;
        resp.text().await.map_err(request_error)
    }

    async fn fortios(&self, target: &ApiTarget) -> Result<String, DeviceError> {
        let client = self.client_for(&target.facts);
        let base = format!("{}://{}", self.scheme, target.facts.address);

        let resp = client
            .post(format!("{base}/api/v2/auth/login"))
            .json(&json!({
                "username": target.creds.username,
                "password": target.creds.password,
            }))
            .send()
            .await
            .map_err(request_error)?;
        check_auth(resp.status(), "login")?;

        // Token in the body when present, session cookie otherwise.
        let cookie = resp
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).to_string());
        let body = resp.text().await.map_err(request_error)?;
        let token = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("token")
                    .or_else(|| v.get("access_token"))
                    .and_then(Value::as_str)
                    .map(String::from)
            });

        let mut req = client
            .get(format!("{base}/api/v2/monitor/system/config/backup"))
            .query(&[("scope", "global")]);
        req = match (token, cookie) {
            (Some(token), _) => req.bearer_auth(token),
            (None, Some(cookie)) => req.header(COOKIE, cookie),
            (None, None) => {
                return Err(DeviceError::Protocol(
                    "login returned neither token nor cookie".to_string(),
                ))
            }
        };

        let resp = req.send().await.map_err(request_error)?;
        check_auth(resp.status(), "backup")?;
        resp.text().await.map_err(request_error)
    }
}

#[async_trait]
impl ConfigExporter for HttpExporter {
    async fn export_config(&self, target: &ApiTarget) -> Result<String, DeviceError> {
        info!(device = %target.facts.hostname, platform = %target.facts.platform, "exporting");
        let flow = async {
            match target.facts.platform {
                Platform::Panos => self.panos(target).await,
                Platform::Fortios => self.fortios(target).await,
                other => Err(DeviceError::Protocol(format!(
                    "platform {other} has no API flow"
                ))),
            }
        };
        match tokio::time::timeout(self.timeout, flow).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(format!(
                "no response within {:?}",
                self.timeout
            ))),
        }
    }
}

/// Classify a reqwest failure. The URL is dropped from the message: keygen
/// URLs carry the device password in the query string.
fn request_error(err: reqwest::Error) -> DeviceError {
    let scrubbed = err.without_url();
    if scrubbed.is_connect() {
        DeviceError::Unreachable(scrubbed.to_string())
    } else if scrubbed.is_timeout() {
        DeviceError::Timeout(scrubbed.to_string())
    } else {
        DeviceError::Transport(scrubbed.to_string())
    }
}

fn check_auth(status: StatusCode, step: &str) -> Result<(), DeviceError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(DeviceError::AuthRejected);
    }
    if !status.is_success() {
        return Err(DeviceError::Protocol(format!("{step} returned {status}")));
    }
    Ok(())
}
