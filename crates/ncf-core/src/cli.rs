//! Bounded terminal worker pool for SSH-managed platforms.
//!
//! Each worker opens one SSH session, disables paging, issues the platform's
//! show command, reads until the device prompt returns, and closes. Failures
//! of any kind are captured into the outcome, never propagated; the pool's
//! capacity is invariant across worker failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::device::{Credentials, DeviceFacts, DeviceOutcome, FetchOutcome};
use crate::error::DeviceError;

/// One device queued for the terminal pool.
pub struct CliTarget {
    pub facts: DeviceFacts,
    pub creds: Credentials,
}

/// Transport seam: the pool drives any terminal implementation, the scenario
/// tests script one.
#[async_trait]
pub trait TerminalClient: Send + Sync {
    /// Retrieve the running configuration of one device.
    async fn fetch_running_config(&self, target: &CliTarget) -> Result<String, DeviceError>;
}

/// Bounded FIFO pool over a terminal client.
pub struct CliPool {
    client: Arc<dyn TerminalClient>,
    workers: usize,
}

impl CliPool {
    pub fn new(client: Arc<dyn TerminalClient>, workers: usize) -> Self {
        Self { client, workers }
    }

    /// Stream outcomes for `targets` into `tx`, at most `workers` in flight.
    ///
    /// Cancellation: devices still waiting for a permit emit `Skipped`;
    /// in-flight sessions resolve to a timeout-kind error.
    pub async fn run(
        &self,
        targets: Vec<CliTarget>,
        cancel: CancelToken,
        tx: mpsc::Sender<DeviceOutcome>,
    ) {
        let sem = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut workers = JoinSet::new();

        for target in targets {
            // FIFO intake: take a permit in list order before spawning.
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

            let client = Arc::clone(&self.client);
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
                    res = client.fetch_running_config(&target) => match res {
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
                warn!(error = %err, "terminal worker aborted");
            }
        }
    }
}

// ── Real SSH transport ────────────────────────────────────────────────────

/// Device prompts end the last line with `#` (privileged) or `>`.
static PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.\-@/:()\[\]]{1,63}[#>]\s*$").expect("prompt pattern"));

/// russh host-key handler: the inventory is the authority for what we talk
/// to on an isolated management network, so any presented key is accepted.
struct AcceptHostKey;

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        Ok((self, true))
    }
}

/// SSH terminal implementation over russh.
pub struct SshTerminalClient {
    timeout: Duration,
    port: u16,
}

impl SshTerminalClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, port: 22 }
    }

    /// Override the SSH port (lab fixtures).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn session(&self, target: &CliTarget) -> Result<Handle<AcceptHostKey>, DeviceError> {
        let config = Arc::new(client::Config::default());
        let addr = (target.facts.address.as_str(), self.port);
        let mut handle = client::connect(config, addr, AcceptHostKey)
            .await
            .map_err(|e| DeviceError::Unreachable(e.to_string()))?;

        let authed = handle
            .authenticate_password(&target.creds.username, &target.creds.password)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        if !authed {
            return Err(DeviceError::AuthRejected);
        }
        Ok(handle)
    }

    async fn exchange(&self, target: &CliTarget) -> Result<String, DeviceError> {
        let mut handle = self.session(target).await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        channel
            .request_pty(false, "vt100", 200, 80, 0, 0, &[])
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;

        // Banner and the first prompt.
        read_until_prompt(&mut channel).await?;

        if let Some(paging) = target.facts.platform.paging_command() {
            send_line(&mut channel, paging).await?;
            read_until_prompt(&mut channel).await?;
        }

        let command = target
            .facts
            .platform
            .show_command()
            .ok_or_else(|| DeviceError::Protocol("platform has no terminal command".to_string()))?;
        send_line(&mut channel, command).await?;
        let raw = read_until_prompt(&mut channel).await?;

        let _ = channel.eof().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;

        debug!(device = %target.facts.hostname, bytes = raw.len(), "terminal read complete");
        Ok(strip_echo_and_prompt(&raw, command))
    }
}

#[async_trait]
impl TerminalClient for SshTerminalClient {
    async fn fetch_running_config(&self, target: &CliTarget) -> Result<String, DeviceError> {
        info!(device = %target.facts.hostname, platform = %target.facts.platform, "connecting");
        match tokio::time::timeout(self.timeout, self.exchange(target)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(format!(
                "no response within {:?}",
                self.timeout
            ))),
        }
    }
}

async fn send_line(channel: &mut Channel<client::Msg>, line: &str) -> Result<(), DeviceError> {
    let framed = format!("{line}\n");
    channel
        .data(framed.as_bytes())
        .await
        .map_err(|e| DeviceError::Transport(e.to_string()))
}

/// Accumulate channel data until the last line looks like a device prompt.
async fn read_until_prompt(channel: &mut Channel<client::Msg>) -> Result<String, DeviceError> {
    let mut buf = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => {
                buf.extend_from_slice(data);
                let text = String::from_utf8_lossy(&buf);
                if let Some(last) = text.lines().last() {
                    if PROMPT.is_match(last.trim_end()) {
                        return Ok(text.into_owned());
                    }
                }
            }
            Some(ChannelMsg::ExtendedData { .. }) => {}
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(DeviceError::Protocol(
                    "session closed before the prompt returned".to_string(),
                ));
            }
            Some(_) => {}
        }
    }
}

/// Drop the echoed command line and the trailing prompt line.
fn strip_echo_and_prompt(raw: &str, command: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "");
    let mut lines: Vec<&str> = normalized.lines().collect();
    if lines.first().is_some_and(|l| l.contains(command)) {
        lines.remove(0);
    }
    if lines
        .last()
        .is_some_and(|l| PROMPT.is_match(l.trim_end()))
    {
        lines.pop();
    }
    let mut text = lines.join("\n");
    if normalized.ends_with('\n') || !text.is_empty() {
        text.push('\n');
    }
    text
}
