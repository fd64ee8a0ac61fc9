//! The backup orchestrator.
//!
//! Drives one job from start to terminal state: loads the inventory
//! snapshot, resolves credentials, partitions devices by transport class,
//! fans out to both pools, and funnels every outcome through a single
//! consumer that scrubs, commits, records, and publishes. The consumer is
//! the only writer of job counters, and the SQL behind them is additive, so
//! the counters are safe under concurrent producers from both pools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ncf_git::RepoClient;

use crate::api::{ApiPool, ApiTarget, ConfigExporter};
use crate::cancel::CancelToken;
use crate::cli::{CliPool, CliTarget, TerminalClient};
use crate::device::{DeviceFacts, DeviceOutcome, FetchOutcome};
use crate::error::{DeviceError, EngineError};
use crate::platform::Transport;
use crate::progress::{JobState, ProgressBus, ProgressEvent};
use crate::resolver::CredentialResolver;
use crate::scrubber::scrub;
use crate::store::{JobStore, NewResult, ResultState};

/// Outcomes buffered between the pools and the recording consumer.
const OUTCOME_BUFFER: usize = 64;

/// Engine knobs fixed at boot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Repository-service organization owning the per-site repos.
    pub org: String,
    /// Terminal pool budget.
    pub cli_workers: usize,
    /// HTTP pool budget.
    pub api_workers: usize,
    /// Commit even when the normalized config is unchanged.
    pub always_commit: bool,
}

struct Tally {
    total: i64,
    completed: i64,
    failed: i64,
    skipped: i64,
}

/// Orchestrates backup jobs. One instance serves the whole process; each
/// `run_job` call owns one job.
pub struct BackupEngine {
    store: Arc<dyn JobStore>,
    repo_service: RepoClient,
    bus: ProgressBus,
    resolver: CredentialResolver,
    terminal: Arc<dyn TerminalClient>,
    exporter: Arc<dyn ConfigExporter>,
    cfg: EngineConfig,
}

impl BackupEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        repo_service: RepoClient,
        bus: ProgressBus,
        resolver: CredentialResolver,
        terminal: Arc<dyn TerminalClient>,
        exporter: Arc<dyn ConfigExporter>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            repo_service,
            bus,
            resolver,
            terminal,
            exporter,
            cfg,
        }
    }

    /// Run one job to its terminal state.
    ///
    /// Per-device failures never abort the job; only failures to load the
    /// job itself are fatal and mark the job `failed`.
    pub async fn run_job(
        &self,
        job_id: i64,
        device_ids: Vec<i64>,
        cancel: CancelToken,
    ) -> Result<(), EngineError> {
        let facts = match self.store.load_device_facts(&device_ids).await {
            Ok(facts) => facts,
            Err(err) => return self.fail_job(job_id, &err.to_string()).await,
        };
        if let Err(err) = self.store.mark_job_started(job_id).await {
            return self.fail_job(job_id, &err.to_string()).await;
        }
        let total = match self.store.job_total(job_id).await {
            Ok(total) => total,
            Err(err) => return self.fail_job(job_id, &err.to_string()).await,
        };

        info!(job_id, total, devices = facts.len(), "backup job starting");
        let mut tally = Tally {
            total,
            completed: 0,
            failed: 0,
            skipped: 0,
        };
        self.publish(job_id, &tally, JobState::Running, None, None);

        let by_id: HashMap<i64, DeviceFacts> =
            facts.iter().map(|f| (f.device_id, f.clone())).collect();

        // Resolve up front; devices without usable credentials fail now and
        // never reach a pool.
        let mut cli_targets = Vec::new();
        let mut api_targets = Vec::new();
        for f in facts {
            match self.resolver.resolve(&f) {
                Ok(creds) => match f.platform.transport() {
                    Transport::Cli => cli_targets.push(CliTarget { facts: f, creds }),
                    Transport::Api => api_targets.push(ApiTarget { facts: f, creds }),
                },
                Err(err) => {
                    self.record_failure(job_id, &mut tally, f.device_id, &f.hostname, &err, 0)
                        .await;
                }
            }
        }

        let (tx, mut rx) = mpsc::channel::<DeviceOutcome>(OUTCOME_BUFFER);

        let cli_pool = CliPool::new(Arc::clone(&self.terminal), self.cfg.cli_workers);
        let cli_cancel = cancel.clone();
        let cli_tx = tx.clone();
        let cli_handle =
            tokio::spawn(async move { cli_pool.run(cli_targets, cli_cancel, cli_tx).await });

        let api_pool = ApiPool::new(Arc::clone(&self.exporter), self.cfg.api_workers);
        let api_cancel = cancel.clone();
        let api_tx = tx.clone();
        let api_handle =
            tokio::spawn(async move { api_pool.run(api_targets, api_cancel, api_tx).await });

        drop(tx);

        // Single consumer: all scrub/commit/record/publish work, in arrival
        // order across both pools.
        let mut ensured_repos: HashSet<String> = HashSet::new();
        while let Some(outcome) = rx.recv().await {
            match outcome.outcome {
                FetchOutcome::Skipped => {
                    self.record_skip(job_id, &mut tally, &outcome).await;
                }
                FetchOutcome::Failed(err) => {
                    self.record_failure(
                        job_id,
                        &mut tally,
                        outcome.device_id,
                        &outcome.hostname,
                        &err,
                        outcome.duration_ms,
                    )
                    .await;
                }
                FetchOutcome::Config(ref raw) => {
                    let Some(facts) = by_id.get(&outcome.device_id) else {
                        warn!(device_id = outcome.device_id, "outcome for unknown device");
                        continue;
                    };
                    match self
                        .commit_config(job_id, facts, raw, &mut ensured_repos)
                        .await
                    {
                        Ok((hash, commit_id)) => {
                            self.record_success(job_id, &mut tally, &outcome, hash, commit_id)
                                .await;
                        }
                        Err(err) => {
                            self.record_failure(
                                job_id,
                                &mut tally,
                                outcome.device_id,
                                &outcome.hostname,
                                &err,
                                outcome.duration_ms,
                            )
                            .await;
                        }
                    }
                }
            }
        }

        let _ = cli_handle.await;
        let _ = api_handle.await;

        if let Err(err) = self.store.finalize_job(job_id, JobState::Complete).await {
            warn!(job_id, error = %err, "could not finalize job row");
        }
        info!(
            job_id,
            completed = tally.completed,
            failed = tally.failed,
            skipped = tally.skipped,
            "backup job complete"
        );
        self.publish(job_id, &tally, JobState::Complete, None, None);
        Ok(())
    }

    /// Scrub, compare against the last stored hash, and commit.
    ///
    /// The unchanged case still commits by default: the commit history is
    /// the record of when the device was last checked.
    async fn commit_config(
        &self,
        job_id: i64,
        facts: &DeviceFacts,
        raw: &str,
        ensured_repos: &mut HashSet<String>,
    ) -> Result<(String, String), DeviceError> {
        let scrubbed = scrub(raw, facts.platform);

        let prior = match self.store.latest_success(facts.device_id).await {
            Ok(prior) => prior,
            Err(err) => {
                warn!(device = %facts.hostname, error = %err, "prior-hash lookup failed");
                None
            }
        };
        if let Some((prior_hash, prior_commit)) = prior {
            if prior_hash == scrubbed.hash {
                info!(device = %facts.hostname, "configuration unchanged");
                if !self.cfg.always_commit {
                    return Ok((scrubbed.hash, prior_commit));
                }
            }
        }

        if !ensured_repos.contains(&facts.repo_name) {
            self.repo_service
                .ensure_repo(&self.cfg.org, &facts.repo_name, &facts.site_code)
                .await?;
            ensured_repos.insert(facts.repo_name.clone());
        }

        let commit_id = self
            .repo_service
            .commit_file(
                &self.cfg.org,
                &facts.repo_name,
                &format!("{}.txt", facts.hostname),
                &scrubbed.text,
                &format!("backup job {job_id}: {}", facts.hostname),
            )
            .await?;
        Ok((scrubbed.hash, commit_id))
    }

    async fn record_success(
        &self,
        job_id: i64,
        tally: &mut Tally,
        outcome: &DeviceOutcome,
        hash: String,
        commit_id: String,
    ) {
        let row = NewResult {
            job_id,
            device_id: outcome.device_id,
            state: ResultState::Success,
            content_hash: hash,
            commit_id: Some(commit_id),
            error: None,
            duration_ms: outcome.duration_ms,
        };
        if let Err(err) = self.store.insert_result(row).await {
            warn!(job_id, device = %outcome.hostname, error = %err, "result insert failed");
        }
        if let Err(err) = self.store.add_completed(job_id).await {
            warn!(job_id, error = %err, "counter update failed");
        }
        tally.completed += 1;
        self.publish(
            job_id,
            tally,
            JobState::Running,
            Some(outcome.hostname.clone()),
            Some("success"),
        );
    }

    async fn record_failure(
        &self,
        job_id: i64,
        tally: &mut Tally,
        device_id: i64,
        hostname: &str,
        err: &DeviceError,
        duration_ms: i64,
    ) {
        warn!(job_id, device = hostname, kind = err.kind(), "device failed: {err}");
        let row = NewResult {
            job_id,
            device_id,
            state: ResultState::Failed,
            content_hash: String::new(),
            commit_id: None,
            error: Some(err.record()),
            duration_ms,
        };
        if let Err(err) = self.store.insert_result(row).await {
            warn!(job_id, device = hostname, error = %err, "result insert failed");
        }
        if let Err(err) = self.store.add_failed(job_id).await {
            warn!(job_id, error = %err, "counter update failed");
        }
        tally.failed += 1;
        self.publish(
            job_id,
            tally,
            JobState::Running,
            Some(hostname.to_string()),
            Some("failed"),
        );
    }

    async fn record_skip(&self, job_id: i64, tally: &mut Tally, outcome: &DeviceOutcome) {
        let row = NewResult {
            job_id,
            device_id: outcome.device_id,
            state: ResultState::Skipped,
            content_hash: String::new(),
            commit_id: None,
            error: None,
            duration_ms: outcome.duration_ms,
        };
        if let Err(err) = self.store.insert_result(row).await {
            warn!(job_id, device = %outcome.hostname, error = %err, "result insert failed");
        }
        tally.skipped += 1;
        self.publish(
            job_id,
            tally,
            JobState::Running,
            Some(outcome.hostname.clone()),
            Some("skipped"),
        );
    }

    async fn fail_job(&self, job_id: i64, reason: &str) -> Result<(), EngineError> {
        error!(job_id, reason, "backup job failed fatally");
        if let Err(err) = self.store.finalize_job(job_id, JobState::Failed).await {
            error!(job_id, error = %err, "could not mark job failed");
        }
        self.bus.publish(ProgressEvent {
            job_id,
            total: 0,
            completed: 0,
            failed: 0,
            state: JobState::Failed,
            last_device: None,
            last_status: None,
        });
        Err(EngineError::Fatal(reason.to_string()))
    }

    fn publish(
        &self,
        job_id: i64,
        tally: &Tally,
        state: JobState,
        last_device: Option<String>,
        last_status: Option<&str>,
    ) {
        self.bus.publish(ProgressEvent {
            job_id,
            total: tally.total,
            completed: tally.completed,
            failed: tally.failed,
            state,
            last_device,
            last_status: last_status.map(String::from),
        });
    }
}
