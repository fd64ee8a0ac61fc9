//! Per-job progress broadcasting.
//!
//! Volatile, bound to the job's lifetime. Producers never block: the
//! underlying broadcast channel drops the oldest undelivered event when a
//! subscriber lags. Late subscribers first receive the latest snapshot, so
//! reconnecting UIs see current counters immediately. After the terminal
//! event the channel stays subscribable for a grace window, then the entry
//! is collected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Events buffered per subscriber before the oldest is dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Job lifecycle state carried on progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Complete,
    Failed,
}

impl JobState {
    /// A terminal state will never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// One progress observation for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: i64,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

struct JobChannel {
    tx: broadcast::Sender<ProgressEvent>,
    snapshot: Option<ProgressEvent>,
}

impl JobChannel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, snapshot: None }
    }
}

/// Registry of per-job broadcast channels, keyed by job id.
///
/// Entries appear on first publish or first subscribe and are collected a
/// grace window after the terminal event.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<Mutex<HashMap<i64, JobChannel>>>,
    grace: Duration,
}

impl ProgressBus {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Publish an event. Never blocks the producer; subscribers that fell
    /// behind lose the oldest events, not the newest.
    pub fn publish(&self, event: ProgressEvent) {
        let terminal = event.state.is_terminal();
        let job_id = event.job_id;
        {
            let mut map = self.inner.lock().expect("progress bus lock");
            let channel = map.entry(job_id).or_insert_with(JobChannel::new);
            channel.snapshot = Some(event.clone());
            // Send fails only when nobody is subscribed, which is fine.
            let _ = channel.tx.send(event);
        }
        if terminal {
            let inner = Arc::clone(&self.inner);
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                inner.lock().expect("progress bus lock").remove(&job_id);
                debug!(job_id, "progress channel collected");
            });
        }
    }

    /// Subscribe to a job's events.
    ///
    /// Returns the latest snapshot (if any event was published yet) plus a
    /// receiver for everything after it.
    pub fn subscribe(
        &self,
        job_id: i64,
    ) -> (Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let mut map = self.inner.lock().expect("progress bus lock");
        let channel = map.entry(job_id).or_insert_with(JobChannel::new);
        (channel.snapshot.clone(), channel.tx.subscribe())
    }

    /// Whether a channel currently exists for `job_id` (testing/diagnostics).
    pub fn has_channel(&self, job_id: i64) -> bool {
        self.inner.lock().expect("progress bus lock").contains_key(&job_id)
    }
}
