//! Shared application state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ncf_config::Settings;
use ncf_core::{BackupEngine, CancelToken, ProgressBus};
use ncf_db::Repo;
use ncf_git::RepoClient;

/// Everything the handlers need, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub repo: Repo,
    pub engine: Arc<BackupEngine>,
    pub bus: ProgressBus,
    pub git: RepoClient,
    pub settings: Arc<Settings>,
    /// Cancellation tokens of jobs currently running in this process; used
    /// by graceful shutdown.
    pub running: Arc<Mutex<HashMap<i64, CancelToken>>>,
}

impl AppState {
    /// Cancel every job this process is still running.
    pub fn cancel_all_jobs(&self) {
        let running = self.running.lock().expect("running-jobs lock");
        for token in running.values() {
            token.cancel();
        }
    }
}
