//! ncf server binary: boot wiring and lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ncf_auth::Sealer;
use ncf_config::Settings;
use ncf_core::api::HttpExporter;
use ncf_core::cli::SshTerminalClient;
use ncf_core::resolver::CredentialResolver;
use ncf_core::{BackupEngine, EngineConfig, ProgressBus};
use ncf_db::{DbPool, Repo};
use ncf_git::RepoClient;
use ncf_server::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(settings.log_level.clone()))
        .with_target(false)
        .init();

    info!("initialising database");
    let pool = DbPool::connect(&settings.database_url)
        .await
        .context("connecting to database")?;
    let repo = Repo::new(pool);

    // Jobs still marked running were orphaned by a restart.
    let orphaned = repo.orphan_running_jobs().await?;
    if orphaned > 0 {
        warn!(orphaned, "marked orphaned running jobs as failed");
    }

    let sealer = Sealer::new(&settings.unseal_key)
        .context("unseal key must be a 32-byte base64 Fernet key")?;
    let resolver = CredentialResolver::new(sealer, settings.fallback_credentials());

    let git = RepoClient::new(&settings.repo_service.base_url, &settings.repo_service.token)
        .context("building repository-service client")?;
    let terminal = SshTerminalClient::new(Duration::from_secs(settings.cli_timeout_secs));
    let exporter = HttpExporter::new(
        Duration::from_secs(settings.api_timeout_secs),
        settings.tls_verify,
    )
    .context("building HTTPS exporter")?;

    let bus = ProgressBus::new(Duration::from_secs(settings.grace_secs));
    let engine = BackupEngine::new(
        Arc::new(repo.clone()),
        git.clone(),
        bus.clone(),
        resolver,
        Arc::new(terminal),
        Arc::new(exporter),
        EngineConfig {
            org: settings.repo_service.org.clone(),
            cli_workers: settings.cli_workers,
            api_workers: settings.api_workers,
            always_commit: settings.always_commit,
        },
    );

    let state = AppState {
        repo,
        engine: Arc::new(engine),
        bus,
        git,
        settings: Arc::new(settings.clone()),
        running: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!("listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(state))
        .await?;
    Ok(())
}

async fn shutdown(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down; cancelling running jobs");
    state.cancel_all_jobs();
}
