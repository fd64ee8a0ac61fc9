//! Settings loading: YAML file first, environment overrides second.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration load errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file exists but is not valid YAML for `Settings`.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Repository-service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoServiceSettings {
    /// Base URL of the repository service, e.g. `http://gitea.lan:3000`.
    pub base_url: String,
    /// Long-lived bearer token.
    pub token: String,
    /// Organization under which per-site repositories live.
    pub org: String,
}

/// Process configuration, loaded once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Database URL (sqlx, SQLite).
    pub database_url: String,

    /// REST listen address.
    pub bind_addr: String,

    /// Repository service connection.
    pub repo_service: RepoServiceSettings,

    /// 32-byte URL-safe base64 Fernet key for credential unsealing.
    pub unseal_key: String,

    /// Optional process-wide fallback credentials.
    pub fallback_username: Option<String>,
    pub fallback_password: Option<String>,

    /// Terminal worker budget.
    pub cli_workers: usize,
    /// HTTP worker budget.
    pub api_workers: usize,
    /// Per-device wall-clock budget for terminal devices, seconds.
    pub cli_timeout_secs: u64,
    /// Per-device wall-clock budget for API devices, seconds.
    pub api_timeout_secs: u64,

    /// Default TLS verification for API devices without a per-device setting.
    pub tls_verify: bool,

    /// Commit even when the normalized config is unchanged.
    pub always_commit: bool,

    /// Concurrent running-job ceiling enforced at job creation.
    pub max_concurrent_jobs: usize,

    /// Seconds a finished job's progress channel stays subscribable.
    pub grace_secs: u64,

    /// tracing filter directive, e.g. `info` or `ncf_core=debug`.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ncf.db".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            repo_service: RepoServiceSettings {
                base_url: "http://127.0.0.1:3000".to_string(),
                token: String::new(),
                org: "ncf".to_string(),
            },
            unseal_key: String::new(),
            fallback_username: None,
            fallback_password: None,
            cli_workers: 50,
            api_workers: 30,
            cli_timeout_secs: 120,
            api_timeout_secs: 60,
            tls_verify: false,
            always_commit: true,
            max_concurrent_jobs: 4,
            grace_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: Settings = serde_yaml::from_str(&content)?;
        settings.apply_env();
        Ok(settings)
    }

    /// Load from `NCF_CONFIG` (default `ncf.yaml`) when present, otherwise
    /// defaults; environment overrides apply either way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("NCF_CONFIG").unwrap_or_else(|_| "ncf.yaml".to_string());
        if Path::new(&path).exists() {
            Self::load(Path::new(&path))
        } else {
            let mut settings = Self::default();
            settings.apply_env();
            Ok(settings)
        }
    }

    /// Secrets and connection strings can come from the environment so the
    /// YAML file never has to carry them.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("NCF_DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = std::env::var("NCF_REPO_URL") {
            self.repo_service.base_url = v;
        }
        if let Ok(v) = std::env::var("NCF_REPO_TOKEN") {
            self.repo_service.token = v;
        }
        if let Ok(v) = std::env::var("NCF_REPO_ORG") {
            self.repo_service.org = v;
        }
        if let Ok(v) = std::env::var("NCF_UNSEAL_KEY") {
            self.unseal_key = v;
        }
        if let Ok(v) = std::env::var("NCF_NET_USER") {
            self.fallback_username = Some(v);
        }
        if let Ok(v) = std::env::var("NCF_NET_PASS") {
            self.fallback_password = Some(v);
        }
    }

    /// Fallback credentials, when both halves are configured and non-empty.
    pub fn fallback_credentials(&self) -> Option<(String, String)> {
        match (&self.fallback_username, &self.fallback_password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => {
                Some((u.clone(), p.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_budgets() {
        let s = Settings::default();
        assert_eq!(s.cli_workers, 50);
        assert_eq!(s.api_workers, 30);
        assert_eq!(s.cli_timeout_secs, 120);
        assert_eq!(s.api_timeout_secs, 60);
        assert!(!s.tls_verify);
        assert!(s.always_commit);
        assert_eq!(s.grace_secs, 30);
    }

    #[test]
    fn partial_yaml_keeps_defaults_elsewhere() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_url: \"sqlite://custom.db\"\ncli_workers: 10").unwrap();
        let s = Settings::load(file.path()).unwrap();
        assert_eq!(s.database_url, "sqlite://custom.db");
        assert_eq!(s.cli_workers, 10);
        assert_eq!(s.api_workers, 30);
    }

    #[test]
    fn fallback_requires_both_halves() {
        let mut s = Settings::default();
        assert!(s.fallback_credentials().is_none());
        s.fallback_username = Some("netops".to_string());
        assert!(s.fallback_credentials().is_none());
        s.fallback_password = Some("pw".to_string());
        assert_eq!(
            s.fallback_credentials(),
            Some(("netops".to_string(), "pw".to_string()))
        );
    }
}
