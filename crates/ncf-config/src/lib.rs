//! Boot configuration for the ncf services.

mod settings;

pub use settings::{ConfigError, RepoServiceSettings, Settings};
