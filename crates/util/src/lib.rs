//! Process bootstrap helpers shared by the binaries: `.env` loading and the
//! environment-driven [`AppConfig`].

pub mod config;

pub use config::{AppConfig, ConfigError, Environment, IngestLimits, DEFAULT_BIND_ADDR};

/// Merges `.env` into the process environment if the file exists.
pub fn load_env_file() {
    // Deployments usually inject variables directly; a missing file is fine.
    let _ = dotenvy::dotenv();
}

// Process environment is global, so every test touching it shares one lock.
#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
