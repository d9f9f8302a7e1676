use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PipelineError;

/// Process configuration loaded from environment variables.
/// Secrets and endpoints only; scoring weights and caps live in the TOML policy.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Policy
    pub policy_path: Option<PathBuf>,

    // External collaborators
    pub source_gateway_url: Option<String>,
    pub source_gateway_token: Option<String>,
    pub enrichment_gateway_url: Option<String>,

    // Worker
    pub fetch_timeout: Duration,
    pub worker_concurrency: usize,
    pub worker_idle: Duration,

    // Scheduler
    pub scheduler_tick: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| PipelineError::Config("DATABASE_URL is required".into()))?,
            policy_path: optional_env("LEADGEN_POLICY_PATH").map(PathBuf::from),
            source_gateway_url: optional_env("SOURCE_GATEWAY_URL"),
            source_gateway_token: optional_env("SOURCE_GATEWAY_TOKEN"),
            enrichment_gateway_url: optional_env("ENRICHMENT_GATEWAY_URL"),
            fetch_timeout: Duration::from_secs(parse_env("FETCH_TIMEOUT_SECS", 30)?),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 4)?,
            worker_idle: Duration::from_secs(parse_env("WORKER_IDLE_SECS", 5)?),
            scheduler_tick: Duration::from_secs(parse_env("SCHEDULER_TICK_SECS", 60)?),
        };

        config.log_redacted();
        Ok(config)
    }

    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let n = val.len().min(5);
            format!("{}...({} chars)", &val[..n], val.len())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!(
            "  LEADGEN_POLICY_PATH: {}",
            self.policy_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string())
        );
        tracing::info!("  SOURCE_GATEWAY_URL: {}", preview_opt(&self.source_gateway_url));
        tracing::info!("  SOURCE_GATEWAY_TOKEN: {}", preview_opt(&self.source_gateway_token));
        tracing::info!("  ENRICHMENT_GATEWAY_URL: {}", preview_opt(&self.enrichment_gateway_url));
        tracing::info!(
            fetch_timeout_secs = self.fetch_timeout.as_secs(),
            worker_concurrency = self.worker_concurrency,
            scheduler_tick_secs = self.scheduler_tick.as_secs(),
            "Runtime settings"
        );
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, PipelineError> {
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("{key} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn numeric_settings_fall_back_to_defaults() {
        let _lock = env_guard().lock().unwrap();
        env::remove_var("FETCH_TIMEOUT_SECS");
        assert_eq!(parse_env("FETCH_TIMEOUT_SECS", 30u64).unwrap(), 30);
    }

    #[test]
    fn malformed_number_is_a_config_error() {
        let _lock = env_guard().lock().unwrap();
        env::set_var("WORKER_CONCURRENCY", "lots");
        let err = parse_env("WORKER_CONCURRENCY", 4usize).unwrap_err();
        env::remove_var("WORKER_CONCURRENCY");
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
