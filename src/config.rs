use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub broker_client_id: String,
    pub broker_max_retries: u32,

    pub tsdb_url: String,
    pub tsdb_token: String,
    pub tsdb_org: String,
    pub tsdb_bucket: String,
    pub tsdb_batch_size: usize,
    pub tsdb_flush_interval_ms: u64,
    pub tsdb_max_queue: usize,

    pub api_base: String,
    pub http_timeout_secs: u64,
    pub shutdown_grace_secs: u64,

    pub rules_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let broker_host = env_string("BROKER_HOST", None)?;
        let broker_port = env_string("BROKER_PORT", None)?
            .parse::<u16>()
            .context("invalid BROKER_PORT")?;
        let broker_username = env_optional("BROKER_USERNAME");
        let broker_password = env_optional("BROKER_PASSWORD");
        let broker_client_id = env_string(
            "BROKER_CLIENT_ID",
            Some(format!("automation-sidecar-{}", std::process::id())),
        )?;
        let broker_max_retries = env_u64("BROKER_MAX_RETRIES", Some(10))? as u32;

        let tsdb_url = env_string("TSDB_URL", None)?;
        Url::parse(&tsdb_url).context("invalid TSDB_URL")?;
        let tsdb_url = tsdb_url.trim_end_matches('/').to_string();
        let tsdb_token = env_string("TSDB_TOKEN", None)?;
        let tsdb_org = env_string("TSDB_ORG", None)?;
        let tsdb_bucket = env_string("TSDB_BUCKET", None)?;
        let tsdb_batch_size = env_u64("TSDB_BATCH_SIZE", Some(500))? as usize;
        let tsdb_flush_interval_ms = env_u64("TSDB_FLUSH_INTERVAL_MS", Some(750))?;
        let tsdb_max_queue = env_u64("TSDB_MAX_QUEUE", Some(tsdb_batch_size as u64 * 10))? as usize;

        let api_base = env_string("API_BASE", Some("http://127.0.0.1:5000".to_string()))?;
        Url::parse(&api_base).context("invalid API_BASE")?;
        let api_base = api_base.trim_end_matches('/').to_string();
        let http_timeout_secs = env_u64("HTTP_TIMEOUT_SECS", Some(5))?;
        let shutdown_grace_secs = env_u64("SHUTDOWN_GRACE_SECS", Some(5))?;

        let rules_path = PathBuf::from(env_string(
            "RULES_PATH",
            Some("rules_config.json".to_string()),
        )?);

        Ok(Self {
            broker_host,
            broker_port,
            broker_username,
            broker_password,
            broker_client_id,
            broker_max_retries,
            tsdb_url,
            tsdb_token,
            tsdb_org,
            tsdb_bucket,
            tsdb_batch_size,
            tsdb_flush_interval_ms,
            tsdb_max_queue,
            api_base,
            http_timeout_secs,
            shutdown_grace_secs,
            rules_path,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.tsdb_flush_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                default.ok_or_else(|| anyhow!("env var {key} is empty"))
            } else {
                Ok(trimmed)
            }
        }
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
