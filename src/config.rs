//! Environment-driven configuration for the binary.
//!
//! All settings come from environment variables with defaults where a default
//! makes sense; the target URL is the only required setting.

use thiserror::Error;

use crate::payload::{BatchSpec, RequestSpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TARGET_URL is required")]
    MissingTargetUrl,

    #[error("TARGET_URL must start with http:// or https://, got '{0}'")]
    InvalidTargetUrl(String),

    #[error("invalid {name}: '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}

/// Runtime configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name attached to the locally built batch. `BATCH_NAME`, default "local".
    pub batch_name: String,

    /// URL to load test. `TARGET_URL`, required.
    pub target_url: String,

    /// POST instead of GET. `REQUEST_TYPE`, default GET.
    pub is_post: bool,

    /// Iterations per trial. `LOAD_SIZE`, default 100.
    pub load_size: u64,

    /// Concurrency levels trialled sequentially. `CONCURRENCY_LEVELS`
    /// comma-separated, default "10".
    pub concurrency_levels: Vec<u32>,

    /// Iterations per throughput sample. `THROUGHPUT_WINDOW`, default 0
    /// (a tenth of the load).
    pub throughput_size: u64,

    /// Local control-channel listen addresses. `LISTEN_ADDRS`
    /// comma-separated, default none.
    pub listen_addrs: Vec<String>,

    /// Peer endpoints to distribute the batch to. `PEER_ENDPOINTS`
    /// comma-separated, default none.
    pub peer_endpoints: Vec<String>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let target_url = std::env::var("TARGET_URL").map_err(|_| ConfigError::MissingTargetUrl)?;
        if !target_url.starts_with("http://") && !target_url.starts_with("https://") {
            return Err(ConfigError::InvalidTargetUrl(target_url));
        }

        let batch_name = std::env::var("BATCH_NAME").unwrap_or_else(|_| "local".to_string());

        let is_post = std::env::var("REQUEST_TYPE")
            .unwrap_or_else(|_| "GET".to_string())
            .to_uppercase()
            == "POST";

        let load_size = env_number("LOAD_SIZE", 100u64)?;
        let throughput_size = env_number("THROUGHPUT_WINDOW", 0u64)?;

        let concurrency_levels = match std::env::var("CONCURRENCY_LEVELS") {
            Ok(value) => {
                let mut levels = Vec::new();
                for part in split_list(&value) {
                    let level = part.parse().map_err(|_| ConfigError::InvalidNumber {
                        name: "CONCURRENCY_LEVELS",
                        value: part.clone(),
                    })?;
                    levels.push(level);
                }
                levels
            }
            Err(_) => vec![10],
        };

        let listen_addrs = std::env::var("LISTEN_ADDRS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let peer_endpoints = std::env::var("PEER_ENDPOINTS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        Ok(Self {
            batch_name,
            target_url,
            is_post,
            load_size,
            concurrency_levels,
            throughput_size,
            listen_addrs,
            peer_endpoints,
        })
    }

    /// The batch this instance submits and runs.
    pub fn to_batch(&self) -> BatchSpec {
        let mut request = RequestSpec::get(&self.target_url);
        request.is_post = self.is_post;

        BatchSpec {
            name: self.batch_name.clone(),
            load_size: self.load_size,
            throughput_size: self.throughput_size,
            concurrency_levels: self.concurrency_levels.clone(),
            requests: vec![request],
            auth: None,
        }
    }
}
