use serde::Deserialize;
use std::time::Duration;
use config::{Config as ConfigLoader, Environment, File};
use url::Url;

use crate::error::{AppError, Result};

pub const DEFAULT_API_URL: &str = "https://ismp.crpt.ru/api/v3/lk/documents/create";

const DEFAULT_REQUEST_LIMIT: u32 = 10;
const DEFAULT_WINDOW_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // General
    pub log_level: String,
    pub log_json: bool,

    // Registry endpoint
    pub api_url: String,

    // Admission control: at most `request_limit` submissions per `window_ms`
    pub request_limit: u32,
    pub window_ms: u64,

    // Transport
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            api_url: DEFAULT_API_URL.to_string(),
            request_limit: DEFAULT_REQUEST_LIMIT,
            window_ms: DEFAULT_WINDOW_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Load from `.env`, an optional `crpt.{toml,yaml,json}` file and
    /// `CRPT_*` environment variables, in increasing precedence.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_env_source(Environment::with_prefix("CRPT").try_parsing(true))
    }

    fn from_env_source(env: Environment) -> Result<Self> {
        let defaults = Self::default();

        let loader = ConfigLoader::builder()
            .set_default("log_level", defaults.log_level)?
            .set_default("log_json", defaults.log_json)?
            .set_default("api_url", defaults.api_url)?
            .set_default("request_limit", defaults.request_limit as u64)?
            .set_default("window_ms", defaults.window_ms)?
            .set_default("request_timeout_ms", defaults.request_timeout_ms)?
            .set_default("connect_timeout_ms", defaults.connect_timeout_ms)?
            .add_source(File::with_name("crpt").required(false))
            .add_source(env)
            .build()?;

        let config: Config = loader.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_limit == 0 {
            return Err(AppError::InvalidConfiguration(
                "request_limit must be positive".into(),
            ));
        }
        if self.window_ms == 0 {
            return Err(AppError::InvalidConfiguration(
                "window_ms must be positive".into(),
            ));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(AppError::InvalidConfiguration(
                "transport timeouts must be positive".into(),
            ));
        }

        let url = Url::parse(&self.api_url).map_err(|e| {
            AppError::InvalidConfiguration(format!("Invalid api_url {}: {}", self.api_url, e))
        })?;
        match url.scheme() {
            "https" | "http" => Ok(()),
            other => Err(AppError::InvalidConfiguration(format!(
                "Unsupported api_url scheme: {}",
                other
            ))),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
