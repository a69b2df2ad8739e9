use crate::services::{ConnectOptions, RetryPolicy};
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3300;
pub const DEFAULT_DATABASE: &str = "classifieds";
pub const DEFAULT_ENVIRONMENT: &str = "development";

#[derive(Debug, Clone)]
pub struct ClassifiedsConfig {
    pub common: core_config::Config,
    pub environment: String,
    pub deployment_mode: DeploymentMode,
    pub mongodb: MongoConfig,
    pub reconnect: RetryPolicy,
    pub cloudinary: CloudinaryConfig,
}

/// How the process is hosted, which decides the reconnect strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Long-lived server: connect at startup, retry in the background.
    LongRunning,
    /// Serverless invocation: connect lazily before handling each request.
    OnDemand,
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long-running" | "long_running" | "server" => Ok(DeploymentMode::LongRunning),
            "on-demand" | "on_demand" | "serverless" => Ok(DeploymentMode::OnDemand),
            _ => Err(format!("Invalid deployment mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// Connection string; credentials inside make it a secret.
    pub uri: Option<Secret<String>>,
    pub database: String,
    pub options: ConnectOptions,
}

#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: Option<String>,
    pub api_key: Option<Secret<String>>,
    pub api_secret: Option<Secret<String>>,
}

impl ClassifiedsConfig {
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load_with_default_port(DEFAULT_PORT)?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = ConnectOptions::default();
        let reconnect_defaults = RetryPolicy::default();

        let max_attempts = match parse_var::<u32>(&get, "RECONNECT_MAX_ATTEMPTS")? {
            Some(0) => None,
            Some(n) => Some(n),
            None => reconnect_defaults.max_attempts,
        };

        let initial_delay = parse_millis(&get, "RECONNECT_INITIAL_DELAY_MS")?
            .unwrap_or(reconnect_defaults.initial_delay);
        let max_delay = parse_millis(&get, "RECONNECT_MAX_DELAY_MS")?
            .unwrap_or(reconnect_defaults.max_delay);
        if max_delay < initial_delay {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RECONNECT_MAX_DELAY_MS ({}ms) is below RECONNECT_INITIAL_DELAY_MS ({}ms)",
                max_delay.as_millis(),
                initial_delay.as_millis()
            )));
        }

        Ok(ClassifiedsConfig {
            common,
            environment: get("ENVIRONMENT").unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            deployment_mode: parse_var(&get, "DEPLOYMENT_MODE")?
                .unwrap_or(DeploymentMode::LongRunning),
            mongodb: MongoConfig {
                uri: get("MONGODB_URI").map(Secret::new),
                database: get("MONGODB_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
                options: ConnectOptions {
                    server_selection_timeout: parse_millis(
                        &get,
                        "MONGODB_SERVER_SELECTION_TIMEOUT_MS",
                    )?
                    .unwrap_or(defaults.server_selection_timeout),
                    socket_timeout: parse_millis(&get, "MONGODB_SOCKET_TIMEOUT_MS")?
                        .unwrap_or(defaults.socket_timeout),
                    max_pool_size: parse_var(&get, "MONGODB_MAX_POOL_SIZE")?
                        .unwrap_or(defaults.max_pool_size),
                    min_pool_size: parse_var(&get, "MONGODB_MIN_POOL_SIZE")?
                        .or(defaults.min_pool_size),
                    retry_writes: parse_var(&get, "MONGODB_RETRY_WRITES")?
                        .unwrap_or(defaults.retry_writes),
                    retry_reads: parse_var(&get, "MONGODB_RETRY_READS")?
                        .unwrap_or(defaults.retry_reads),
                },
            },
            reconnect: RetryPolicy {
                initial_delay,
                max_delay,
                max_attempts,
                ..reconnect_defaults
            },
            cloudinary: CloudinaryConfig {
                cloud_name: get("CLOUDINARY_CLOUD_NAME"),
                api_key: get("CLOUDINARY_API_KEY").map(Secret::new),
                api_secret: get("CLOUDINARY_API_SECRET").map(Secret::new),
            },
        })
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
            })
        })
        .transpose()
}

fn parse_millis(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, AppError> {
    Ok(parse_var::<u64>(get, key)?.map(Duration::from_millis))
}
