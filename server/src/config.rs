use std::{env, time::Duration};

pub const DEFAULT_GHL_BASE_URL: &str = "https://services.leadconnectorhq.com";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_RAILWAY_API_URL: &str = "https://backboard.railway.app/graphql/v2";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailwayConfig {
    pub api_url: String,
    pub api_token: String,
    pub project_id: String,
    pub environment_id: String,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub ghl_base_url: String,
    pub ghl_location_id: String,
    pub ghl_access_token: String,
    pub ghl_refresh_token: String,
    pub oauth: Option<OAuthClientConfig>,
    pub railway: Option<RailwayConfig>,
    pub http_timeout: Duration,
    pub run_timeout: Duration,
    pub run_poll_interval: Duration,
    pub max_concurrent_runs: usize,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any name → value source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                Some(value) => value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::Invalid { name, value }),
                None => Ok(default),
            }
        };

        let port = number("PORT", 4000)?;
        let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
            name: "PORT",
            value: port.to_string(),
        })?;

        let railway = match (
            get("RW_API_TOKEN"),
            get("RAILWAY_PROJECT_ID"),
            get("RAILWAY_ENVIRONMENT_ID"),
            get("RAILWAY_SERVICE_ID"),
        ) {
            (Some(api_token), Some(project_id), Some(environment_id), Some(service_id)) => {
                Some(RailwayConfig {
                    api_url: get("RAILWAY_API_URL")
                        .unwrap_or_else(|| DEFAULT_RAILWAY_API_URL.to_string()),
                    api_token,
                    project_id,
                    environment_id,
                    service_id,
                })
            }
            _ => None,
        };

        let oauth = match (get("GHL_CLIENT_ID"), get("GHL_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(OAuthClientConfig {
                client_id,
                client_secret,
                refresh_interval: Duration::from_secs(number(
                    "TOKEN_REFRESH_INTERVAL_SECS",
                    72_000,
                )?),
            }),
            _ => None,
        };

        let max_concurrent_runs = number("MAX_CONCURRENT_RUNS", 8)? as usize;
        if max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_RUNS",
                value: "0".to_string(),
            });
        }

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            port,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            ghl_base_url: get("GHL_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GHL_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            ghl_location_id: required("GHL_LOCATION_ID")?,
            ghl_access_token: get("GHL_ACCESS_TOKEN").unwrap_or_default(),
            ghl_refresh_token: get("GHL_REFRESH_TOKEN").unwrap_or_default(),
            oauth,
            railway,
            http_timeout: Duration::from_secs(number("HTTP_TIMEOUT_SECS", 30)?),
            run_timeout: Duration::from_secs(number("RUN_TIMEOUT_SECS", 120)?),
            run_poll_interval: Duration::from_millis(number("RUN_POLL_INTERVAL_MS", 500)?),
            max_concurrent_runs,
            log_format,
        })
    }
}
