//! Configuration, built from environment variables.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default polling-cycle interval (the original system polled every 3 minutes).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 180;

/// Default retry-sweep interval.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;

/// How many unread messages one polling cycle fetches.
pub const POLL_BATCH_SIZE: usize = 20;

/// How many unread messages the first-run initialization sweep fetches.
pub const INIT_SWEEP_BATCH_SIZE: usize = 100;

/// Mail-provider client configuration.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Base URL of the provider REST API.
    pub base_url: String,
    /// Bearer access token.
    pub access_token: SecretString,
    /// Address the provider sends as.
    pub from_address: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl MailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token = std::env::var("MAILPILOT_MAIL_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("MAILPILOT_MAIL_TOKEN".into()))?;
        let from_address = std::env::var("MAILPILOT_FROM_ADDRESS")
            .map_err(|_| ConfigError::MissingEnvVar("MAILPILOT_FROM_ADDRESS".into()))?;

        let base_url = std::env::var("MAILPILOT_MAIL_API_URL")
            .unwrap_or_else(|_| "https://gmail.googleapis.com/gmail/v1".to_string());

        let timeout_secs = parse_env("MAILPILOT_MAIL_TIMEOUT_SECS", 30)?;

        Ok(Self {
            base_url,
            access_token: SecretString::from(access_token),
            from_address,
            timeout_secs,
        })
    }
}

/// Retrieval-service client configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub base_url: String,
    pub top_k: usize,
    pub timeout_secs: u64,
}

impl RetrievalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("MAILPILOT_RETRIEVAL_URL")
            .map_err(|_| ConfigError::MissingEnvVar("MAILPILOT_RETRIEVAL_URL".into()))?;
        let top_k = parse_env("MAILPILOT_RETRIEVAL_TOP_K", 5)?;
        let timeout_secs = parse_env("MAILPILOT_RETRIEVAL_TIMEOUT_SECS", 15)?;
        Ok(Self {
            base_url,
            top_k,
            timeout_secs,
        })
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub http_port: u16,
    pub poll_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub mail: MailConfig,
    pub retrieval: RetrievalConfig,
}

impl Config {
    /// Build the full configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("MAILPILOT_DB_PATH")
            .unwrap_or_else(|_| "./data/mailpilot.db".to_string());
        let http_port = parse_env("MAILPILOT_HTTP_PORT", 8080)?;
        let poll_interval_secs =
            parse_env("MAILPILOT_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        let retry_interval_secs =
            parse_env("MAILPILOT_RETRY_INTERVAL_SECS", DEFAULT_RETRY_INTERVAL_SECS)?;

        Ok(Self {
            db_path,
            http_port,
            poll_interval_secs,
            retry_interval_secs,
            mail: MailConfig::from_env()?,
            retrieval: RetrievalConfig::from_env()?,
        })
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
