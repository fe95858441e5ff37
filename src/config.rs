//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Gate server configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Port for the REST server.
    pub bind_port: u16,
    /// Page the emailed sign-in link returns the user to.
    pub link_base_url: String,
    /// How long an emailed sign-in link stays valid.
    pub link_ttl: Duration,
    /// Capacity of the session-change broadcast channel.
    pub session_event_capacity: usize,
    pub demo: DemoConfig,
    /// Outbound mail settings. `None` keeps links in the in-memory outbox.
    pub smtp: Option<SmtpConfig>,
    /// Directory for rolling log files, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            bind_port: 8080,
            link_base_url: "http://localhost:8080/verify-email-link".to_string(),
            link_ttl: Duration::from_secs(60 * 60), // 1 hour
            session_event_capacity: 64,
            demo: DemoConfig::default(),
            smtp: None,
            log_dir: None,
        }
    }
}

impl GateConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_port: u16 = env_parse("TRIPGATE_PORT")?.unwrap_or(defaults.bind_port);

        let link_base_url =
            std::env::var("TRIPGATE_LINK_BASE_URL").unwrap_or(defaults.link_base_url);
        if reqwest::Url::parse(&link_base_url).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "TRIPGATE_LINK_BASE_URL".to_string(),
                message: format!("not an absolute URL: {link_base_url}"),
            });
        }

        let link_ttl = env_parse::<u64>("TRIPGATE_LINK_TTL_MINUTES")?
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(defaults.link_ttl);

        let log_dir = std::env::var("TRIPGATE_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            bind_port,
            link_base_url,
            link_ttl,
            session_event_capacity: defaults.session_event_capacity,
            demo: DemoConfig::from_env()?,
            smtp: SmtpConfig::from_env(),
            log_dir,
        })
    }
}

/// Fallback identity settings.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub enabled: bool,
    pub email: String,
    pub display_name: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            email: "demo@travelswipe.com".to_string(),
            display_name: "Demo Explorer".to_string(),
        }
    }
}

impl DemoConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_parse("TRIPGATE_DEMO_ENABLED")?.unwrap_or(defaults.enabled),
            email: std::env::var("TRIPGATE_DEMO_EMAIL").unwrap_or(defaults.email),
            display_name: std::env::var("TRIPGATE_DEMO_NAME").unwrap_or(defaults.display_name),
        })
    }
}

/// SMTP settings for delivering sign-in and verification links.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `TRIPGATE_SMTP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("TRIPGATE_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("TRIPGATE_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("TRIPGATE_SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("TRIPGATE_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("TRIPGATE_SMTP_FROM").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Parse an optional environment variable, rejecting malformed values.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
