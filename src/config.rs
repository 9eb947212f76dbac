use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, error};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// First port to try when binding
    #[serde(default = "default_port")]
    pub port: u16,

    /// How many successive ports to try before giving up
    #[serde(default = "default_port_retry_attempts")]
    pub port_retry_attempts: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Tracing filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds an empty session is kept alive before it is destroyed
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Seconds after which a presence entry without refresh is considered stale
    #[serde(default = "default_awareness_timeout_secs")]
    pub awareness_timeout_secs: u64,

    /// Outbound frames buffered per connection before it is dropped as unresponsive
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_secs(self.awareness_timeout_secs)
    }

    /// Parsed list of allowed CORS origins, empty when unset
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_retry_attempts: default_port_retry_attempts(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            grace_period_secs: default_grace_period_secs(),
            awareness_timeout_secs: default_awareness_timeout_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_port_retry_attempts() -> u16 {
    10
}

fn default_log_level() -> String {
    "collab_sync=debug,tower_http=debug,axum::rejection=trace,info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_awareness_timeout_secs() -> u64 {
    30
}

fn default_outbound_buffer() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.grace_period(), Duration::from_secs(30));
        assert_eq!(config.awareness_timeout(), Duration::from_secs(30));
        assert!(config.is_development());
    }

    #[test]
    fn default_log_level_is_a_valid_filter() {
        let config = Config::default();
        assert!(tracing_subscriber::EnvFilter::try_new(&config.log_level).is_ok());
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = Config {
            cors_origins: Some("http://a.test, http://b.test,,".to_string()),
            ..Config::default()
        };
        assert_eq!(config.cors_origin_list(), vec!["http://a.test", "http://b.test"]);
        assert!(Config::default().cors_origin_list().is_empty());
    }
}
