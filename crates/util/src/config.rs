use std::{env, fmt, net::SocketAddr, time::Duration};

use super::{database_url, server_bind_address};

const DEVELOPMENT_SESSION_SECRET: &str = "fieldbook-development-session-secret";
const MIN_SESSION_SECRET_LEN: usize = 16;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_SESSION_TTL_SECS: u64 = 12 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15 * 60;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub db_max_connections: u32,
    pub session_secret: Vec<u8>,
    pub session_ttl: Duration,
    /// Principal the background sweeper acts as. The sweeper is disabled when unset.
    pub system_principal: Option<String>,
    pub sweep_interval: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let session_secret = match env::var("APP_SESSION_SECRET") {
            Ok(value) if value.len() >= MIN_SESSION_SECRET_LEN => value.into_bytes(),
            Ok(_) => return Err(ConfigError::WeakSessionSecret),
            Err(_) if environment == Environment::Production => {
                return Err(ConfigError::MissingSessionSecret)
            }
            Err(_) => DEVELOPMENT_SESSION_SECRET.as_bytes().to_vec(),
        };

        let db_max_connections =
            parse_number("APP_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS as u64)? as u32;
        if db_max_connections == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "APP_DB_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }

        let session_ttl =
            Duration::from_secs(parse_number("APP_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?);
        let sweep_interval = Duration::from_secs(parse_number(
            "APP_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL_SECS,
        )?);

        let system_principal = env::var("APP_SYSTEM_PRINCIPAL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            bind_addr,
            environment,
            database_url: database_url(),
            db_max_connections,
            session_secret,
            session_ttl,
            system_principal,
            sweep_interval,
        })
    }
}

fn parse_number(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingSessionSecret,
    WeakSessionSecret,
    InvalidNumber { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingSessionSecret => {
                write!(f, "APP_SESSION_SECRET must be set in production")
            }
            Self::WeakSessionSecret => write!(
                f,
                "APP_SESSION_SECRET must be at least {MIN_SESSION_SECRET_LEN} bytes"
            ),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ENV_GUARD;
    use crate::{DEFAULT_BIND_ADDR, DEFAULT_DATABASE_URL};

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "APP_DATABASE_URL",
        "APP_DB_MAX_CONNECTIONS",
        "APP_SESSION_SECRET",
        "APP_SESSION_TTL_SECS",
        "APP_SYSTEM_PRINCIPAL",
        "APP_SWEEP_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.db_max_connections, DEFAULT_DB_MAX_CONNECTIONS);
        assert_eq!(config.session_secret, DEVELOPMENT_SESSION_SECRET.as_bytes());
        assert!(config.system_principal.is_none());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn production_requires_session_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::MissingSessionSecret));

        clear_env();
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("APP_SESSION_SECRET", "a-long-enough-production-secret");
        env::set_var("APP_SYSTEM_PRINCIPAL", " 7d1f0c1e-4a55-4d0b-a1c5-2b1f3f8e9a10 ");
        env::set_var("APP_SWEEP_INTERVAL_SECS", "30");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(
            config.system_principal.as_deref(),
            Some("7d1f0c1e-4a55-4d0b-a1c5-2b1f3f8e9a10")
        );
        assert_eq!(config.sweep_interval, Duration::from_secs(30));

        clear_env();
    }

    #[test]
    fn rejects_short_secret_and_bad_numbers() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_SESSION_SECRET", "short");
        let err = AppConfig::from_env().expect_err("short secret should error");
        assert!(matches!(err, ConfigError::WeakSessionSecret));

        clear_env();
        env::set_var("APP_DB_MAX_CONNECTIONS", "many");
        let err = AppConfig::from_env().expect_err("non-numeric pool size should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { var: "APP_DB_MAX_CONNECTIONS", .. }
        ));

        clear_env();
    }
}
