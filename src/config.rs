use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub rules: RulesConfig,
    pub logging: LoggingConfig,
    pub kernel: KernelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// Rule file (yaml, toml or json)
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    pub sql_show: bool,
    /// Snowflake worker id
    pub worker_id: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3307)?
            .set_default("rules.path", "./rules.yaml")?
            .set_default("logging.level", "info")?
            .set_default("kernel.sql_show", false)?
            .set_default("kernel.worker_id", 0)?;

        // Load from environment variables
        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Some(port) = parse_env::<u16>("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(path) = env::var("RULES_PATH") {
            builder = builder.set_override("rules.path", path)?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(sql_show) = env::var("SQL_SHOW") {
            builder = builder.set_override("kernel.sql_show", sql_show.eq_ignore_ascii_case("true"))?;
        }

        if let Some(worker_id) = parse_env::<i64>("WORKER_ID") {
            builder = builder.set_override("kernel.worker_id", worker_id)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Typed environment value; an unparseable value is ignored with a warning so the
/// default applies
fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    parse_value(name, &raw)
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {} value `{}`, using the default", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        // Clear environment variables for this test
        env::remove_var("HOST");
        env::remove_var("PORT");
        env::remove_var("RULES_PATH");
        env::remove_var("SQL_SHOW");
        env::remove_var("WORKER_ID");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.server.port, 3307);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.rules.path, "./rules.yaml");
        assert!(!config.kernel.sql_show);
        assert_eq!(config.kernel.worker_id, 0);
        assert_eq!(config.server_address(), "0.0.0.0:3307");
    }

    #[test]
    fn test_invalid_numeric_values_are_ignored() {
        assert_eq!(parse_value::<i64>("WORKER_ID", "7"), Some(7));
        assert_eq!(parse_value::<i64>("WORKER_ID", " 12 "), Some(12));
        assert_eq!(parse_value::<i64>("WORKER_ID", "worker-1"), None);
        assert_eq!(parse_value::<u16>("PORT", "70000"), None);
    }
}
