//! Handles settings for the application. Configuration is written in
//! `settings.toml` and can be overridden with `BILLPAY__`-prefixed
//! environment variables, e.g. `BILLPAY__SERVER__PORT=8080`.
//!
//! See `settings.toml` for the configuration.
use config::{Config, ConfigError, Environment, File};
use engine::{SagaConfig, SimulatedGatewayConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct App {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    Memory,
    Sqlite(String),
}

impl Database {
    pub fn url(&self) -> String {
        match self {
            Database::Memory => String::from("sqlite::memory:"),
            Database::Sqlite(path) => format!("sqlite:{}?mode=rwc", path),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Server {
    pub bind: Option<String>,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: App,
    pub database: Database,
    pub server: Option<Server>,
    #[serde(default)]
    pub saga: SagaConfig,
    #[serde(default)]
    pub gateway: SimulatedGatewayConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_config(
            Config::builder()
                .add_source(File::with_name("settings").required(false))
                .add_source(
                    Environment::with_prefix("BILLPAY")
                        .prefix_separator("__")
                        .separator("__")
                        .try_parsing(true),
                )
                .set_default("database", "memory")?
                .build()?,
        )
    }

    fn from_config(config: Config) -> Result<Self, ConfigError> {
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn parse(toml: &str) -> Settings {
        Settings::from_config(
            Config::builder()
                .add_source(File::from_str(toml, FileFormat::Toml))
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn minimal_settings_fill_in_defaults() {
        let settings = parse(r#"database = "memory""#);
        assert_eq!(settings.app.level, "info");
        assert!(settings.server.is_none());
        assert_eq!(settings.saga.workers, 4);
        assert_eq!(settings.saga.bill_payment.attempts, 3);
        assert_eq!(settings.saga.reversal.delay_ms, 5_000);
        assert!((settings.gateway.success_rate - 0.2).abs() < f64::EPSILON);
        assert_eq!(settings.database.url(), "sqlite::memory:");
    }

    #[test]
    fn full_settings_are_read() {
        let settings = parse(
            r#"
            [app]
            level = "debug"

            [database]
            sqlite = "billpay.db"

            [server]
            bind = "0.0.0.0"
            port = 8080

            [saga]
            workers = 8
            conflict_retries = 5

            [saga.reversal]
            attempts = 7

            [gateway]
            success_rate = 1.0
            min_latency_ms = 0
            max_latency_ms = 10
            "#,
        );
        assert_eq!(settings.app.level, "debug");
        assert_eq!(settings.database.url(), "sqlite:billpay.db?mode=rwc");
        let server = settings.server.unwrap();
        assert_eq!(server.bind.as_deref(), Some("0.0.0.0"));
        assert_eq!(server.port, 8080);
        assert_eq!(settings.saga.workers, 8);
        assert_eq!(settings.saga.conflict_retries, 5);
        assert_eq!(settings.saga.reversal.attempts, 7);
        assert_eq!(settings.saga.reversal.delay_ms, 5_000);
        assert_eq!(settings.saga.reversal.backoff_ms, 3_000);
        assert_eq!(settings.saga.bill_payment.attempts, 3);
        assert_eq!(settings.gateway.max_latency_ms, 10);
    }
}
