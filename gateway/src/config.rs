use dispatch::config::{Config as DispatchConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "gateway".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(flatten)]
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Loads and validates the config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.dispatch.validate()?;

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn gateway_config() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 8080
            admin_listener:
                host: 127.0.0.1
                port: 8081
            nodes:
                - id: "10.0.0.1:8000"
                  url: "http://10.0.0.1:8000"
                  models: [llama3]
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: "https://public@sentry.example.com/1"
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.dispatch.listener.port, 8080);
        assert_eq!(config.dispatch.nodes[0].id, "10.0.0.1:8000");
        assert!(config.dispatch.api_keys.is_none());

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "gateway");

        let logging = config.common.logging.expect("logging config");
        assert_eq!(logging.filter, "info");
        assert!(logging.sentry_dsn.is_some());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 0
            admin_listener:
                host: 127.0.0.1
                port: 8081
            nodes:
                - id: "10.0.0.1:8000"
                  url: "http://10.0.0.1:8000"
                  models: [llama3]
            "#;
        let tmp = write_tmp_file(yaml);
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::Invalid(ValidationError::InvalidPort))
        ));

        let tmp = write_tmp_file("listener: [");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/gateway.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
