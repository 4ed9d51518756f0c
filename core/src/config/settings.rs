use super::GatewayConfig;
use crate::{FluxgateError, Result};
use config::{Config, Environment, File};
use std::path::Path;

impl GatewayConfig {
    /// Loads `FLUXGATE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Loads a config file, then lets `FLUXGATE_*` variables override it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("FLUXGATE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bootstrap"),
            )
            .build()
            .map_err(|e| FluxgateError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<GatewayConfig>()
            .map_err(|e| FluxgateError::Config(e.to_string()))?;

        config.validate().map_err(FluxgateError::Config)?;
        Ok(config)
    }
}

/// Splits `host:port`, `None` when the port is missing or invalid.
pub fn split_address(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("broker-1:9092"), Some(("broker-1", 9092)));
        assert_eq!(split_address("broker-1"), None);
        assert_eq!(split_address(":9092"), None);
        assert_eq!(split_address("broker-1:http"), None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "bootstrap": ["kafka-a:9092", "kafka-b:9092"],
                "brokers": {{ "1": "kafka-a:9092" }},
                "client_id": "edge",
                "workers": 2,
                "sasl": {{ "mechanism": "plain", "username": "alice", "password": "secret" }}
            }}"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bootstrap.len(), 2);
        assert_eq!(config.broker(1), Some("kafka-a:9092"));
        assert_eq!(config.client_id, "edge");
        assert_eq!(config.workers, 2);
        assert_eq!(config.port, 7114);
        assert_eq!(config.sasl.unwrap().username, "alice");
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{ "workers": 0 }}"#).unwrap();
        assert!(matches!(
            GatewayConfig::from_file(file.path()),
            Err(FluxgateError::Config(_))
        ));
    }
}
