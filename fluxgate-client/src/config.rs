//! Configuration types for the FluxGate client

use std::time::Duration;

use crate::error::FluxgateClientError;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway listener address as `host:port`
    pub gateway: String,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// How long a stream may wait for its next frame
    pub request_timeout: Duration,
    /// Credit granted to the gateway on every reply stream
    pub reply_window: i32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway: "localhost:7114".to_string(),
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            reply_window: 64 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn new<S: Into<String>>(gateway: S) -> Self {
        Self {
            gateway: gateway.into(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_reply_window(mut self, reply_window: i32) -> Self {
        self.reply_window = reply_window;
        self
    }

    pub fn validate(&self) -> Result<(), FluxgateClientError> {
        if self.gateway.is_empty() {
            return Err(FluxgateClientError::invalid_config("gateway address is empty"));
        }
        if self.reply_window <= 0 {
            return Err(FluxgateClientError::invalid_config(
                "reply window must be positive",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(FluxgateClientError::invalid_config(
                "request timeout must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.gateway, "localhost:7114");
        assert_eq!(config.reply_window, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(ClientConfig::new("").validate().is_err());
        assert!(ClientConfig::default()
            .with_reply_window(0)
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_request_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
