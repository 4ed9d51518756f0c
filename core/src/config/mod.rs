pub mod settings;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// SASL credentials used by every network-facing client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslConfig {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl SaslConfig {
    pub fn plain(username: &str, password: &str) -> Self {
        Self {
            mechanism: "plain".to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub bootstrap: Vec<String>,
    /// Broker node id to `host:port`, used for leader affinity.
    pub brokers: HashMap<String, String>,
    pub client_id: String,
    pub sasl: Option<SaslConfig>,
    pub workers: usize,
    pub slot_capacity: usize,
    pub slot_count: usize,

    pub client_max_idle_ms: i64,
    pub client_describe_max_age_ms: i64,
    pub client_fetch_max_wait_ms: i32,
    pub client_fetch_max_bytes: i32,
    pub client_fetch_partition_max_bytes: i32,
    pub client_produce_max_response_ms: i32,
    pub client_produce_acks: i16,
    pub client_connection_pool: bool,

    /// Upper bound of the fan reconnect backoff.
    pub cache_server_reconnect_secs: u64,
    pub group_instance_id: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7114,
            bootstrap: vec!["localhost:9092".to_string()],
            brokers: HashMap::new(),
            client_id: "fluxgate".to_string(),
            sasl: None,
            workers: 1,
            slot_capacity: 64 * 1024,
            slot_count: 1024,

            client_max_idle_ms: 60_000,
            client_describe_max_age_ms: 300_000,
            client_fetch_max_wait_ms: 500,
            client_fetch_max_bytes: 50 * 1024 * 1024,
            client_fetch_partition_max_bytes: 1024 * 1024,
            client_produce_max_response_ms: 120_000,
            client_produce_acks: -1,
            client_connection_pool: true,

            cache_server_reconnect_secs: 5,
            group_instance_id: None,
        }
    }
}

impl GatewayConfig {
    pub fn with_bootstrap(mut self, bootstrap: &[&str]) -> Self {
        self.bootstrap = bootstrap.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_broker(mut self, node_id: u64, address: &str) -> Self {
        self.brokers.insert(node_id.to_string(), address.to_string());
        self
    }

    pub fn with_sasl_plain(mut self, username: &str, password: &str) -> Self {
        self.sasl = Some(SaslConfig::plain(username, password));
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_slots(mut self, slot_count: usize, slot_capacity: usize) -> Self {
        self.slot_count = slot_count;
        self.slot_capacity = slot_capacity;
        self
    }

    pub fn with_connection_pool(mut self, enabled: bool) -> Self {
        self.client_connection_pool = enabled;
        self
    }

    pub fn with_describe_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.client_describe_max_age_ms = max_age_ms;
        self
    }

    /// Zero disables fan reconnects.
    pub fn with_reconnect_secs(mut self, reconnect_secs: u64) -> Self {
        self.cache_server_reconnect_secs = reconnect_secs;
        self
    }

    pub fn with_max_idle_ms(mut self, max_idle_ms: i64) -> Self {
        self.client_max_idle_ms = max_idle_ms;
        self
    }

    pub fn broker(&self, node_id: u64) -> Option<&str> {
        self.brokers.get(&node_id.to_string()).map(String::as_str)
    }

    /// Reconnect backoff ceiling in milliseconds.
    pub fn reconnect_max_delay_ms(&self) -> i64 {
        (self.cache_server_reconnect_secs as i64).saturating_mul(1000)
    }

    /// Validate configuration bounds to prevent division-by-zero and resource exhaustion
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.bootstrap.is_empty() {
            return Err("bootstrap must name at least one broker".to_string());
        }
        if let Some(address) = self
            .bootstrap
            .iter()
            .chain(self.brokers.values())
            .find(|address| settings::split_address(address).is_none())
        {
            return Err(format!("invalid broker address '{}'", address));
        }
        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if self.slot_capacity == 0 || self.slot_capacity > i32::MAX as usize {
            return Err("slot_capacity must be > 0 and fit an i32".to_string());
        }
        if self.slot_count == 0 {
            return Err("slot_count must be > 0".to_string());
        }
        if self.client_max_idle_ms <= 0 {
            return Err("client_max_idle_ms must be > 0".to_string());
        }
        if self.client_describe_max_age_ms <= 0 {
            return Err("client_describe_max_age_ms must be > 0".to_string());
        }
        if let Some(sasl) = &self.sasl {
            if !sasl.mechanism.eq_ignore_ascii_case("plain") {
                return Err(format!("unsupported SASL mechanism '{}'", sasl.mechanism));
            }
        }
        Ok(())
    }
}
