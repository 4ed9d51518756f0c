//! Broker address resolution for network streams.

use std::collections::HashMap;

use super::BindingKind;
use crate::config::settings::split_address;
use crate::config::GatewayConfig;
use crate::frame::ProxyBeginEx;
use crate::{FluxgateError, Result};

/// Resolves the broker a stream of `kind` should be connected to.
///
/// `affinity` is the broker node id requested by the stream, `0` when any
/// broker will do.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, kind: BindingKind, topic: Option<&str>, affinity: u64)
        -> Option<ProxyBeginEx>;
}

/// Routes from configuration: leader affinity first, then the bootstrap list.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    bootstrap: Vec<ProxyBeginEx>,
    brokers: HashMap<u64, ProxyBeginEx>,
}

impl StaticRoutes {
    pub fn new(bootstrap: Vec<ProxyBeginEx>) -> Self {
        Self {
            bootstrap,
            brokers: HashMap::new(),
        }
    }

    pub fn with_broker(mut self, node_id: u64, address: ProxyBeginEx) -> Self {
        self.brokers.insert(node_id, address);
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let parse = |address: &str| {
            split_address(address)
                .map(|(host, port)| ProxyBeginEx::new(host, port))
                .ok_or_else(|| FluxgateError::Config(format!("invalid broker address '{}'", address)))
        };

        let bootstrap = config
            .bootstrap
            .iter()
            .map(|address| parse(address))
            .collect::<Result<Vec<_>>>()?;

        let mut brokers = HashMap::with_capacity(config.brokers.len());
        for (node_id, address) in &config.brokers {
            let node_id = node_id
                .parse::<u64>()
                .map_err(|_| FluxgateError::Config(format!("invalid broker id '{}'", node_id)))?;
            brokers.insert(node_id, parse(address)?);
        }

        Ok(Self { bootstrap, brokers })
    }
}

impl RouteResolver for StaticRoutes {
    fn resolve(
        &self,
        _kind: BindingKind,
        _topic: Option<&str>,
        affinity: u64,
    ) -> Option<ProxyBeginEx> {
        if affinity != 0 {
            if let Some(broker) = self.brokers.get(&affinity) {
                return Some(broker.clone());
            }
        }
        self.bootstrap.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::KafkaKind;

    #[test]
    fn test_affinity_then_bootstrap() {
        let config = GatewayConfig::default()
            .with_bootstrap(&["seed:9092", "seed-2:9092"])
            .with_broker(3, "leader:9093");
        let routes = StaticRoutes::from_config(&config).unwrap();
        let kind = BindingKind::Kafka(KafkaKind::Produce);

        assert_eq!(
            routes.resolve(kind, Some("events"), 3),
            Some(ProxyBeginEx::new("leader", 9093))
        );
        assert_eq!(
            routes.resolve(kind, Some("events"), 7),
            Some(ProxyBeginEx::new("seed", 9092))
        );
        assert_eq!(
            routes.resolve(kind, None, 0),
            Some(ProxyBeginEx::new("seed", 9092))
        );
    }

    #[test]
    fn test_no_bootstrap_no_route() {
        let routes = StaticRoutes::default();
        assert_eq!(routes.resolve(BindingKind::Network, None, 0), None);
    }
}
