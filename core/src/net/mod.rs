//! # Gateway Runtime
//!
//! The tokio side of the gateway. One [`worker::Worker`] task per shard owns
//! an [`Engine`]; the [`listener::ApplicationListener`] accepts application
//! connections and hands their frames to a worker, and a
//! [`bridge::TcpBridge`] serves each network stream the engine opens towards
//! a broker.

pub mod bridge;
pub mod listener;
pub mod worker;

pub use bridge::TcpBridge;
pub use listener::ApplicationListener;
pub use worker::{Worker, WorkerEvent};

use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::client::{
    CreateTopicsProtocol, DeleteTopicsProtocol, DescribeClusterProtocol, DescribeProtocol,
    FetchProtocol, OffsetCommitProtocol, OffsetFetchProtocol, ProduceProtocol,
    RequestClientFactory,
};
use crate::config::GatewayConfig;
use crate::engine::{
    Clock, Engine, RouteResolver, StaticRoutes, SystemClock, CACHE_BINDING, CLIENT_BINDING,
    POOL_BINDING,
};
use crate::fan::{FetchFanFactory, GroupFanFactory, ProduceFanFactory};
use crate::flow::BudgetCreditor;
use crate::metrics::GatewayMetrics;
use crate::pool::ConnectionPoolFactory;
use crate::{FluxgateError, Result};

/// Binds every stream factory of the gateway on `engine`.
pub fn bind_factories(engine: &mut Engine) {
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<DescribeProtocol>::new()));
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<DeleteTopicsProtocol>::new()));
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<CreateTopicsProtocol>::new()));
    engine.bind(
        CLIENT_BINDING,
        Box::new(RequestClientFactory::<DescribeClusterProtocol>::new()),
    );
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<OffsetCommitProtocol>::new()));
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<OffsetFetchProtocol>::new()));
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<ProduceProtocol>::new()));
    engine.bind(CLIENT_BINDING, Box::new(RequestClientFactory::<FetchProtocol>::new()));

    engine.bind(CACHE_BINDING, Box::new(ProduceFanFactory::new()));
    engine.bind(CACHE_BINDING, Box::new(FetchFanFactory::new()));
    engine.bind(CACHE_BINDING, Box::new(GroupFanFactory::new()));

    engine.bind(POOL_BINDING, Box::new(ConnectionPoolFactory::new()));
}

/// Kafka gateway: listener, workers and the state they share.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    routes: Arc<dyn RouteResolver>,
    creditor: Arc<BudgetCreditor>,
    metrics: Arc<GatewayMetrics>,
    clock: Arc<dyn Clock>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate().map_err(FluxgateError::Config)?;
        let routes = StaticRoutes::from_config(&config)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
            creditor: Arc::new(BudgetCreditor::new()),
            metrics: Arc::new(GatewayMetrics::new()),
            clock: Arc::new(SystemClock),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Builds the engine of one shard with every factory bound.
    pub fn engine(&self, shard: usize) -> Engine {
        let mut engine = Engine::new(
            shard,
            Arc::clone(&self.config),
            Arc::clone(&self.routes),
            Arc::clone(&self.creditor),
            Arc::clone(&self.metrics),
            Arc::clone(&self.clock),
        );
        bind_factories(&mut engine);
        engine
    }

    /// Stops the listener and every worker.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Runs until [`Gateway::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.run_until(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("FluxGate listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serves application connections accepted on `listener`.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let workers = self.config.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let peers = Arc::new(senders);

        let mut handles = Vec::with_capacity(workers);
        for (shard, events) in receivers.into_iter().enumerate() {
            let worker = Worker::new(
                self.engine(shard),
                events,
                Arc::clone(&peers),
                self.shutdown_tx.subscribe(),
            );
            handles.push(tokio::spawn(worker.run()));
        }
        info!("FluxGate started {} workers", workers);

        let application = ApplicationListener::new(listener, Arc::clone(&peers));
        let listener_shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            result = application.run(listener_shutdown) => {
                if let Err(e) = result {
                    error!("Application listener failed: {}", e);
                }
            }
            _ = shutdown => {
                info!("Received shutdown signal, stopping gateway...");
            }
        }

        self.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Gateway shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Begin, BeginEx, Frame, FrameHeader, KafkaBeginEx, ProxyBeginEx};

    #[test]
    fn test_invalid_config_rejected() {
        let config = GatewayConfig::default().with_bootstrap(&[]);
        assert!(matches!(Gateway::new(config), Err(FluxgateError::Config(_))));
    }

    #[test]
    fn test_describe_reaches_broker_through_pool() {
        let gateway = Gateway::new(GatewayConfig::default().with_bootstrap(&["seed:9092"])).unwrap();
        let mut engine = gateway.engine(0);
        engine.on_external(Frame::Begin(Begin {
            header: FrameHeader::new(0, CLIENT_BINDING, 1),
            affinity: 0,
            extension: BeginEx::Kafka(KafkaBeginEx::Describe {
                topic: "events".to_string(),
                configs: vec!["retention.ms".to_string()],
            }),
        }));

        let outbound = engine.drain_outbound();
        let addresses: Vec<&ProxyBeginEx> = outbound
            .iter()
            .filter_map(|frame| match frame {
                Frame::Begin(begin) => begin.extension.proxy(),
                _ => None,
            })
            .collect();
        assert_eq!(addresses, vec![&ProxyBeginEx::new("seed", 9092)]);
        // application stream plus client-to-pool and pool-to-broker streams
        assert_eq!(engine.stream_count(), 3);
    }
}
