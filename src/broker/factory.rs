use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Broker, BrokerConnection, BrokerError, InMemoryBroker};
use crate::config::{BrokerConfig, BrokerKind};
use crate::utils::RetryPolicy;

/// Create the broker backend selected by configuration.
///
/// The AMQP backend is only available when built with the `amqp` feature,
/// so a simulation build can never reach a real broker by accident.
pub fn build_broker(cfg: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match cfg.kind {
        BrokerKind::Memory => Ok(Arc::new(InMemoryBroker::new())),
        #[cfg(feature = "amqp")]
        BrokerKind::Amqp => {
            info!(host = %cfg.host, port = cfg.port, "using AMQP broker");
            Ok(Arc::new(super::amqp::AmqpBroker::new(cfg.amqp_uri())))
        }
        #[cfg(not(feature = "amqp"))]
        BrokerKind::Amqp => {
            anyhow::bail!("broker kind 'amqp' requires building with the 'amqp' feature")
        }
    }
}

/// Opens worker connections: connect, declare the queue, retry on failure.
#[derive(Clone)]
pub struct ConnectionFactory {
    broker: Arc<dyn Broker>,
    queue: String,
    retry: RetryPolicy,
}

impl ConnectionFactory {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            queue: queue.into(),
            retry,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Connect with the retry policy; the last error is returned once exhausted.
    ///
    /// The returned connection has the queue declared.
    pub async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let conn = self
            .retry
            .run("broker connect", || self.open_channel())
            .await?;
        info!(broker = self.broker.name(), queue = %self.queue, "broker connection established");
        Ok(conn)
    }

    /// Single connection attempt, closed right away. For health checks.
    pub async fn probe(&self) -> bool {
        match self.broker.connect().await {
            Ok(mut conn) => {
                if let Err(e) = conn.close().await {
                    debug!(error = %e, "probe connection did not close cleanly");
                }
                true
            }
            Err(e) => {
                warn!(broker = self.broker.name(), error = %e, "broker health probe failed");
                false
            }
        }
    }

    async fn open_channel(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut conn = self.broker.connect().await?;
        conn.declare_queue(&self.queue).await?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn factory(broker: &InMemoryBroker, attempts: u32) -> ConnectionFactory {
        ConnectionFactory::new(
            Arc::new(broker.clone()),
            "meter_queue",
            RetryPolicy::new(attempts, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_connect_declares_queue() {
        let broker = InMemoryBroker::new();
        let mut conn = factory(&broker, 1).connect().await.unwrap();
        conn.publish("meter_queue", b"{}").await.unwrap();
        assert_eq!(broker.queue_depth("meter_queue"), 1);
    }

    #[tokio::test]
    async fn test_connect_retries_transient_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(4);
        assert!(factory(&broker, 5).connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let result = factory(&broker, 5).connect().await;
        assert!(matches!(result, Err(BrokerError::Connect(_))));
        assert_eq!(broker.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn test_probe_reports_reachability() {
        let broker = InMemoryBroker::new();
        let f = factory(&broker, 5);
        assert!(f.probe().await);
        broker.set_online(false);
        assert!(!f.probe().await);
        // probing never retries
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[test]
    fn test_build_memory_broker() {
        let broker = build_broker(&BrokerConfig::default()).unwrap();
        assert_eq!(broker.name(), "in_memory");
    }

    #[cfg(not(feature = "amqp"))]
    #[test]
    fn test_amqp_requires_feature() {
        let cfg = BrokerConfig {
            kind: BrokerKind::Amqp,
            ..Default::default()
        };
        assert!(build_broker(&cfg).is_err());
    }
}
