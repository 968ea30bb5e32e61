//! # Simulation Controller
//!
//! Owns the running flag and the two worker tasks. States are STOPPED and
//! RUNNING; `start` and `stop` are serialized by an async mutex and
//! `is_running` reads the flag without locking.
//!
//! Every `start` hands its workers a fresh generation flag and shutdown
//! token. A worker detached by a join timeout keeps its own, already
//! cleared, generation and cannot resume after a later restart.

pub mod consumer;
pub mod producer;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, ConnectionFactory};
use crate::config::Config;
use crate::domain::PVRecord;
use crate::repo::{RecordStore, StoreError};
use crate::simulation::{MeterGenerator, MeterGeneratorConfig};

pub use consumer::{ConsumerSettings, Disposition, HandlerError, MessageHandler};
pub use producer::ProducerSettings;
pub use stats::{SimulationStats, StatsSnapshot};

use consumer::Consumer;
use producer::Producer;

/// Lifecycle of one worker task as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No task spawned
    Idle,
    Running,
    /// Task finished while the simulation is still RUNNING
    Exited,
}

impl WorkerState {
    fn of(handle: &JoinHandle<Result<(), BrokerError>>) -> Self {
        if handle.is_finished() {
            WorkerState::Exited
        } else {
            WorkerState::Running
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulationStatus {
    pub running: bool,
    pub producer: WorkerState,
    pub consumer: WorkerState,
    pub stats: StatsSnapshot,
}

struct WorkerTasks {
    /// Run flag of this generation of workers only
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
    producer: JoinHandle<Result<(), BrokerError>>,
    consumer: JoinHandle<Result<(), BrokerError>>,
}

pub struct SimulationController {
    factory: ConnectionFactory,
    store: Arc<dyn RecordStore>,
    meter: MeterGeneratorConfig,
    producer: ProducerSettings,
    consumer: ConsumerSettings,
    join_timeout: Duration,
    max_results: usize,
    running: Arc<AtomicBool>,
    stats: Arc<SimulationStats>,
    tasks: Mutex<Option<WorkerTasks>>,
}

impl SimulationController {
    pub fn new(cfg: &Config, broker: Arc<dyn Broker>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            factory: ConnectionFactory::new(broker, cfg.broker.queue.clone(), cfg.retry.policy()),
            store,
            meter: cfg.producer.meter(),
            producer: ProducerSettings {
                interval: Duration::from_millis(cfg.producer.interval_ms),
                error_backoff: Duration::from_millis(cfg.producer.error_backoff_ms),
            },
            consumer: ConsumerSettings {
                poll_timeout: Duration::from_millis(cfg.consumer.poll_timeout_ms),
            },
            join_timeout: Duration::from_millis(cfg.controller.join_timeout_ms),
            max_results: cfg.store.max_results_returned,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SimulationStats::default()),
            tasks: Mutex::new(None),
        }
    }

    /// Spawn the producer and consumer. Returns false if already running.
    pub async fn start(&self) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return false;
        }

        let active = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);

        let producer = Producer {
            factory: self.factory.clone(),
            generator: MeterGenerator::new(self.meter.clone()),
            settings: self.producer.clone(),
            running: Arc::clone(&active),
            shutdown: shutdown.clone(),
            stats: Arc::clone(&self.stats),
        };
        let consumer = Consumer {
            factory: self.factory.clone(),
            handler: MessageHandler::new(
                Arc::clone(&active),
                Arc::clone(&self.store),
                Arc::clone(&self.stats),
            ),
            settings: self.consumer.clone(),
            running: Arc::clone(&active),
            shutdown: shutdown.clone(),
        };

        *tasks = Some(WorkerTasks {
            active,
            shutdown,
            producer: tokio::spawn(producer.run()),
            consumer: tokio::spawn(consumer.run()),
        });
        info!(queue = self.factory.queue(), "simulation started");
        true
    }

    /// Signal both workers and wait for them, bounded by the join timeout.
    /// Returns false if already stopped.
    pub async fn stop(&self) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(workers) = tasks.take() else {
            return false;
        };

        self.running.store(false, Ordering::SeqCst);
        workers.active.store(false, Ordering::SeqCst);
        workers.shutdown.cancel();

        self.join("producer", workers.producer).await;
        self.join("consumer", workers.consumer).await;
        info!("simulation stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> SimulationStatus {
        let tasks = self.tasks.lock().await;
        let (producer, consumer) = match tasks.as_ref() {
            Some(workers) => (WorkerState::of(&workers.producer), WorkerState::of(&workers.consumer)),
            None => (WorkerState::Idle, WorkerState::Idle),
        };
        SimulationStatus {
            running: self.is_running(),
            producer,
            consumer,
            stats: self.stats.snapshot(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// The most recent persisted records, capped at `store.max_results_returned`.
    pub fn latest_results(&self) -> Result<Vec<PVRecord>, StoreError> {
        self.store.latest(self.max_results)
    }

    /// One-shot broker reachability check
    pub async fn probe(&self) -> bool {
        self.factory.probe().await
    }

    async fn join(&self, worker: &str, mut handle: JoinHandle<Result<(), BrokerError>>) {
        match tokio::time::timeout(self.join_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => info!(worker, "worker finished"),
            Ok(Ok(Err(e))) => warn!(worker, error = %e, "worker had already exited with an error"),
            Ok(Err(e)) => error!(worker, error = %e, "worker task panicked"),
            Err(_) => warn!(
                worker,
                timeout_ms = self.join_timeout.as_millis() as u64,
                "worker did not finish in time, detaching"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::repo::MockRecordStore;

    fn fast_config() -> Config {
        let mut cfg = Config::default();
        cfg.retry.max_attempts = 2;
        cfg.retry.delay_ms = 1;
        cfg.producer.interval_ms = 10;
        cfg.producer.error_backoff_ms = 10;
        cfg.consumer.poll_timeout_ms = 10;
        cfg.controller.join_timeout_ms = 1_000;
        cfg
    }

    fn controller(broker: &InMemoryBroker) -> SimulationController {
        let mut store = MockRecordStore::new();
        store.expect_append().returning(|_| Ok(()));
        SimulationController::new(&fast_config(), Arc::new(broker.clone()), Arc::new(store))
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let ctl = controller(&InMemoryBroker::new());
        assert!(!ctl.is_running());
        assert!(!ctl.stop().await);

        assert!(ctl.start().await);
        assert!(ctl.is_running());
        assert!(!ctl.start().await);
        assert!(ctl.is_running());

        assert!(ctl.stop().await);
        assert!(!ctl.is_running());
        assert!(!ctl.stop().await);
    }

    #[tokio::test]
    async fn test_status_reports_workers() {
        let ctl = controller(&InMemoryBroker::new());
        let idle = ctl.status().await;
        assert!(!idle.running);
        assert_eq!(idle.producer, WorkerState::Idle);
        assert_eq!(idle.consumer, WorkerState::Idle);

        ctl.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = ctl.status().await;
        assert!(status.running);
        assert_eq!(status.producer, WorkerState::Running);
        assert_eq!(status.consumer, WorkerState::Running);
        assert!(status.stats.published >= 1);

        ctl.stop().await;
        assert_eq!(ctl.status().await.producer, WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_dead_workers_are_surfaced_not_restarted() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let ctl = controller(&broker);

        assert!(ctl.start().await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = ctl.status().await;
        assert!(status.running);
        assert_eq!(status.producer, WorkerState::Exited);
        assert_eq!(status.consumer, WorkerState::Exited);
        assert!(ctl.stop().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let ctl = controller(&InMemoryBroker::new());
        assert!(ctl.start().await);
        assert!(ctl.stop().await);
        assert!(ctl.start().await);
        assert!(ctl.is_running());
        assert!(ctl.stop().await);
    }

    #[tokio::test]
    async fn test_restart_does_not_revive_previous_workers() {
        let ctl = controller(&InMemoryBroker::new());
        ctl.start().await;
        let first = Arc::clone(&ctl.tasks.lock().await.as_ref().unwrap().active);
        ctl.stop().await;

        ctl.start().await;
        let second = Arc::clone(&ctl.tasks.lock().await.as_ref().unwrap().active);
        assert!(ctl.is_running());
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
        assert!(!Arc::ptr_eq(&first, &second));
        ctl.stop().await;
    }

    #[tokio::test]
    async fn test_status_serializes_as_snake_case_json() {
        let ctl = controller(&InMemoryBroker::new());
        let json = serde_json::to_value(ctl.status().await).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["producer"], "idle");
        assert_eq!(json["consumer"], "idle");
        assert_eq!(json["stats"]["published"], 0);
        assert_eq!(json["stats"]["persist_failures"], 0);
    }

    #[tokio::test]
    async fn test_probe() {
        let broker = InMemoryBroker::new();
        let ctl = controller(&broker);
        assert!(ctl.probe().await);
        broker.set_online(false);
        assert!(!ctl.probe().await);
    }
}
