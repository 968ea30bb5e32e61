//! # PV Consumer
//!
//! Drains the meter queue, derives PV and net power for every reading,
//! validates the result and appends it to the record store.
//!
//! Message dispositions:
//! - stored: ack
//! - malformed or out of range: nack without requeue (dropped)
//! - store failure on first delivery: nack with requeue (one more try)
//! - store failure on a redelivery: nack without requeue (dropped)
//! - received after stop was requested: left unsettled; the broker
//!   redelivers it to the next consumer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::SimulationStats;
use crate::broker::{BrokerError, ConnectionFactory, Delivery, Subscription};
use crate::domain::{MeterReading, PVRecord, ValidationError};
use crate::repo::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed meter message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("could not persist record: {0}")]
    Store(#[from] StoreError),
}

/// What to tell the broker about a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    Ack,
    Reject,
    Requeue,
    /// Neither ack nor nack; redelivered after the subscription closes
    Abandon,
}

/// Everything a delivery needs to be processed: the running flag, the
/// store and the counters. Holds no broker state.
#[derive(Clone)]
pub struct MessageHandler {
    running: Arc<AtomicBool>,
    store: Arc<dyn RecordStore>,
    stats: Arc<SimulationStats>,
}

impl MessageHandler {
    pub fn new(
        running: Arc<AtomicBool>,
        store: Arc<dyn RecordStore>,
        stats: Arc<SimulationStats>,
    ) -> Self {
        Self { running, store, stats }
    }

    pub fn handle(&self, delivery: &Delivery) -> Disposition {
        if !self.running.load(Ordering::SeqCst) {
            return Disposition::Abandon;
        }

        match self.process(&delivery.payload) {
            Ok(record) => {
                self.stats.record_persisted();
                debug!(meter = record.meter, pv = record.pv, net = record.net, "processed meter reading");
                Disposition::Ack
            }
            Err(HandlerError::Store(e)) if delivery.redelivered => {
                self.stats.record_persist_failure();
                error!(tag = delivery.tag, error = %e, "failed to persist redelivered record, dropping");
                Disposition::Reject
            }
            Err(HandlerError::Store(e)) => {
                self.stats.record_persist_failure();
                warn!(tag = delivery.tag, error = %e, "failed to persist record, requeueing");
                Disposition::Requeue
            }
            Err(e) => {
                self.stats.record_rejected();
                error!(tag = delivery.tag, error = %e, "error processing meter message");
                Disposition::Reject
            }
        }
    }

    /// Decode, derive, validate and store one payload.
    pub fn process(&self, payload: &[u8]) -> Result<PVRecord, HandlerError> {
        let reading = MeterReading::from_json(payload)?;
        let record = PVRecord::derive(&reading)?;
        self.store.append(&record)?;
        Ok(record)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Upper bound on a single wait for a delivery
    pub poll_timeout: Duration,
}

pub(crate) struct Consumer {
    pub factory: ConnectionFactory,
    pub handler: MessageHandler,
    pub settings: ConsumerSettings,
    /// Run flag of this worker generation
    pub running: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
}

impl Consumer {
    pub async fn run(self) -> Result<(), BrokerError> {
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("stop requested while connecting, consumer exiting");
                return Ok(());
            }
            connected = self.factory.connect() => connected,
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                error!(worker = "consumer", error = %e, "could not connect to broker, consumer exiting");
                return Err(e);
            }
        };
        let mut subscription = match conn.subscribe(self.factory.queue()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(worker = "consumer", error = %e, "could not subscribe, consumer exiting");
                let _ = conn.close().await;
                return Err(e);
            }
        };
        info!(queue = self.factory.queue(), "pv consumer started");

        while self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                polled = tokio::time::timeout(self.settings.poll_timeout, subscription.recv()) => polled,
            };

            match polled {
                // idle poll window, re-check the running flag
                Err(_) => continue,
                Ok(Ok(Some(delivery))) => self.settle(subscription.as_mut(), delivery).await,
                Ok(Ok(None)) => {
                    warn!("subscription cancelled by broker, consumer exiting");
                    break;
                }
                Ok(Err(e)) => {
                    error!(error = %e, "error receiving from broker");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
            }
        }

        // unsettled deliveries go back to the queue
        drop(subscription);
        if let Err(e) = conn.close().await {
            warn!(error = %e, "consumer connection did not close cleanly");
        }
        info!("pv consumer stopped");
        Ok(())
    }

    async fn settle(&self, subscription: &mut dyn Subscription, delivery: Delivery) {
        let tag = delivery.tag;
        let redelivered = delivery.redelivered;
        let handler = self.handler.clone();
        // store writes are blocking file io
        let disposition = match tokio::task::spawn_blocking(move || handler.handle(&delivery)).await {
            Ok(disposition) => disposition,
            Err(e) if redelivered => {
                error!(tag, error = %e, "message handler failed on a redelivery, dropping");
                Disposition::Reject
            }
            Err(e) => {
                error!(tag, error = %e, "message handler failed, requeueing");
                Disposition::Requeue
            }
        };

        let result = match disposition {
            Disposition::Ack => subscription.ack(tag).await,
            Disposition::Reject => subscription.nack(tag, false).await,
            Disposition::Requeue => subscription.nack(tag, true).await,
            Disposition::Abandon => {
                debug!(tag, "stop requested, leaving delivery for redelivery");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(tag, %disposition, error = %e, "failed to settle delivery");
        }
    }
}
