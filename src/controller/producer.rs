//! # Meter Producer
//!
//! Publishes one validated meter reading per interval onto the shared queue.
//!
//! Failure handling:
//! - connection retries exhausted: fatal, the task ends with the error
//! - reading out of range: the tick is skipped, nothing is published
//! - publish failure: logged, short back-off, loop continues on the same connection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::SimulationStats;
use crate::broker::{BrokerConnection, BrokerError, ConnectionFactory};
use crate::domain::{MeterReading, ValidationError};
use crate::simulation::MeterGenerator;

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub interval: Duration,
    pub error_backoff: Duration,
}

pub(crate) struct Producer {
    pub factory: ConnectionFactory,
    pub generator: MeterGenerator,
    pub settings: ProducerSettings,
    /// Run flag of this worker generation
    pub running: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
    pub stats: Arc<SimulationStats>,
}

enum TickError {
    Validation(ValidationError),
    Encode(serde_json::Error),
    Publish(BrokerError),
}

impl Producer {
    pub async fn run(mut self) -> Result<(), BrokerError> {
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("stop requested while connecting, producer exiting");
                return Ok(());
            }
            connected = self.factory.connect() => connected,
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                error!(worker = "producer", error = %e, "could not connect to broker, producer exiting");
                return Err(e);
            }
        };
        info!(queue = self.factory.queue(), interval_ms = self.settings.interval.as_millis() as u64, "meter producer started");

        while self.is_active() {
            let pause = match self.tick(conn.as_mut()).await {
                Ok(reading) => {
                    self.stats.record_published();
                    debug!(meter_kw = reading.meter, "sent meter reading");
                    self.settings.interval
                }
                Err(TickError::Validation(e)) => {
                    self.stats.record_skipped();
                    warn!(error = %e, "meter reading failed validation, skipping tick");
                    self.settings.interval
                }
                Err(TickError::Encode(e)) => {
                    self.stats.record_skipped();
                    error!(error = %e, "could not encode meter reading");
                    self.settings.interval
                }
                Err(TickError::Publish(e)) => {
                    self.stats.record_publish_failure();
                    error!(error = %e, "error in meter producer");
                    self.settings.error_backoff
                }
            };
            self.pause(pause).await;
        }

        if let Err(e) = conn.close().await {
            warn!(error = %e, "producer connection did not close cleanly");
        }
        info!("meter producer stopped");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    async fn tick(&mut self, conn: &mut dyn BrokerConnection) -> Result<MeterReading, TickError> {
        let reading = MeterReading::new(now(), self.generator.sample_kw())
            .map_err(TickError::Validation)?;
        let payload = reading.to_json().map_err(TickError::Encode)?;
        conn.publish(self.factory.queue(), &payload)
            .await
            .map_err(TickError::Publish)?;
        Ok(reading)
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

/// Local wall-clock time at microsecond precision.
fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    let micros = now.nanosecond() / 1_000 * 1_000;
    now.with_nanosecond(micros).unwrap_or(now)
}
