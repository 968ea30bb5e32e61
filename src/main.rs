use std::sync::Arc;

use anyhow::Result;
use pv_simulator::broker::build_broker;
use pv_simulator::config::Config;
use pv_simulator::repo::{CsvRecordStore, RecordStore};
use pv_simulator::telemetry::{init_tracing, shutdown_signal};
use pv_simulator::SimulationController;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    let _log_guard = init_tracing(&cfg.logging);

    let broker = build_broker(&cfg.broker)?;
    let store: Arc<dyn RecordStore> = Arc::new(CsvRecordStore::new(&cfg.store.path));
    info!(
        broker = %cfg.broker.kind,
        queue = %cfg.broker.queue,
        store = %cfg.store.path.display(),
        "starting PV simulator"
    );

    let controller = SimulationController::new(&cfg, broker, store);
    if !controller.probe().await {
        warn!("broker not reachable yet, workers will retry on connect");
    }
    controller.start().await;

    shutdown_signal().await;
    controller.stop().await;

    match serde_json::to_string(&controller.status().await) {
        Ok(status) => info!(%status, "final simulation status"),
        Err(e) => warn!(error = %e, "could not encode final status"),
    }
    match controller.store().count() {
        Ok(rows) => info!(rows, "shutdown complete"),
        Err(e) => warn!(error = %e, "shutdown complete, results file unreadable"),
    }
    Ok(())
}
