pub mod config;
pub mod health;
pub mod ingress;
pub mod mqtt;
pub mod service;
pub mod store;
pub mod transport;

use crate::config::GatewayConfig;
use crate::health::{StatusReporter, ERROR_STORE_INIT, STATUS_HEALTHY};
use crate::service::{Event, GatewayService};
use crate::store::LogStore;
use crate::transport::client::{TransportClient, ACQUISITION_SOCKET};
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config::config_path();
    let config = GatewayConfig::load(&config_path)?;
    let device_id = config::device_id();
    info!(device_id, config = %config_path.display(), "starting gateway");

    let (reporter, status_rx) = StatusReporter::new();
    spawn_status_logger(status_rx);

    // A broken store degrades the gateway (no durability, no replay) but
    // live forwarding keeps running.
    let store = match LogStore::open(&config::store_path()) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("telemetry store unavailable, running degraded: {e}");
            reporter.report(ERROR_STORE_INIT, "telemetry store init failed");
            None
        }
    };

    let (events_tx, events_rx) = mpsc::channel::<Event>(100);

    // Acquisition daemon link; its events are folded into the service loop.
    let (transport_events_tx, mut transport_events_rx) = mpsc::channel(100);
    let transport = TransportClient::spawn(ACQUISITION_SOCKET, transport_events_tx);
    let into_service = events_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = transport_events_rx.recv().await {
            if into_service.send(Event::Transport(event)).await.is_err() {
                return;
            }
        }
    });

    // Broker session pumps report here, tagged with their generation.
    let (session_tx, mut session_rx) = mpsc::channel(100);
    let into_service = events_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = session_rx.recv().await {
            if into_service.send(Event::Broker(event)).await.is_err() {
                return;
            }
        }
    });

    let service = GatewayService::new(
        config,
        config_path,
        device_id,
        store,
        reporter,
        transport.outgoing.clone(),
        session_tx,
        events_tx,
        events_rx,
    );
    service.run().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Logs every status transition. The watch channel keeps only the latest
/// code, so a consumer coming up late still sees the current health.
fn spawn_status_logger(mut status_rx: tokio::sync::watch::Receiver<u8>) {
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let code = *status_rx.borrow_and_update();
            if code == STATUS_HEALTHY {
                info!("gateway status: healthy");
            } else {
                warn!(code = format!("{code:#04x}"), "gateway status: degraded");
            }
        }
    });
}
