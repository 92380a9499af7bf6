use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{Bus, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use store::{SharedStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let store = Store::open(&config.db_path)
        .with_context(|| format!("opening attendance store at {}", config.db_path.display()))?;
    let store = SharedStore::new(store);

    let engine = engine::spawn_engine(&config, store.clone()).context("starting capture engine")?;

    if config.autostart_scan {
        let references = engine.start_scan().await.context("starting scan session")?;
        tracing::info!(references, "scan session started at boot");
    }

    let service = AttendanceService::new(engine, store);
    let builder = match config.bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
