use anyhow::{Context, Result};
use rollcall_core::{ResolutionPipeline, SqliteStorage};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod service;

use config::{BusKind, DaemonConfig};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = DaemonConfig::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        bus = ?config.bus,
        tolerance = config.core.tolerance,
        max_references = config.core.max_references,
        dimension = ?config.core.dimension,
        "configuration loaded"
    );

    // Open storage and load state synchronously (fail-fast)
    let storage = SqliteStorage::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let pipeline = ResolutionPipeline::open(&config.core, Arc::new(storage))?;
    let core = service::CoreHandle::new(pipeline);

    let service = RollcallService::new(core, config.db_path.display().to_string());
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
