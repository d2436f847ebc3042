//! Henhouse I/O daemon (henhouse-iod)
//!
//! Standalone service that:
//! - Owns every physical port (Modbus RTU/TCP, RTU-over-TCP, S7, virtual)
//! - Maintains the data-point cache and runs the equipment controllers
//! - Exposes a minimal diagnostic REST surface for operational visibility
//!
//! Default bind: 0.0.0.0:8088
//! REST API: /health, /api/v1/*

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use henhouse_io_core::config::CoreConfig;
use henhouse_io_core::{api, manager::Manager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,henhouse_io_core=debug")),
        )
        .init();

    info!("Starting Henhouse I/O daemon (henhouse-iod)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = CoreConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let manager = Manager::startup(config).await?;

    let app = api::create_router(manager);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("henhouse-iod listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
