//! Modbus to WebSocket bridge.
//!
//! Polls one Modbus device and forwards register telemetry to a cloud
//! WebSocket endpoint.

use anyhow::{Context, Result};
use tracing::{error, info};

use cloudlink_bridge_modbus::bridge::Bridge;
use cloudlink_bridge_modbus::channel::{ChannelLink, WsConnector};
use cloudlink_bridge_modbus::commands::LogCommandHandler;
use cloudlink_bridge_modbus::config::ModbusBridgeConfig;
use cloudlink_bridge_modbus::field::{FieldLink, ModbusConnector};
use cloudlink_common::{BridgeArgs, BridgeConfig, init_tracing};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modbus-ws.json5");

    let config = ModbusBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    init_tracing(&log_config).context("Failed to init tracing")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cloudlink-bridge-modbus");
    info!("Loaded configuration from {:?}", args.config);

    let window = config.supervisor.throttle_window();
    let field = FieldLink::new(
        ModbusConnector::from_config(&config.modbus),
        config.modbus.link_options(window),
    );
    let channel = ChannelLink::new(
        WsConnector::new(config.server.url.clone()),
        config.server.link_options(window),
    );

    let bridge = Bridge::new(
        field,
        channel,
        LogCommandHandler,
        config.modbus.poll_spec(),
        config.supervisor.timing(),
    );

    bridge
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Bridge stopped on an orchestration fault")?;

    info!("Modbus bridge stopped");
    Ok(())
}
