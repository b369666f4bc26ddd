use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatrelay_bridge::{BridgeAdapter, BridgeConfig};
use chatrelay_core::BrokerConfig;
use chatrelay_server::ServerConfig;
use chatrelay_telemetry::TelemetryConfig;
use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "chatrelay", about = "Relay one chat session to many WebSocket observers")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, env = "PORT", default_value = "3001")]
    port: u16,

    /// WebSocket URL of the session sidecar.
    #[arg(long, env = "CHATRELAY_BRIDGE_URL", default_value = "ws://127.0.0.1:3002/session")]
    bridge_url: String,

    /// Sender identity stamped on outbound echoes.
    #[arg(long, env = "CHATRELAY_BOT_NAME", default_value = "SaudiBot")]
    bot_name: String,

    /// Seconds to wait for the session to confirm a send.
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    send_timeout_secs: u64,

    /// Per-observer outgoing queue length.
    #[arg(
        long,
        default_value = "256",
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    max_send_queue: usize,

    /// Default log level (RUST_LOG takes precedence).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    chatrelay_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        ..TelemetryConfig::default()
    })?;

    tracing::info!(bridge = %cli.bridge_url, "starting chatrelay");

    let adapter = Arc::new(BridgeAdapter::new(BridgeConfig {
        url: cli.bridge_url,
        send_timeout: Duration::from_secs(cli.send_timeout_secs),
        ..BridgeConfig::default()
    }));

    let (broker, broker_task) = chatrelay_core::launch(
        adapter,
        BrokerConfig {
            bot_identity: cli.bot_name,
            ..BrokerConfig::default()
        },
    )
    .await;

    let server = chatrelay_server::start(
        ServerConfig {
            host: cli.host,
            port: cli.port,
            max_send_queue: cli.max_send_queue,
            ..ServerConfig::default()
        },
        broker,
    )
    .await
    .context("failed to start server")?;

    tracing::info!(port = server.port, "chatrelay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    server.shutdown();
    broker_task.abort();
    Ok(())
}
