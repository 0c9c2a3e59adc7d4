//! Sends a single command to a plant-pot controller and prints its reply.
//!
//! The broker is read from `--broker`, then from the `MQTT_BROKER_URL`
//! environment variable. The telemetry of the devices passed with
//! `--device` is logged while waiting for the reply.
//!
//! ```text
//! pot-call --device pot_1 /pot_1/add '{"frequency": 3, "dosage": 200}'
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use potlink_bridge::bridge::{Bridge, Call};
use potlink_bridge::collaborators::{Collaborators, StaticDevices};
use potlink_bridge::config::{BROKER_URL_VAR, BridgeConfig, CALL_TIMEOUT_VAR, CLIENT_ID_VAR};
use potlink_bridge::error::Result;

use serde_json::Value;

use tokio_util::sync::CancellationToken;

use tracing::{Level, error, info, warn};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Broker URL, such as `mqtt://localhost:1883`.
    #[arg(long)]
    broker: Option<String>,

    /// MQTT client identifier.
    #[arg(long, default_value = "pot-call")]
    client_id: String,

    /// Device whose topics are subscribed, can be repeated.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Seconds to wait for the reply.
    #[arg(long)]
    timeout: Option<u64>,

    /// Request topic, such as `/pot_1/activate`.
    topic: String,

    /// JSON object sent as payload.
    #[arg(default_value = "{}")]
    payload: String,
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        broker,
        client_id,
        devices,
        timeout,
        topic,
        payload,
    } = cli;

    // Command line arguments take precedence over the environment.
    let config = BridgeConfig::from_lookup(|key: &str| match key {
        BROKER_URL_VAR => broker.clone().or_else(|| std::env::var(key).ok()),
        CLIENT_ID_VAR => Some(client_id.clone()),
        CALL_TIMEOUT_VAR => timeout
            .map(|secs| secs.to_string())
            .or_else(|| std::env::var(key).ok()),
        _ => std::env::var(key).ok(),
    })?;

    let payload = serde_json::from_str::<Value>(&payload)?;

    info!("Connecting to `{}`", config.broker());
    let bridge = Bridge::connect(
        config,
        Collaborators::tracing(Arc::new(StaticDevices::new(devices))),
    )
    .await?;

    let cancellation = CancellationToken::new();
    let ctrl_c = cancellation.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the call");
            ctrl_c.cancel();
        }
    });

    let result = bridge
        .call(Call::new(topic, payload).cancellation(cancellation))
        .await;
    bridge.shutdown().await;

    let reply = result?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
