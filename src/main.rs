// ttn-downlink: push one downlink to a LoRaWAN device via The Things Network MQTT API.
// Flow: build envelope -> connect -> publish -> watch device events (bounded) -> disconnect.
// Human-facing output goes to stdout; diagnostics go through tracing on stderr.

mod cli;
mod config;
mod downlink_codec;
mod error;
mod publisher;
mod session;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::TtnConfig;
use crate::downlink_codec::build_envelope;
use crate::error::DownlinkError;
use crate::publisher::{observe, publish, ObserveOutcome};
use crate::session::{DownlinkSession, Session};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<TtnConfig, DownlinkError> {
    let mut cfg = TtnConfig::from_env()?;
    if let Some(region) = cli.region {
        cfg.region = region;
    }
    if let Some(secs) = cli.wait {
        cfg.observe_window = Duration::from_secs(secs);
    }
    Ok(cfg)
}

async fn run<S, C>(cli: &Cli, cfg: &TtnConfig, connect: C) -> Result<(), DownlinkError>
where
    S: DownlinkSession,
    C: FnOnce(&TtnConfig) -> S,
{
    // bad input is reported before any network activity
    let envelope = build_envelope(&cli.payload, cli.port, cli.confirmed())?;

    let mut session = connect(cfg);
    match session.wait_connected(cfg.connect_timeout).await {
        Ok(()) => {
            println!("Connected to TTN ({})", cfg.broker_host());
            if let Err(e) = session.subscribe(&downlink_codec::event_topic_filters(&cfg.app_id, &cfg.device_id)).await {
                warn!(error = %e, "could not subscribe to device events");
            }
        }
        // no retry; the publish below reports the failure to the caller
        Err(e) => println!("Connection error: {e}"),
    }

    println!("Sending downlink: {}", cli.payload);
    let published = match publish(&session, &envelope, &cfg.app_id, &cfg.device_id, cli.queue_op()).await {
        Ok(p) => p,
        Err(e) => {
            session.disconnect().await;
            return Err(e);
        }
    };
    println!("Topic: {}", published.topic);
    println!("Message: {}", published.body);
    println!("Sent {} to port {}", cli.payload, cli.port);

    let outcome = observe(session.events(), cfg.observe_window, envelope.is_confirmed(), |topic, payload| {
        println!("Message received on {}: {}", topic, String::from_utf8_lossy(payload));
    })
    .await;
    match outcome {
        ObserveOutcome::Terminal(ev) => info!(event = ?ev, "downlink reached a final state"),
        ObserveOutcome::TimedOut => info!(window_secs = cfg.observe_window.as_secs(), "no final downlink event within window"),
        ObserveOutcome::Closed => warn!("session closed while observing"),
    }

    session.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let result = match load_config(&cli) {
        Ok(cfg) => run(&cli, &cfg, Session::connect).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "downlink not sent");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
