use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::mpsc;

mod btle;
mod channels;
mod codec;
mod config;
mod contacts;
mod dispatch;
mod error;
#[cfg(test)]
mod fakes;
mod history;
mod location;
mod manager;
mod messages;
mod mqtt;
mod permissions;
mod radio;
mod scanner;

use channels::{
    CommandComposer, CommandTextSender, ComposeChannel, DeliveryChannel, DirectSendChannel,
    RelayChannel,
};
use config::{AppConfig, DeliveryMode};
use contacts::{ContactStore, FileContactStore, StaticContacts};
use dispatch::{Delivery, DispatchPipeline};
use history::HistoryLog;
use location::{CommandLocationProvider, LocationAcquirer};
use manager::{LinkManager, LinkSettings};
use messages::{DeliveryOutcome, DispatchPhase, LinkState};
use permissions::{ConfiguredPermissions, Permissions};

const DEFAULT_HISTORY_PATH: &str = "sos-history.json";
const DEFAULT_STUCK_ALERT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(version, about = "Links a panic button and relays its alerts to emergency contacts")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List panic buttons in range
    Scan {
        #[arg(long, default_value_t = 15)]
        seconds: u64,
    },
    /// Connect to a panic button and send an alert whenever it fires
    Monitor {
        /// Radio address of the button; defaults to the first one found
        #[arg(long)]
        device: Option<String>,
    },
    /// Send an alert right now
    Trigger,
    /// Show past alerts, newest first
    History,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let permissions: Arc<dyn Permissions> = Arc::new(ConfiguredPermissions::new(
        config.permissions.clone().unwrap_or_default(),
    ));

    match cli.command {
        Command::Scan { seconds } => scan(&config, permissions, Duration::from_secs(seconds)).await,
        Command::Monitor { device } => monitor(&config, permissions, device).await,
        Command::Trigger => {
            let (pipeline, relay) = build_pipeline(&config, permissions).await?;
            let outcome = pipeline
                .trigger_alert(&|phase| println!("{phase}..."))
                .await;
            report(&outcome);
            if let Some(relay) = relay {
                relay.disconnect().await?;
            }
            Ok(())
        }
        Command::History => {
            let log = HistoryLog::open(history_path(&config)).await;
            if log.is_empty() {
                println!("No alerts recorded");
                return Ok(());
            }
            println!("{} alert(s), newest first", log.len());
            for entry in log.entries() {
                println!(
                    "{} {} {} {}",
                    entry.timestamp.to_rfc3339(),
                    if entry.success { "ok  " } else { "fail" },
                    entry.message,
                    entry.location_link.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

fn history_path(config: &AppConfig) -> String {
    config
        .dispatch
        .as_ref()
        .and_then(|d| d.history_path.clone())
        .unwrap_or(DEFAULT_HISTORY_PATH.to_string())
}

async fn open_link(config: &AppConfig, permissions: Arc<dyn Permissions>) -> LinkManager {
    let settings = LinkSettings::from(&config.link.clone().unwrap_or_default());
    match btle::BtleRadio::new().await {
        Ok(radio) => LinkManager::new(Arc::new(radio), permissions, settings),
        Err(err) => {
            warn!("Bluetooth unavailable: {}", err);
            LinkManager::unavailable(permissions)
        }
    }
}

async fn build_pipeline(
    config: &AppConfig,
    permissions: Arc<dyn Permissions>,
) -> anyhow::Result<(DispatchPipeline, Option<mqtt::MqttClient>)> {
    let dispatch = config.dispatch.clone().unwrap_or_default();
    let location_config = config.location.clone().unwrap_or_default();
    let location = LocationAcquirer::with_config(
        Arc::new(CommandLocationProvider::new(&location_config, permissions.clone())),
        &location_config,
    );
    let contacts: Arc<dyn ContactStore> = match &dispatch.contacts_path {
        Some(path) => Arc::new(FileContactStore::new(path)),
        None => Arc::new(StaticContacts::new(dispatch.contacts.clone().unwrap_or_default())),
    };
    let history = HistoryLog::open(history_path(config)).await;

    let mut relay = None;
    let delivery = match dispatch.mode.unwrap_or_default() {
        DeliveryMode::Direct => {
            let direct: Arc<dyn DeliveryChannel> = Arc::new(DirectSendChannel::new(
                Arc::new(CommandTextSender::new(config.direct_send.clone())),
                permissions.clone(),
            ));
            let compose: Arc<dyn DeliveryChannel> = Arc::new(ComposeChannel::new(Arc::new(
                CommandComposer::new(&config.compose.clone().unwrap_or_default()),
            )));
            Delivery::Direct(vec![direct, compose])
        }
        DeliveryMode::Relay => {
            let mqtt_config = config
                .mqtt
                .as_ref()
                .context("relay mode needs an [mqtt] section")?;
            let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
            let looper = client.clone();
            tokio::task::spawn(async move {
                looper.event_loop(&mut eventloop).await;
            });
            relay = Some(client.clone());
            Delivery::Relay(Arc::new(RelayChannel::new(
                Arc::new(client),
                config.sender.id.clone(),
            )))
        }
    };

    let mut pipeline = DispatchPipeline::new(location, contacts, delivery, history)
        .with_sender_name(config.sender.name.clone().unwrap_or(config.sender.id.clone()));
    if let Some(client) = &relay {
        pipeline = pipeline.with_registration(Arc::new(client.clone()));
    }
    Ok((pipeline, relay))
}

async fn scan(
    config: &AppConfig,
    permissions: Arc<dyn Permissions>,
    duration: Duration,
) -> anyhow::Result<()> {
    let mut link = open_link(config, permissions).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.start_scan(tx).await?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(device) = rx.recv() => println!("{device}"),
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    link.destroy().await;
    Ok(())
}

/// Scan until the first panic button shows up.
async fn first_device(link: &mut LinkManager) -> anyhow::Result<String> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    link.start_scan(tx).await?;
    let device = tokio::select! {
        device = rx.recv() => device.context("scan ended without finding a device")?,
        _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted while scanning"),
    };
    link.stop_scan().await?;
    Ok(device.id)
}

async fn monitor(
    config: &AppConfig,
    permissions: Arc<dyn Permissions>,
    device: Option<String>,
) -> anyhow::Result<()> {
    let (pipeline, relay) = build_pipeline(config, permissions.clone()).await?;
    let pipeline = Arc::new(pipeline);
    let stuck_after = config
        .dispatch
        .as_ref()
        .and_then(|d| d.stuck_alert_seconds)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_STUCK_ALERT);
    let mut link = open_link(config, permissions).await;
    if let Err(err) = link.request_send_permission().await {
        warn!("{}, alerts will not be texted directly", err);
    }

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    link.on_signal(Arc::new(move |signal| {
        let _ = signal_tx.send(signal);
    }));

    let configured = config
        .link
        .as_ref()
        .and_then(|l| l.device)
        .map(|address| address.to_string());
    let target = match device.or(configured) {
        Some(id) => id,
        None => first_device(&mut link).await?,
    };
    link.connect(&target).await?;
    if let Some(device) = link.connected_device() {
        println!("Monitoring {device}, press Ctrl-C to stop");
    }

    let mut state = link.watch_state();
    let mut watchdog = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            Some(signal) = signal_rx.recv() => {
                info!("SOS from {}: {:?}", signal.device_id, signal.text);
                let pipeline = pipeline.clone();
                // Not awaited here so repeated presses meet the in-flight guard
                tokio::task::spawn(async move {
                    let outcome = pipeline.trigger_alert(&log_progress).await;
                    report(&outcome);
                });
            }
            Ok(()) = state.changed() => {
                let current = *state.borrow_and_update();
                if current == LinkState::Error {
                    warn!("Link to {} lost, reconnecting", target);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    if let Err(err) = link.connect(&target).await {
                        error!("Reconnect failed: {}", err);
                        break;
                    }
                }
            }
            _ = watchdog.tick() => {
                if pipeline.reset_if_stuck(stuck_after) {
                    error!("Alert stuck for over {:?}, guard released", stuck_after);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    link.destroy().await;
    if let Some(relay) = relay {
        relay.disconnect().await?;
    }
    Ok(())
}

fn report(outcome: &DeliveryOutcome) {
    let status = if outcome.success { "SENT" } else { "FAILED" };
    println!("{status}: {}", outcome.message);
}

fn log_progress(phase: DispatchPhase) {
    info!("Alert: {}", phase);
}
