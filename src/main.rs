mod connection;
mod permissions;
mod session;
#[cfg(test)]
mod testing;
mod transport;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use connection::{
    AppEvent, BluetoothConfig, BluetoothMode, ConnectionConfig, ConnectionManager, Transports,
};
use pillbox_shared::{
    ConnectionState, DeviceIdentity, DeviceRegistry, DeviceSource, DoseSchedule, Period,
    ScheduleTime,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use transport::{BtDiscovery, BtDiscoveryConfig};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pillbox-link")]
#[command(about = "Dual-transport Bluetooth link to the pill reminder box")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices bonded with the adapter
    Devices {
        /// Also scan for nearby pill boxes
        #[arg(long)]
        scan: bool,
    },

    /// Scan for nearby pill boxes
    Scan {
        /// Scan period in seconds
        #[arg(long, default_value = "10")]
        secs: u64,

        /// Device name fragment to match
        #[arg(long, default_value = "HC-05")]
        name: String,
    },

    /// Connect and forward stdin lines to the device
    Connect {
        /// Bluetooth address of the device
        address: String,

        /// Device name, looked up from bonded devices when omitted
        #[arg(long)]
        name: Option<String>,

        /// Morning reminder time (HH:MM)
        #[arg(long)]
        morning: Option<ScheduleTime>,

        /// Afternoon reminder time (HH:MM)
        #[arg(long)]
        afternoon: Option<ScheduleTime>,

        /// Night reminder time (HH:MM)
        #[arg(long)]
        night: Option<ScheduleTime>,

        /// Use a TCP simulator at this address instead of Bluetooth
        #[arg(long)]
        sim: Option<String>,

        /// Seconds before the stream transport joins the race
        #[arg(long, default_value = "5")]
        fallback_secs: u64,

        /// Scan for nearby pill boxes while connecting; the stream
        /// transport stops the scan before it dials
        #[arg(long)]
        scan: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { scan } => list_devices(scan).await,
        Commands::Scan { secs, name } => scan(secs, name).await,
        Commands::Connect {
            address,
            name,
            morning,
            afternoon,
            night,
            sim,
            fallback_secs,
            scan,
        } => {
            let mut schedule = DoseSchedule::default();
            for (period, time) in [
                (Period::Morning, morning),
                (Period::Afternoon, afternoon),
                (Period::Night, night),
            ] {
                if let Some(time) = time {
                    schedule.set(period, time);
                }
            }
            let wants_schedule = morning.is_some() || afternoon.is_some() || night.is_some();

            let bluetooth = match sim {
                Some(tcp_address) => BluetoothConfig {
                    mode: BluetoothMode::TcpSimulation,
                    tcp_address,
                },
                None => BluetoothConfig::default(),
            };
            let config = ConnectionConfig {
                fallback_delay: Duration::from_secs(fallback_secs),
                bluetooth,
                ..Default::default()
            };

            let discovery = Arc::new(BtDiscovery::new(BtDiscoveryConfig::default()));
            let device = resolve_device(&config, &discovery, address, name).await;
            if scan && config.bluetooth.mode == BluetoothMode::Bluez {
                tokio::spawn(scan_nearby(discovery.clone()));
            }
            run_link(config, discovery, device, wants_schedule.then_some(schedule)).await
        }
    }
}

async fn list_devices(with_scan: bool) -> Result<()> {
    let adapter = BtDiscovery::get_adapter().await?;
    let discovery = BtDiscovery::new(BtDiscoveryConfig::default());
    let mut registry = DeviceRegistry::new();
    discovery
        .refresh_registry(&adapter, &mut registry, with_scan)
        .await?;

    if registry.is_empty() {
        println!("No devices found");
    }
    for (i, (label, device)) in registry.labels().iter().zip(registry.iter()).enumerate() {
        let source = match registry.source(device.address()) {
            Some(DeviceSource::Scanned) => " (nearby)",
            _ => "",
        };
        println!("{:>2}. {}{}", i + 1, label, source);
    }
    Ok(())
}

async fn scan(secs: u64, name: String) -> Result<()> {
    let adapter = BtDiscovery::get_adapter().await?;
    let discovery = BtDiscovery::new(BtDiscoveryConfig {
        scan_duration: Duration::from_secs(secs),
        name_pattern: Some(name),
    });

    let mut registry = DeviceRegistry::new();
    for found in discovery.scan(&adapter).await? {
        let rssi = found
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "n/a".into());
        if registry.insert(found.identity.clone(), DeviceSource::Scanned) {
            println!("{} ({})", found.identity, rssi);
        }
    }
    if registry.is_empty() {
        println!("No matching devices found");
    }
    Ok(())
}

/// Fill in the device name from bonded devices when it was not given
async fn resolve_device(
    config: &ConnectionConfig,
    discovery: &BtDiscovery,
    address: String,
    name: Option<String>,
) -> DeviceIdentity {
    if name.is_some() || config.bluetooth.mode == BluetoothMode::TcpSimulation {
        return DeviceIdentity::new(address, name);
    }

    let lookup = async {
        let adapter = BtDiscovery::get_adapter().await?;
        let mut registry = DeviceRegistry::new();
        discovery
            .refresh_registry(&adapter, &mut registry, false)
            .await?;
        registry
            .get(&address)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not bonded", address))
    };

    match lookup.await {
        Ok(device) => device,
        Err(e) => {
            warn!("[BT] Name lookup failed: {}", e);
            DeviceIdentity::new(address, None)
        }
    }
}

/// Log nearby pill boxes until the scan ends or a stream connect cancels it
async fn scan_nearby(discovery: Arc<BtDiscovery>) {
    let result = async {
        let adapter = BtDiscovery::get_adapter().await?;
        discovery.scan(&adapter).await
    }
    .await;

    match result {
        Ok(found) => {
            for device in found {
                info!("[BT] Nearby: {}", device.identity);
            }
        }
        Err(e) => warn!("[BT] Scan failed: {}", e),
    }
}

async fn run_link(
    config: ConnectionConfig,
    discovery: Arc<BtDiscovery>,
    device: DeviceIdentity,
    schedule: Option<DoseSchedule>,
) -> Result<()> {
    let transports = Transports::for_config(&config.bluetooth, discovery);
    let mut manager = ConnectionManager::new(config, transports);
    let handle = manager.handle();

    info!("Pill box link starting: {}", device);
    manager.request_connection(device.clone()).await?;

    // Spawn stdin reader
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut schedule = schedule;

    // Main event loop
    loop {
        tokio::select! {
            event = manager.recv() => match event {
                Some(AppEvent::State(state)) => {
                    info!("State: {}", state);
                    if state == ConnectionState::Connected {
                        if let Some(schedule) = schedule.take() {
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle.send_schedule(&schedule).await {
                                    error!("Schedule not sent: {}", e);
                                }
                            });
                        }
                    }
                }
                Some(AppEvent::Message(message)) => info!("{}", message),
                Some(AppEvent::Advisory(advisory)) => warn!("{}", advisory),
                Some(AppEvent::ShowReminder { payload }) => info!("[REMINDER] {}", payload),
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },
            line = line_rx.recv() => match line.as_deref().map(str::trim) {
                None | Some("/quit") => break,
                Some("/disconnect") => manager.disconnect().await,
                Some("/connect") => {
                    if let Err(e) = manager.request_connection(device.clone()).await {
                        error!("{}", e);
                    }
                }
                Some("") => {}
                Some(text) => {
                    if let Err(e) = manager.send(format!("{}\n", text)).await {
                        error!("{}", e);
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.disconnect().await;
    info!("Pill box link stopped");
    Ok(())
}
