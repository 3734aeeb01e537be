//! usb-host-sim
//!
//! Runs the host control plane against a simulated controller. Devices listed
//! in the configuration are attached at startup and enumerated through the
//! regular port-change path.

use anyhow::{Context, Result};
use clap::Parser;
use common::{EventSender, HubEvent, create_event_bridge, setup_logging};
use host::config::HostConfig;
use host::sim::SimulatedController;
use host::{DeviceInfo, PortId, RootHub, spawn_dispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Poll interval while waiting for configured devices to enumerate
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "usb-host-sim")]
#[command(author, version, about = "USB host control plane on a simulated controller")]
#[command(long_about = "
Runs the root hub port monitor, device lifecycle manager and transfer
scheduler against an in-memory host controller.

EXAMPLES:
    # Run with default config
    usb-host-sim

    # Enumerate the configured devices, print them and exit
    usb-host-sim --config host.toml --list-devices

    # Same, as JSON
    usb-host-sim --list-devices --json

    # Run with debug logging
    usb-host-sim --log-level debug

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-host/host.toml
    3. /etc/usb-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Enumerate configured devices, list them and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        host::config::load_config(path).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-host-sim v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (events, receiver) = create_event_bridge(config.host.event_queue_depth);
    let controller = Arc::new(
        SimulatedController::from_settings(&config.controller).with_events(events.clone()),
    );
    let hub = Arc::new(RootHub::new(controller.clone()));
    let dispatcher = spawn_dispatcher(hub.clone(), receiver);

    for device in &config.devices {
        let port = PortId(device.port);
        if let Some(name) = &device.name {
            controller.assign_name(port, name.clone());
        }
        controller.attach(port, device.speed);
    }

    let settled = wait_for_devices(
        &hub,
        config.devices.len(),
        config.transfers.default_timeout,
    )
    .await;
    if !settled {
        warn!(
            "Only {} of {} configured devices enumerated",
            hub.devices().await.len(),
            config.devices.len()
        );
    }
    negotiate_all(&hub, config.transfers.default_timeout).await;

    let result = if args.list_devices {
        list_devices_mode(&hub, args.json).await
    } else {
        info!("Running, press Ctrl-C to stop");
        signal::ctrl_c().await.context("Failed to listen for Ctrl-C")
    };

    info!("Shutting down host controller...");
    shutdown(&hub, events, dispatcher).await;

    result
}

/// Wait until `expected` devices are attached or `timeout` passes
async fn wait_for_devices(
    hub: &RootHub<SimulatedController>,
    expected: usize,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if hub.devices().await.len() >= expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
    }
}

/// Size every device's default control endpoint from its descriptor
async fn negotiate_all(hub: &RootHub<SimulatedController>, timeout: Duration) {
    for info in hub.devices().await {
        let Some(device) = hub.device_at(info.port).await else {
            continue;
        };
        match hub.negotiate_default_endpoint(&device, timeout).await {
            Ok(max_packet_size) => info!(
                "Device '{}' default endpoint: {} bytes",
                device.display_name(),
                max_packet_size
            ),
            Err(e) => warn!(
                "Failed to negotiate default endpoint of '{}': {}",
                device.display_name(),
                e
            ),
        }
    }
}

/// List enumerated devices and exit
async fn list_devices_mode(hub: &RootHub<SimulatedController>, json: bool) -> Result<()> {
    let devices = hub.devices().await;

    if json {
        let output =
            serde_json::to_string_pretty(&devices).context("Failed to serialize device list")?;
        println!("{}", output);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices enumerated.");
    } else {
        println!("Enumerated {} USB device(s):\n", devices.len());
        for device in &devices {
            print_device(device);
        }
    }
    Ok(())
}

fn print_device(device: &DeviceInfo) {
    println!(
        "  [{}] {} on port {}",
        device.id,
        device.name.as_deref().unwrap_or("unnamed"),
        device.port
    );
    println!(
        "      Slot {:03} Address {:03} Speed: {}",
        device.slot.0,
        device.address.map_or(0, |address| address.0),
        device.speed
    );
    println!("      Endpoints: {}", device.endpoints);
    println!();
}

/// Stop the dispatcher, then tear down every device
async fn shutdown(
    hub: &RootHub<SimulatedController>,
    events: EventSender,
    dispatcher: JoinHandle<()>,
) {
    if let Err(e) = events.send(HubEvent::Shutdown).await {
        error!("Error stopping hub dispatcher: {:#}", e);
    }
    if let Err(e) = dispatcher.await {
        error!("Hub dispatcher panicked: {:?}", e);
    }
    hub.shutdown().await;
}
