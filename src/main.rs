// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! btstate demo: runs a scan session against the simulated driver.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use btstate::bluetooth::uuids::{
    service_name, BATTERY_SERVICE_UUID, DEVICE_INFORMATION_UUID, ENVIRONMENTAL_SENSING_UUID,
    HEART_RATE_SERVICE_UUID,
};
use btstate::bluetooth::{
    ConnectionStatus, DeviceId, DeviceInfo, DriverEvent, Scanner, ScannerSettings, ScannerStatus,
    SimulatedDriver,
};
use btstate::permissions::{PermissionStatus, Permissions, SimulatedPermissions};
use btstate::{BufferPolicy, Config, EventProcessor};

fn simulated_driver(events: tokio::sync::mpsc::Sender<DriverEvent>) -> SimulatedDriver {
    SimulatedDriver::new()
        .with_events(events)
        .with_connect_delay(Duration::from_millis(300))
        .with_discovery_interval(Duration::from_millis(400))
        .with_device(
            DeviceInfo::new(DeviceId::new("c4:7c:8d:6a:01:10"))
                .with_name("Chest Strap")
                .with_rssi(-58)
                .with_service(HEART_RATE_SERVICE_UUID),
            vec![HEART_RATE_SERVICE_UUID, BATTERY_SERVICE_UUID, DEVICE_INFORMATION_UUID],
        )
        .with_device(
            DeviceInfo::new(DeviceId::new("d0:5f:b8:22:9a:04"))
                .with_name("Weather Station")
                .with_rssi(-71)
                .with_service(ENVIRONMENTAL_SENSING_UUID),
            vec![ENVIRONMENTAL_SENSING_UUID],
        )
        .with_device(
            DeviceInfo::new(DeviceId::new("f2:10:44:0b:c3:7e")).with_rssi(-89),
            vec![],
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.default_directive.parse()?),
        )
        .init();

    info!("Starting btstate v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", Config::path().display());

    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<DriverEvent>(32);
    let driver = Arc::new(simulated_driver(event_tx));
    let permissions = Permissions::new(Arc::new(SimulatedPermissions::new()));
    let scanner = Scanner::new(driver, ScannerSettings::from(&config), false);

    let processor = EventProcessor::with_permissions(scanner.clone(), permissions.clone());
    let processor_task = tokio::spawn(processor.run(event_rx));

    // Log every scanner state
    let mut scanner_states = scanner.states(BufferPolicy::Unbounded);
    let logger_task = tokio::spawn(async move {
        while let Some(state) = scanner_states.next().await {
            match serde_json::to_string(&state.snapshot()) {
                Ok(json) => info!("Scanner: {}", json),
                Err(e) => warn!("Failed to serialize scanner state: {}", e),
            }
        }
    });

    permissions.request().await?;
    let status = permissions.wait_for_result().await;
    if status != PermissionStatus::Granted {
        return Err(anyhow!("Bluetooth permission {}", status.as_str()));
    }

    let mut states = scanner.states(BufferPolicy::Conflate);
    while let Some(state) = states.next().await {
        if state.status() == ScannerStatus::Idle {
            break;
        }
    }

    scanner.start_scanning().await?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let devices = scanner.devices();
    info!("Found {} device(s)", devices.len());
    scanner.stop_scanning().await?;

    if let Some(device) = devices.into_iter().next() {
        info!("Connecting to {}", device.info().display_name());
        device.connect().await?;

        let connected = tokio::time::timeout(
            Duration::from_secs(5),
            device.wait_for(|status| {
                matches!(
                    status,
                    ConnectionStatus::ServicesDiscovered(_) | ConnectionStatus::Disconnected { .. }
                )
            }),
        )
        .await;

        match connected {
            Ok(Some(state)) => {
                for service in state.services() {
                    info!(
                        "  {} {}",
                        service,
                        service_name(service).unwrap_or("Unknown service")
                    );
                }
                if let ConnectionStatus::Disconnected { error: Some(e) } = state.status() {
                    error!("Connection failed: {}", e);
                }
            }
            Ok(None) => warn!("Device closed while connecting"),
            Err(_) => warn!("Timed out waiting for services"),
        }

        device.disconnect().await?;
        device.wait_for(ConnectionStatus::is_disconnected).await;
        device.close().await;
    }

    scanner.close().await;
    permissions.close().await;
    // The driver keeps the event channel open, stop routing explicitly.
    processor_task.abort();
    let _ = logger_task.await;

    info!("btstate stopped");
    Ok(())
}
