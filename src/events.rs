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

//! Event processing and dispatch.
//!
//! Folds driver callbacks and permission changes into the scanner and
//! device state machines.

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::bluetooth::{Device, DeviceId, DriverEvent, Scanner};
use crate::permissions::{PermissionState, Permissions};
use crate::state::BufferPolicy;

/// Process events from the Bluetooth driver.
pub struct EventProcessor {
    scanner: Scanner,
    permissions: Option<Permissions>,
    tracked: Mutex<HashMap<DeviceId, Device>>,
}

impl EventProcessor {
    /// Create a new event processor.
    pub fn new(scanner: Scanner) -> Self {
        Self {
            scanner,
            permissions: None,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new event processor that also forwards permission changes
    /// to the scanner.
    pub fn with_permissions(scanner: Scanner, permissions: Permissions) -> Self {
        Self {
            permissions: Some(permissions),
            ..Self::new(scanner)
        }
    }

    /// Keep routing connection events to `device` after the scan that found
    /// it has ended.
    pub fn track(&self, device: Device) {
        self.tracked.lock().insert(device.id().clone(), device);
    }

    pub fn untrack(&self, id: &DeviceId) {
        self.tracked.lock().remove(id);
    }

    fn find_device(&self, id: &DeviceId) -> Option<Device> {
        if let Some(device) = self.tracked.lock().get(id) {
            return Some(device.clone());
        }
        self.scanner.device(id)
    }

    /// Process a single event.
    pub async fn process_event(&self, event: DriverEvent) -> Result<()> {
        match event {
            DriverEvent::DeviceDiscovered(info) => {
                debug!("Advertisement from {}", info.id);
                self.scanner.device_discovered(info).await?;
            }
            DriverEvent::ConnectionLost(id) => match self.find_device(&id) {
                Some(device) => {
                    info!("Connection lost: {}", id);
                    device.connection_lost().await?;
                }
                None => debug!("Connection lost for unknown device {}", id),
            },
            DriverEvent::AdapterStatusChanged(status) => {
                self.scanner.adapter_status_changed(status).await?;
            }
        }
        Ok(())
    }

    /// Apply a permission state to the scanner. Unsettled states are skipped.
    pub async fn process_permission(&self, state: &PermissionState) -> Result<()> {
        let status = state.status();
        if !status.is_settled() {
            return Ok(());
        }
        self.scanner.permissions_changed(status.is_granted()).await?;
        Ok(())
    }

    /// Run until the driver event channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<DriverEvent>) {
        let mut permission_states: BoxStream<'static, Arc<PermissionState>> = match &self.permissions {
            Some(permissions) => permissions.states(BufferPolicy::Conflate).boxed(),
            None => stream::pending().boxed(),
        };

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Driver event channel closed");
                        break;
                    };
                    if let Err(e) = self.process_event(event).await {
                        error!("Error processing driver event: {}", e);
                    }
                }
                Some(state) = permission_states.next() => {
                    if let Err(e) = self.process_permission(&state).await {
                        error!("Error processing permission change: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::{
        AdapterStatus, ConnectionStatus, DeviceInfo, ScannerSettings, ScannerStatus, SimulatedDriver,
    };
    use crate::permissions::{PermissionStatus, SimulatedPermissions};
    use std::time::Duration;

    fn scanner() -> Scanner {
        let driver = Arc::new(
            SimulatedDriver::new().with_device(DeviceInfo::new(DeviceId::new("01")), vec![]),
        );
        Scanner::new(driver, ScannerSettings::default(), true)
    }

    #[tokio::test]
    async fn test_discovery_and_adapter_events() {
        let scanner = scanner();
        let processor = EventProcessor::new(scanner.clone());
        scanner.start_scanning().await.unwrap();

        processor
            .process_event(DriverEvent::DeviceDiscovered(DeviceInfo::new(DeviceId::new("01"))))
            .await
            .unwrap();
        assert_eq!(scanner.devices().len(), 1);

        processor
            .process_event(DriverEvent::AdapterStatusChanged(AdapterStatus::PoweredOff))
            .await
            .unwrap();
        assert_eq!(scanner.status(), ScannerStatus::Disabled);
    }

    #[tokio::test]
    async fn test_connection_lost_reaches_tracked_device() {
        let scanner = scanner();
        let processor = EventProcessor::new(scanner.clone());
        scanner.start_scanning().await.unwrap();
        scanner
            .device_discovered(DeviceInfo::new(DeviceId::new("01")))
            .await
            .unwrap();

        let device = scanner.device(&DeviceId::new("01")).unwrap();
        processor.track(device.clone());
        device.connect().await.unwrap();
        device.wait_for(|status| status.is_connected()).await.unwrap();

        // The device outlives the scan.
        scanner.stop_scanning().await.unwrap();
        processor
            .process_event(DriverEvent::ConnectionLost(DeviceId::new("01")))
            .await
            .unwrap();
        assert_eq!(
            device.status(),
            ConnectionStatus::Disconnected {
                error: Some("connection lost".to_string())
            }
        );

        // Unknown devices are ignored.
        processor
            .process_event(DriverEvent::ConnectionLost(DeviceId::new("99")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_forwards_permissions() {
        let driver = Arc::new(SimulatedDriver::new());
        let scanner = Scanner::new(driver, ScannerSettings::default(), false);
        let permissions = Permissions::new(Arc::new(SimulatedPermissions::new()));
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(EventProcessor::with_permissions(scanner.clone(), permissions.clone()).run(rx));

        permissions.request().await.unwrap();
        assert_eq!(permissions.wait_for_result().await, PermissionStatus::Granted);

        let mut states = scanner.states(BufferPolicy::Unbounded);
        let idle = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(state) = states.next().await {
                if state.status() == ScannerStatus::Idle {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(idle.ok(), Some(true));

        drop(tx);
        task.await.unwrap();
    }
}
