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

//! Bluetooth driver abstraction.
//!
//! States call into a [`BluetoothDriver`] from their hooks; the driver
//! reports asynchronous callbacks as [`DriverEvent`]s.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bluetooth device address, e.g. `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advertisement data of a discovered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Service UUIDs included in the advertisement.
    pub advertised_services: Vec<Uuid>,
    pub discovered_at: DateTime<Local>,
}

impl DeviceInfo {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            name: None,
            rssi: None,
            advertised_services: Vec::new(),
            discovered_at: Local::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.advertised_services.push(service);
        self
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterStatus {
    /// No Bluetooth hardware present.
    Unavailable,
    PoweredOff,
    PoweredOn,
}

/// Filter applied when scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services. Empty means all.
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.services.is_empty()
            || info
                .advertised_services
                .iter()
                .any(|service| self.services.contains(service))
    }
}

/// Callbacks from the driver.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A device was seen while scanning.
    DeviceDiscovered(DeviceInfo),
    /// A connected device dropped its connection.
    ConnectionLost(DeviceId),
    /// The adapter was powered on or off.
    AdapterStatusChanged(AdapterStatus),
}

/// Platform Bluetooth access.
#[async_trait]
pub trait BluetoothDriver: Send + Sync {
    /// Get the backend name.
    fn backend_name(&self) -> &'static str;

    /// Current adapter status.
    fn adapter_status(&self) -> AdapterStatus;

    /// Start discovering devices.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop discovering devices.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection to a device.
    async fn connect(&self, id: &DeviceId) -> Result<()>;

    /// Close the connection to a device.
    async fn disconnect(&self, id: &DeviceId) -> Result<()>;

    /// Discover the GATT services of a connected device.
    async fn discover_services(&self, id: &DeviceId) -> Result<Vec<Uuid>>;
}

/// Driver operation kinds, used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    DiscoverServices,
}

/// A call recorded by [`SimulatedDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
}

/// In-memory driver for tests and demos.
///
/// Advertises a fixed set of devices while scanning, records every call and
/// can be told to fail individual operations.
pub struct SimulatedDriver {
    status: RwLock<AdapterStatus>,
    devices: RwLock<Vec<DeviceInfo>>,
    services: RwLock<HashMap<DeviceId, Vec<Uuid>>>,
    failing: Mutex<HashSet<DriverOp>>,
    calls: Mutex<Vec<DriverCall>>,
    connect_delay: Duration,
    discovery_interval: Duration,
    events: Option<mpsc::Sender<DriverEvent>>,
    advertiser: Mutex<Option<AbortHandle>>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self {
            status: RwLock::new(AdapterStatus::PoweredOn),
            devices: RwLock::new(Vec::new()),
            services: RwLock::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            connect_delay: Duration::ZERO,
            discovery_interval: Duration::from_millis(100),
            events: None,
            advertiser: Mutex::new(None),
        }
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report discoveries and status changes on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<DriverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_status(self, status: AdapterStatus) -> Self {
        *self.status.write() = status;
        self
    }

    /// Add a device advertised while scanning, exposing `services` once connected.
    pub fn with_device(self, info: DeviceInfo, services: Vec<Uuid>) -> Self {
        self.services.write().insert(info.id.clone(), services);
        self.devices.write().push(info);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Make `op` fail until reset.
    pub fn set_failing(&self, op: DriverOp, failing: bool) {
        let mut ops = self.failing.lock();
        if failing {
            ops.insert(op);
        } else {
            ops.remove(&op);
        }
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    /// Whether a scan is currently advertising devices.
    pub fn is_scanning(&self) -> bool {
        self.advertiser.lock().is_some()
    }

    /// Change the adapter status and report it. Leaving `PoweredOn` ends
    /// any running scan.
    pub async fn set_adapter_status(&self, status: AdapterStatus) {
        *self.status.write() = status;
        if status != AdapterStatus::PoweredOn {
            if let Some(task) = self.advertiser.lock().take() {
                task.abort();
            }
        }
        self.emit(DriverEvent::AdapterStatusChanged(status)).await;
    }

    /// Report that a device dropped its connection.
    pub async fn drop_connection(&self, id: &DeviceId) {
        self.emit(DriverEvent::ConnectionLost(id.clone())).await;
    }

    async fn emit(&self, event: DriverEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    fn record(&self, call: DriverCall, op: DriverOp) -> Result<()> {
        debug!("[SIM] {:?}", call);
        self.calls.lock().push(call);
        if self.failing.lock().contains(&op) {
            return Err(anyhow!("simulated {:?} failure", op));
        }
        if *self.status.read() != AdapterStatus::PoweredOn {
            return Err(anyhow!("adapter is not powered on"));
        }
        Ok(())
    }
}

#[async_trait]
impl BluetoothDriver for SimulatedDriver {
    fn backend_name(&self) -> &'static str {
        "Simulated"
    }

    fn adapter_status(&self) -> AdapterStatus {
        *self.status.read()
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        self.record(DriverCall::StartScan, DriverOp::StartScan)?;

        let Some(events) = self.events.clone() else {
            info!("[SIM] Scan started without an event channel");
            return Ok(());
        };

        let devices: Vec<DeviceInfo> = self
            .devices
            .read()
            .iter()
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();
        let interval = self.discovery_interval;

        let task = tokio::spawn(async move {
            for info in devices {
                tokio::time::sleep(interval).await;
                let info = DeviceInfo {
                    discovered_at: Local::now(),
                    ..info
                };
                if events.send(DriverEvent::DeviceDiscovered(info)).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.advertiser.lock().replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(task) = self.advertiser.lock().take() {
            task.abort();
        }
        self.record(DriverCall::StopScan, DriverOp::StopScan)
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.record(DriverCall::Connect(id.clone()), DriverOp::Connect)?;
        if !self.services.read().contains_key(id) {
            warn!("[SIM] Unknown device: {}", id);
            return Err(anyhow!("device {} is out of range", id));
        }
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.record(DriverCall::Disconnect(id.clone()), DriverOp::Disconnect)
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<Vec<Uuid>> {
        self.record(DriverCall::DiscoverServices(id.clone()), DriverOp::DiscoverServices)?;
        Ok(self.services.read().get(id).cloned().unwrap_or_default())
    }
}
