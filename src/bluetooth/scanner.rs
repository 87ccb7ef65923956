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

//! Scanner state machine.
//!
//! ```text
//! NoHardware   Disabled   MissingPermissions
//!                   \          |
//!                    Idle <-> Scanning { devices }
//! ```
//!
//! The resting status follows the adapter status and the permission grant.
//! Entering `Scanning` starts the driver scan, leaving it stops the scan.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::device::{Device, DeviceSettings, DeviceSnapshot};
use super::driver::{AdapterStatus, BluetoothDriver, DeviceId, DeviceInfo, ScanFilter};
use crate::config::Config;
use crate::state::{BufferPolicy, RepoHandle, State, StateError, StateRepo, StateStream, WorkScope};

/// Scanner status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScannerStatus {
    /// The platform has no Bluetooth adapter.
    NoHardware,
    /// The adapter is powered off.
    Disabled,
    MissingPermissions,
    /// Ready to scan. No devices are retained.
    Idle,
    Scanning,
}

impl ScannerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerStatus::NoHardware => "NoHardware",
            ScannerStatus::Disabled => "Disabled",
            ScannerStatus::MissingPermissions => "MissingPermissions",
            ScannerStatus::Idle => "Idle",
            ScannerStatus::Scanning => "Scanning",
        }
    }

    /// Status to rest in when not scanning.
    fn resting(adapter: AdapterStatus, permitted: bool) -> Self {
        match adapter {
            AdapterStatus::Unavailable => ScannerStatus::NoHardware,
            AdapterStatus::PoweredOff => ScannerStatus::Disabled,
            AdapterStatus::PoweredOn if !permitted => ScannerStatus::MissingPermissions,
            AdapterStatus::PoweredOn => ScannerStatus::Idle,
        }
    }
}

/// Scanner behaviour.
#[derive(Debug, Clone, Default)]
pub struct ScannerSettings {
    /// Stop scanning automatically after this long.
    pub scan_timeout: Option<Duration>,
    pub filter: ScanFilter,
    /// Settings for every discovered device.
    pub device: DeviceSettings,
}

impl From<&Config> for ScannerSettings {
    fn from(config: &Config) -> Self {
        let scan_timeout = match config.scanner.scan_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            scan_timeout,
            filter: ScanFilter {
                services: config.scanner.service_filter.clone(),
            },
            device: DeviceSettings::from(&config.device),
        }
    }
}

struct ScannerContext {
    driver: Arc<dyn BluetoothDriver>,
    settings: ScannerSettings,
    repo: RepoHandle<ScannerState>,
    sessions: AtomicU64,
}

impl ScannerContext {
    /// Return to the resting status if scan `session` is still running.
    fn end_session(&self, session: u64, reason: &'static str) {
        let result = self.repo.enqueue(move |state: Arc<ScannerState>| async move {
            if state.status != ScannerStatus::Scanning || state.session != session {
                debug!("Ignoring stale scan end ({})", reason);
                return Ok(state);
            }
            info!("Scan ended: {}", reason);
            Ok::<_, anyhow::Error>(Arc::new(state.resting()))
        });
        if let Err(e) = result {
            debug!("Dropping scan end: {}", e);
        }
    }
}

/// One state of the scanner.
pub struct ScannerState {
    status: ScannerStatus,
    adapter: AdapterStatus,
    permitted: bool,
    /// Discovered devices in discovery order. Empty unless scanning.
    devices: Vec<Device>,
    session: u64,
    deadline: Option<Instant>,
    ctx: Arc<ScannerContext>,
    scope: WorkScope,
}

impl ScannerState {
    pub fn status(&self) -> ScannerStatus {
        self.status
    }

    pub fn adapter(&self) -> AdapterStatus {
        self.adapter
    }

    pub fn permissions_granted(&self) -> bool {
        self.permitted
    }

    pub fn is_scanning(&self) -> bool {
        self.status == ScannerStatus::Scanning
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|device| device.id() == id)
    }

    /// Serializable view of this state.
    pub fn snapshot(&self) -> ScannerSnapshot {
        ScannerSnapshot {
            status: self.status,
            adapter: self.adapter,
            permissions_granted: self.permitted,
            devices: self.devices.iter().map(DeviceSnapshot::from).collect(),
        }
    }

    fn next(&self, status: ScannerStatus) -> ScannerState {
        ScannerState {
            status,
            adapter: self.adapter,
            permitted: self.permitted,
            devices: Vec::new(),
            session: self.session,
            deadline: None,
            ctx: self.ctx.clone(),
            scope: WorkScope::new(),
        }
    }

    fn resting(&self) -> ScannerState {
        self.next(ScannerStatus::resting(self.adapter, self.permitted))
    }

    fn start_session(&self) -> ScannerState {
        let mut state = self.next(ScannerStatus::Scanning);
        state.session = self.ctx.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        state.deadline = self.ctx.settings.scan_timeout.map(|timeout| Instant::now() + timeout);
        state
    }

    fn with_device(&self, device: Device) -> ScannerState {
        let mut state = self.next(ScannerStatus::Scanning);
        state.deadline = self.deadline;
        state.devices = self.devices.clone();
        state.devices.push(device);
        state
    }

    fn with_adapter(&self, adapter: AdapterStatus) -> ScannerState {
        let mut state = self.next(self.status);
        state.adapter = adapter;
        state.resting()
    }

    fn with_permission(&self, permitted: bool) -> ScannerState {
        let mut state = self.next(self.status);
        state.permitted = permitted;
        state.resting()
    }

    fn arm_timer(&self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let ctx = self.ctx.clone();
        let session = self.session;
        self.scope.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            ctx.end_session(session, "timeout");
        });
    }
}

impl fmt::Debug for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerState")
            .field("status", &self.status)
            .field("adapter", &self.adapter)
            .field("permitted", &self.permitted)
            .field("devices", &self.devices.iter().map(Device::id).collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl State for ScannerState {
    fn name(&self) -> &'static str {
        self.status.as_str()
    }

    fn work_scope(&self) -> Option<&WorkScope> {
        Some(&self.scope)
    }

    async fn after_creating_new_state(&self, new_state: &Self) -> Result<()> {
        if self.is_scanning() && !new_state.is_scanning() {
            // A powered-off adapter has already stopped scanning.
            if new_state.adapter != AdapterStatus::PoweredOn {
                debug!("Adapter {:?}, scan already stopped", new_state.adapter);
                return Ok(());
            }
            info!("Stopping scan");
            self.ctx.driver.stop_scan().await?;
        }
        Ok(())
    }

    async fn after_old_state_is_removed(&self, old_state: &Self) -> Result<()> {
        if !self.is_scanning() {
            return Ok(());
        }
        if !old_state.is_scanning() {
            info!("Starting scan ({})", self.ctx.driver.backend_name());
            if let Err(e) = self.ctx.driver.start_scan(&self.ctx.settings.filter).await {
                warn!("Failed to start scan: {}", e);
                self.ctx.end_session(self.session, "driver failure");
                return Ok(());
            }
        }
        self.arm_timer();
        Ok(())
    }
}

/// Serializable view of a scanner state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannerSnapshot {
    pub status: ScannerStatus,
    pub adapter: AdapterStatus,
    pub permissions_granted: bool,
    pub devices: Vec<DeviceSnapshot>,
}

/// Bluetooth scanner.
#[derive(Clone)]
pub struct Scanner {
    repo: StateRepo<ScannerState>,
}

impl Scanner {
    /// Create a scanner resting in the status implied by the adapter and
    /// the permission grant. Must be called from within a Tokio runtime.
    pub fn new(driver: Arc<dyn BluetoothDriver>, settings: ScannerSettings, permissions_granted: bool) -> Self {
        let adapter = driver.adapter_status();
        let repo = StateRepo::new("scanner", |handle| {
            let ctx = Arc::new(ScannerContext {
                driver,
                settings,
                repo: handle.clone(),
                sessions: AtomicU64::new(0),
            });
            ScannerState {
                status: ScannerStatus::resting(adapter, permissions_granted),
                adapter,
                permitted: permissions_granted,
                devices: Vec::new(),
                session: 0,
                deadline: None,
                ctx,
                scope: WorkScope::new(),
            }
        });
        Self { repo }
    }

    pub fn state(&self) -> Arc<ScannerState> {
        self.repo.current_state()
    }

    pub fn status(&self) -> ScannerStatus {
        self.repo.current_state().status
    }

    pub fn states(&self, policy: BufferPolicy) -> StateStream<Arc<ScannerState>> {
        self.repo.subscribe(policy)
    }

    /// Devices found by the current scan.
    pub fn devices(&self) -> Vec<Device> {
        self.repo.current_state().devices.clone()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.repo.current_state().device(id).cloned()
    }

    /// Start scanning. Ignored unless idle.
    pub async fn start_scanning(&self) -> Result<Arc<ScannerState>, StateError> {
        self.repo
            .change_state(|state: Arc<ScannerState>| async move {
                if state.status != ScannerStatus::Idle {
                    debug!("Cannot scan while {}", state.name());
                    return Ok(state);
                }
                Ok::<_, anyhow::Error>(Arc::new(state.start_session()))
            })
            .await
    }

    /// Stop scanning. Ignored unless scanning.
    pub async fn stop_scanning(&self) -> Result<Arc<ScannerState>, StateError> {
        self.repo
            .change_state(|state: Arc<ScannerState>| async move {
                if !state.is_scanning() {
                    return Ok(state);
                }
                Ok::<_, anyhow::Error>(Arc::new(state.resting()))
            })
            .await
    }

    /// Add a discovered device to the running scan.
    ///
    /// Ignored when not scanning, when the device does not pass the scan
    /// filter, or when it was already discovered.
    pub async fn device_discovered(&self, info: DeviceInfo) -> Result<Arc<ScannerState>, StateError> {
        self.repo
            .change_state(move |state: Arc<ScannerState>| async move {
                if !state.is_scanning()
                    || !state.ctx.settings.filter.matches(&info)
                    || state.device(&info.id).is_some()
                {
                    return Ok(state);
                }
                info!("Discovered {} ({})", info.display_name(), info.id);
                let device = Device::new(info, state.ctx.driver.clone(), state.ctx.settings.device.clone());
                Ok::<_, anyhow::Error>(Arc::new(state.with_device(device)))
            })
            .await
    }

    pub async fn adapter_status_changed(&self, adapter: AdapterStatus) -> Result<Arc<ScannerState>, StateError> {
        self.repo
            .change_state(move |state: Arc<ScannerState>| async move {
                if state.adapter == adapter {
                    return Ok(state);
                }
                info!("Adapter status changed: {:?}", adapter);
                Ok::<_, anyhow::Error>(Arc::new(state.with_adapter(adapter)))
            })
            .await
    }

    pub async fn permissions_changed(&self, granted: bool) -> Result<Arc<ScannerState>, StateError> {
        self.repo
            .change_state(move |state: Arc<ScannerState>| async move {
                if state.permitted == granted {
                    return Ok(state);
                }
                info!("Scan permission {}", if granted { "granted" } else { "revoked" });
                Ok::<_, anyhow::Error>(Arc::new(state.with_permission(granted)))
            })
            .await
    }

    /// Stop any running scan and shut the scanner down.
    pub async fn close(&self) {
        if let Err(e) = self.stop_scanning().await {
            debug!("Stop before close failed: {}", e);
        }
        self.repo.close().await;
    }
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scanner").field(&self.state()).finish()
    }
}
