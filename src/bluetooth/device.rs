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

//! Connection state of a single discovered device.
//!
//! Every [`Device`] owns its own state repository, so devices change state
//! independently of each other and of the scanner.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{BluetoothDriver, DeviceId, DeviceInfo};
use crate::config::DeviceConfig;
use crate::state::{BufferPolicy, RepoHandle, State, StateError, StateRepo, StateStream, WorkScope};

/// Connection status of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// Not connected. `error` tells why the last connection ended, if it failed.
    Disconnected { error: Option<String> },
    Connecting,
    /// Connected, services not discovered yet.
    Connected,
    DiscoveringServices,
    /// Connected with known services.
    ServicesDiscovered(Vec<Uuid>),
    Disconnecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected { .. } => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::DiscoveringServices => "DiscoveringServices",
            ConnectionStatus::ServicesDiscovered(_) => "ServicesDiscovered",
            ConnectionStatus::Disconnecting => "Disconnecting",
        }
    }

    /// Whether a link to the device is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected
                | ConnectionStatus::DiscoveringServices
                | ConnectionStatus::ServicesDiscovered(_)
        )
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionStatus::Disconnected { .. })
    }
}

/// Timing and behaviour of device connections.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub connect_timeout: Duration,
    /// Discover services right after connecting.
    pub auto_discover_services: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::from(&DeviceConfig::default())
    }
}

impl From<&DeviceConfig> for DeviceSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            auto_discover_services: config.auto_discover_services,
        }
    }
}

struct DeviceContext {
    info: DeviceInfo,
    driver: Arc<dyn BluetoothDriver>,
    settings: DeviceSettings,
    repo: RepoHandle<DeviceState>,
    epochs: AtomicU64,
}

impl DeviceContext {
    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// Move to `next` if the state with `epoch` is still current.
    ///
    /// Results of work that belongs to a state already left are dropped.
    fn complete(&self, epoch: u64, next: ConnectionStatus) {
        let result = self.repo.enqueue(move |state: Arc<DeviceState>| async move {
            if state.epoch != epoch {
                debug!(
                    "[{}] Ignoring stale result {} in {}",
                    state.ctx.info.id,
                    next.as_str(),
                    state.name()
                );
                return Ok(state);
            }
            Ok::<_, anyhow::Error>(Arc::new(state.with_status(next)))
        });
        if let Err(e) = result {
            debug!("[{}] Dropping result: {}", self.info.id, e);
        }
    }
}

/// One state of a device's connection.
pub struct DeviceState {
    status: ConnectionStatus,
    epoch: u64,
    ctx: Arc<DeviceContext>,
    scope: WorkScope,
}

impl DeviceState {
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn id(&self) -> &DeviceId {
        &self.ctx.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.ctx.info
    }

    /// Services found by the last discovery.
    pub fn services(&self) -> &[Uuid] {
        match &self.status {
            ConnectionStatus::ServicesDiscovered(services) => services,
            _ => &[],
        }
    }

    fn with_status(&self, status: ConnectionStatus) -> DeviceState {
        DeviceState {
            status,
            epoch: self.ctx.next_epoch(),
            ctx: self.ctx.clone(),
            scope: WorkScope::new(),
        }
    }

    fn start_connecting(&self) {
        let ctx = self.ctx.clone();
        let epoch = self.epoch;
        self.scope.spawn(async move {
            let id = &ctx.info.id;
            info!("[{}] Connecting...", id);
            let next = match tokio::time::timeout(ctx.settings.connect_timeout, ctx.driver.connect(id)).await {
                Ok(Ok(())) => {
                    info!("[{}] Connected", id);
                    ConnectionStatus::Connected
                }
                Ok(Err(e)) => {
                    warn!("[{}] Connection failed: {}", id, e);
                    ConnectionStatus::Disconnected {
                        error: Some(e.to_string()),
                    }
                }
                Err(_) => {
                    warn!("[{}] Connection timed out", id);
                    ConnectionStatus::Disconnected {
                        error: Some("connection timed out".to_string()),
                    }
                }
            };
            ctx.complete(epoch, next);
        });
    }

    fn start_discovery(&self) {
        let ctx = self.ctx.clone();
        let epoch = self.epoch;
        self.scope.spawn(async move {
            let id = &ctx.info.id;
            let next = match ctx.driver.discover_services(id).await {
                Ok(services) => {
                    info!("[{}] Discovered {} service(s)", id, services.len());
                    ConnectionStatus::ServicesDiscovered(services)
                }
                Err(e) => {
                    warn!("[{}] Service discovery failed: {}", id, e);
                    ConnectionStatus::Connected
                }
            };
            ctx.complete(epoch, next);
        });
    }

    fn start_disconnecting(&self) {
        let ctx = self.ctx.clone();
        let epoch = self.epoch;
        self.scope.spawn(async move {
            let id = &ctx.info.id;
            let error = match ctx.driver.disconnect(id).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("[{}] Disconnect failed: {}", id, e);
                    Some(e.to_string())
                }
            };
            info!("[{}] Disconnected", id);
            ctx.complete(epoch, ConnectionStatus::Disconnected { error });
        });
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("id", &self.ctx.info.id)
            .field("status", &self.status)
            .finish()
    }
}

#[async_trait]
impl State for DeviceState {
    fn name(&self) -> &'static str {
        self.status.as_str()
    }

    fn work_scope(&self) -> Option<&WorkScope> {
        Some(&self.scope)
    }

    async fn after_old_state_is_removed(&self, old_state: &Self) -> Result<()> {
        match &self.status {
            ConnectionStatus::Connecting => self.start_connecting(),
            ConnectionStatus::Connected
                if old_state.status == ConnectionStatus::Connecting
                    && self.ctx.settings.auto_discover_services =>
            {
                let epoch = self.epoch;
                self.ctx.complete(epoch, ConnectionStatus::DiscoveringServices);
            }
            ConnectionStatus::DiscoveringServices => self.start_discovery(),
            ConnectionStatus::Disconnecting => self.start_disconnecting(),
            _ => {}
        }
        Ok(())
    }
}

/// A discovered device and its connection state.
#[derive(Clone)]
pub struct Device {
    info: DeviceInfo,
    repo: StateRepo<DeviceState>,
}

impl Device {
    /// Create a disconnected device. Must be called from within a Tokio runtime.
    pub fn new(info: DeviceInfo, driver: Arc<dyn BluetoothDriver>, settings: DeviceSettings) -> Self {
        let repo = StateRepo::new(format!("device {}", info.id), |handle| {
            let ctx = Arc::new(DeviceContext {
                info: info.clone(),
                driver,
                settings,
                repo: handle.clone(),
                epochs: AtomicU64::new(0),
            });
            DeviceState {
                status: ConnectionStatus::Disconnected { error: None },
                epoch: ctx.next_epoch(),
                ctx,
                scope: WorkScope::new(),
            }
        });
        Self { info, repo }
    }

    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> Arc<DeviceState> {
        self.repo.current_state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.repo.current_state().status.clone()
    }

    pub fn states(&self, policy: BufferPolicy) -> StateStream<Arc<DeviceState>> {
        self.repo.subscribe(policy)
    }

    /// Start connecting. Ignored unless disconnected.
    pub async fn connect(&self) -> Result<Arc<DeviceState>, StateError> {
        self.transition(|status| match status {
            ConnectionStatus::Disconnected { .. } => Some(ConnectionStatus::Connecting),
            _ => None,
        })
        .await
    }

    /// Start disconnecting. Ignored when already (being) disconnected.
    pub async fn disconnect(&self) -> Result<Arc<DeviceState>, StateError> {
        self.transition(|status| match status {
            ConnectionStatus::Disconnected { .. } | ConnectionStatus::Disconnecting => None,
            _ => Some(ConnectionStatus::Disconnecting),
        })
        .await
    }

    /// (Re)discover services. Ignored unless connected.
    pub async fn discover_services(&self) -> Result<Arc<DeviceState>, StateError> {
        self.transition(|status| match status {
            ConnectionStatus::Connected | ConnectionStatus::ServicesDiscovered(_) => {
                Some(ConnectionStatus::DiscoveringServices)
            }
            _ => None,
        })
        .await
    }

    /// The driver reported that the link dropped.
    pub async fn connection_lost(&self) -> Result<Arc<DeviceState>, StateError> {
        self.transition(|status| match status {
            ConnectionStatus::Disconnected { .. } => None,
            _ => Some(ConnectionStatus::Disconnected {
                error: Some("connection lost".to_string()),
            }),
        })
        .await
    }

    /// Wait until the status satisfies `predicate`.
    ///
    /// Returns `None` if the device was closed first.
    pub async fn wait_for<P>(&self, mut predicate: P) -> Option<Arc<DeviceState>>
    where
        P: FnMut(&ConnectionStatus) -> bool,
    {
        let mut states = self.repo.subscribe(BufferPolicy::Unbounded);
        while let Some(state) = states.next().await {
            if predicate(&state.status) {
                return Some(state);
            }
        }
        None
    }

    pub async fn close(&self) {
        self.repo.close().await;
    }

    async fn transition<F>(&self, next: F) -> Result<Arc<DeviceState>, StateError>
    where
        F: FnOnce(&ConnectionStatus) -> Option<ConnectionStatus> + Send + 'static,
    {
        self.repo
            .change_state(move |state: Arc<DeviceState>| async move {
                match next(&state.status) {
                    Some(status) => Ok::<_, anyhow::Error>(Arc::new(state.with_status(status))),
                    None => Ok(state),
                }
            })
            .await
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Serializable view of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub status: ConnectionStatus,
}

impl From<&Device> for DeviceSnapshot {
    fn from(device: &Device) -> Self {
        Self {
            id: device.info.id.clone(),
            name: device.info.name.clone(),
            rssi: device.info.rssi,
            status: device.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::driver::{DriverCall, DriverOp, SimulatedDriver};
    use crate::bluetooth::uuids::BATTERY_SERVICE_UUID;

    fn device_with(driver: Arc<SimulatedDriver>, settings: DeviceSettings) -> Device {
        Device::new(DeviceInfo::new(DeviceId::new("AA:01")).with_name("Thermometer"), driver, settings)
    }

    fn simulated() -> Arc<SimulatedDriver> {
        Arc::new(
            SimulatedDriver::new()
                .with_device(DeviceInfo::new(DeviceId::new("AA:01")), vec![BATTERY_SERVICE_UUID]),
        )
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let device = device_with(simulated(), DeviceSettings::default());
        assert_eq!(device.status(), ConnectionStatus::Disconnected { error: None });
        assert_eq!(device.state().info().display_name(), "Thermometer");
    }

    #[tokio::test]
    async fn test_connect_discovers_services() {
        let driver = simulated();
        let device = device_with(driver.clone(), DeviceSettings::default());

        let state = device.connect().await.unwrap();
        assert_eq!(state.status(), &ConnectionStatus::Connecting);

        let state = device
            .wait_for(|status| matches!(status, ConnectionStatus::ServicesDiscovered(_)))
            .await
            .unwrap();
        assert_eq!(state.services(), &[BATTERY_SERVICE_UUID]);
        assert!(state.status().is_connected());
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Connect(DeviceId::new("AA:01")),
                DriverCall::DiscoverServices(DeviceId::new("AA:01")),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_without_auto_discovery_stays_connected() {
        let settings = DeviceSettings {
            auto_discover_services: false,
            ..DeviceSettings::default()
        };
        let device = device_with(simulated(), settings);
        device.connect().await.unwrap();
        let state = device.wait_for(|status| *status == ConnectionStatus::Connected).await;
        assert!(state.is_some());

        device.discover_services().await.unwrap();
        let state = device
            .wait_for(|status| matches!(status, ConnectionStatus::ServicesDiscovered(_)))
            .await
            .unwrap();
        assert_eq!(state.services().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_lands_in_disconnected() {
        let driver = simulated();
        driver.set_failing(DriverOp::Connect, true);
        let device = device_with(driver, DeviceSettings::default());

        device.connect().await.unwrap();
        let state = device
            .wait_for(|status| matches!(status, ConnectionStatus::Disconnected { error: Some(_) }))
            .await
            .unwrap();
        assert_eq!(
            state.status(),
            &ConnectionStatus::Disconnected {
                error: Some("simulated Connect failure".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let driver = Arc::new(
            SimulatedDriver::new()
                .with_connect_delay(Duration::from_secs(30))
                .with_device(DeviceInfo::new(DeviceId::new("AA:01")), vec![]),
        );
        let settings = DeviceSettings {
            connect_timeout: Duration::from_millis(20),
            auto_discover_services: true,
        };
        let device = device_with(driver, settings);

        device.connect().await.unwrap();
        let state = device.wait_for(|status| status.is_disconnected()).await.unwrap();
        assert_eq!(
            state.status(),
            &ConnectionStatus::Disconnected {
                error: Some("connection timed out".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect() {
        let driver = simulated();
        let device = device_with(driver.clone(), DeviceSettings::default());
        device.connect().await.unwrap();
        device
            .wait_for(|status| matches!(status, ConnectionStatus::ServicesDiscovered(_)))
            .await
            .unwrap();

        let state = device.disconnect().await.unwrap();
        assert_eq!(state.status(), &ConnectionStatus::Disconnecting);
        let state = device.wait_for(|status| status.is_disconnected()).await.unwrap();
        assert_eq!(state.status(), &ConnectionStatus::Disconnected { error: None });
        assert_eq!(driver.calls().last(), Some(&DriverCall::Disconnect(DeviceId::new("AA:01"))));
    }

    #[tokio::test]
    async fn test_connection_lost() {
        let device = device_with(simulated(), DeviceSettings::default());
        device.connect().await.unwrap();
        device.wait_for(|status| status.is_connected()).await.unwrap();

        let state = device.connection_lost().await.unwrap();
        assert_eq!(
            state.status(),
            &ConnectionStatus::Disconnected {
                error: Some("connection lost".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_stale_connect_result_is_ignored() {
        let driver = Arc::new(
            SimulatedDriver::new()
                .with_connect_delay(Duration::from_millis(50))
                .with_device(DeviceInfo::new(DeviceId::new("AA:01")), vec![]),
        );
        let device = device_with(driver, DeviceSettings::default());

        device.connect().await.unwrap();
        // Leave Connecting before the driver answers.
        device.connection_lost().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(
            device.status(),
            ConnectionStatus::Disconnected {
                error: Some("connection lost".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_operations_in_wrong_status_are_ignored() {
        let device = device_with(simulated(), DeviceSettings::default());
        let before = device.state();
        let after = device.disconnect().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        let after = device.discover_services().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let device = device_with(simulated(), DeviceSettings::default());
        let snapshot = DeviceSnapshot::from(&device);
        assert_eq!(snapshot.id, DeviceId::new("AA:01"));
        assert_eq!(snapshot.name.as_deref(), Some("Thermometer"));
        assert!(snapshot.status.is_disconnected());
    }
}
