//! Integration tests for the scanner and device flow.

use btstate::bluetooth::uuids::{BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID};
use btstate::bluetooth::{
    ConnectionStatus, DeviceId, DeviceInfo, DriverCall, DriverEvent, DriverOp, Scanner,
    ScannerSettings, ScannerState, ScannerStatus, SimulatedDriver,
};
use btstate::{BufferPolicy, EventProcessor, StateStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STRAP: &str = "C4:7C:8D:6A:01:10";

fn driver(events: mpsc::Sender<DriverEvent>) -> Arc<SimulatedDriver> {
    Arc::new(
        SimulatedDriver::new()
            .with_events(events)
            .with_discovery_interval(Duration::from_millis(10))
            .with_device(
                DeviceInfo::new(DeviceId::new(STRAP))
                    .with_name("Chest Strap")
                    .with_service(HEART_RATE_SERVICE_UUID),
                vec![HEART_RATE_SERVICE_UUID, BATTERY_SERVICE_UUID],
            ),
    )
}

fn start(driver: Arc<SimulatedDriver>, events: mpsc::Receiver<DriverEvent>) -> Scanner {
    let scanner = Scanner::new(driver, ScannerSettings::default(), true);
    tokio::spawn(EventProcessor::new(scanner.clone()).run(events));
    scanner
}

async fn next_state(states: &mut StateStream<Arc<ScannerState>>) -> (ScannerStatus, Vec<String>) {
    let state = tokio::time::timeout(Duration::from_secs(2), states.next())
        .await
        .unwrap()
        .unwrap();
    let ids = state.devices().iter().map(|d| d.id().to_string()).collect();
    (state.status(), ids)
}

#[tokio::test]
async fn test_scan_session_is_observed_exactly() {
    let (tx, rx) = mpsc::channel(16);
    let driver = driver(tx);
    let scanner = start(driver.clone(), rx);

    let mut states = scanner.states(BufferPolicy::Unbounded);
    let mut seen = Vec::new();

    seen.push(next_state(&mut states).await);
    scanner.start_scanning().await.unwrap();
    seen.push(next_state(&mut states).await);
    seen.push(next_state(&mut states).await);
    scanner.stop_scanning().await.unwrap();
    seen.push(next_state(&mut states).await);

    assert_eq!(
        seen,
        vec![
            (ScannerStatus::Idle, vec![]),
            (ScannerStatus::Scanning, vec![]),
            (ScannerStatus::Scanning, vec![STRAP.to_string()]),
            (ScannerStatus::Idle, vec![]),
        ]
    );
    assert_eq!(driver.calls(), vec![DriverCall::StartScan, DriverCall::StopScan]);
    assert!(!driver.is_scanning());
}

async fn discovered_strap(scanner: &Scanner) -> btstate::bluetooth::Device {
    scanner.start_scanning().await.unwrap();
    let mut states = scanner.states(BufferPolicy::Unbounded);
    let found = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(state) = states.next().await {
            if let Some(device) = state.device(&DeviceId::new(STRAP)) {
                return Some(device.clone());
            }
        }
        None
    })
    .await;
    found.ok().flatten().unwrap()
}

#[tokio::test]
async fn test_connect_discovered_device() {
    let (tx, rx) = mpsc::channel(16);
    let driver = driver(tx);
    let scanner = start(driver.clone(), rx);
    let device = discovered_strap(&scanner).await;

    device.connect().await.unwrap();
    let state = device
        .wait_for(|status| matches!(status, ConnectionStatus::ServicesDiscovered(_)))
        .await
        .unwrap();
    assert_eq!(state.services(), &[HEART_RATE_SERVICE_UUID, BATTERY_SERVICE_UUID]);
    assert_eq!(state.info().display_name(), "Chest Strap");

    device.disconnect().await.unwrap();
    let state = device.wait_for(ConnectionStatus::is_disconnected).await.unwrap();
    assert_eq!(state.status(), &ConnectionStatus::Disconnected { error: None });
}

#[tokio::test]
async fn test_driver_reports_connection_loss() {
    let (tx, rx) = mpsc::channel(16);
    let driver = driver(tx);
    let scanner = start(driver.clone(), rx);
    let device = discovered_strap(&scanner).await;

    device.connect().await.unwrap();
    device.wait_for(|status| status.is_connected()).await.unwrap();

    driver.drop_connection(&DeviceId::new(STRAP)).await;
    let state = tokio::time::timeout(
        Duration::from_secs(2),
        device.wait_for(ConnectionStatus::is_disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        state.status(),
        &ConnectionStatus::Disconnected {
            error: Some("connection lost".to_string())
        }
    );
}

#[tokio::test]
async fn test_failed_connect_can_be_retried() {
    let (tx, rx) = mpsc::channel(16);
    let driver = driver(tx);
    let scanner = start(driver.clone(), rx);
    let device = discovered_strap(&scanner).await;

    driver.set_failing(DriverOp::Connect, true);
    device.connect().await.unwrap();
    let state = device
        .wait_for(|status| matches!(status, ConnectionStatus::Disconnected { error: Some(_) }))
        .await
        .unwrap();
    assert!(state.services().is_empty());

    driver.set_failing(DriverOp::Connect, false);
    device.connect().await.unwrap();
    let state = device
        .wait_for(|status| matches!(status, ConnectionStatus::ServicesDiscovered(_)))
        .await
        .unwrap();
    assert_eq!(state.services().len(), 2);
}

#[tokio::test]
async fn test_adapter_power_off_ends_scan() {
    let (tx, rx) = mpsc::channel(16);
    let driver = driver(tx);
    let scanner = start(driver.clone(), rx);
    scanner.start_scanning().await.unwrap();

    let mut states = scanner.states(BufferPolicy::Unbounded);
    driver
        .set_adapter_status(btstate::bluetooth::AdapterStatus::PoweredOff)
        .await;

    let disabled = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(state) = states.next().await {
            if state.status() == ScannerStatus::Disabled {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(disabled.ok(), Some(true));
    // The adapter ended the scan itself.
    assert!(!driver.calls().contains(&DriverCall::StopScan));
    assert!(scanner.devices().is_empty());
}
