//! Integration tests for permission request flows.

use btstate::permissions::{PermissionStatus, Permissions, SimulatedPermissions};
use btstate::BufferPolicy;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_request_is_granted() {
    let provider = Arc::new(SimulatedPermissions::new());
    let permissions = Permissions::new(provider.clone());
    let states = permissions.states(BufferPolicy::Unbounded);

    let state = permissions.request().await.unwrap();
    assert_eq!(state.status(), PermissionStatus::Requesting);
    assert_eq!(permissions.wait_for_result().await, PermissionStatus::Granted);
    assert_eq!(provider.requests(), 1);

    // Already granted, the user is not asked again.
    permissions.request().await.unwrap();
    assert_eq!(provider.requests(), 1);

    permissions.close().await;
    let seen: Vec<PermissionStatus> = states.map(|s| s.status()).collect().await;
    assert_eq!(
        seen,
        vec![
            PermissionStatus::Unknown,
            PermissionStatus::Requesting,
            PermissionStatus::Granted,
        ]
    );
}

#[tokio::test]
async fn test_denied_request_can_be_repeated() {
    let provider = Arc::new(SimulatedPermissions::new().answering(PermissionStatus::Denied { locked: false }));
    let permissions = Permissions::new(provider.clone());

    permissions.request().await.unwrap();
    assert_eq!(
        permissions.wait_for_result().await,
        PermissionStatus::Denied { locked: false }
    );

    permissions.request().await.unwrap();
    assert_eq!(
        permissions.wait_for_result().await,
        PermissionStatus::Denied { locked: false }
    );
    assert_eq!(provider.requests(), 2);
}

#[tokio::test]
async fn test_failed_request_is_denied() {
    let provider = Arc::new(SimulatedPermissions::new());
    provider.set_failing(true);
    let permissions = Permissions::new(provider);

    permissions.request().await.unwrap();
    assert_eq!(
        permissions.wait_for_result().await,
        PermissionStatus::Denied { locked: false }
    );
}

#[tokio::test]
async fn test_settings_change_is_picked_up_by_refresh() {
    let provider = Arc::new(SimulatedPermissions::with_status(PermissionStatus::Denied { locked: true }));
    let permissions = Permissions::new(provider.clone());

    permissions.refresh().await.unwrap();
    assert_eq!(permissions.status(), PermissionStatus::Denied { locked: true });

    // The user flips the switch in the system settings.
    permissions.status_changed(PermissionStatus::Granted).await.unwrap();
    assert!(permissions.status().is_granted());

    let before = permissions.state();
    let after = permissions.status_changed(PermissionStatus::Granted).await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn test_wait_for_result_returns_on_close() {
    let provider = Arc::new(SimulatedPermissions::new().with_delay(Duration::from_secs(60)));
    let permissions = Permissions::new(provider);
    permissions.request().await.unwrap();

    let waiter = {
        let permissions = permissions.clone();
        tokio::spawn(async move { permissions.wait_for_result().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    permissions.close().await;

    let status = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, PermissionStatus::Requesting);
}
