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

//! Permission state machine.
//!
//! Tracks whether the user allowed Bluetooth scanning. Asking the user goes
//! through a [`PermissionProvider`].

mod provider;

pub use provider::{PermissionProvider, SimulatedPermissions};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::{BufferPolicy, RepoHandle, State, StateError, StateRepo, StateStream, WorkScope};

/// Permission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    /// Not checked yet.
    Unknown,
    /// Waiting for the user to answer.
    Requesting,
    Granted,
    /// Refused. A locked denial can only be lifted in the system settings.
    Denied { locked: bool },
}

impl PermissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionStatus::Unknown => "Unknown",
            PermissionStatus::Requesting => "Requesting",
            PermissionStatus::Granted => "Granted",
            PermissionStatus::Denied { .. } => "Denied",
        }
    }

    pub fn is_granted(&self) -> bool {
        *self == PermissionStatus::Granted
    }

    /// Whether the user has answered.
    pub fn is_settled(&self) -> bool {
        matches!(self, PermissionStatus::Granted | PermissionStatus::Denied { .. })
    }
}

struct PermissionContext {
    provider: Arc<dyn PermissionProvider>,
    repo: RepoHandle<PermissionState>,
    epochs: AtomicU64,
}

/// One state of a permission.
pub struct PermissionState {
    status: PermissionStatus,
    epoch: u64,
    ctx: Arc<PermissionContext>,
    scope: WorkScope,
}

impl PermissionState {
    pub fn status(&self) -> PermissionStatus {
        self.status
    }

    fn with_status(&self, status: PermissionStatus) -> PermissionState {
        PermissionState {
            status,
            epoch: self.ctx.epochs.fetch_add(1, Ordering::Relaxed),
            ctx: self.ctx.clone(),
            scope: WorkScope::new(),
        }
    }

    fn start_request(&self) {
        let ctx = self.ctx.clone();
        let epoch = self.epoch;
        self.scope.spawn(async move {
            let answer = match ctx.provider.request().await {
                Ok(status) => status,
                Err(e) => {
                    warn!("Permission request failed: {}", e);
                    PermissionStatus::Denied { locked: false }
                }
            };
            info!("Permission request answered: {}", answer.as_str());
            let result = ctx.repo.enqueue(move |state: Arc<PermissionState>| async move {
                if state.epoch != epoch {
                    debug!("Ignoring stale permission answer");
                    return Ok(state);
                }
                Ok::<_, anyhow::Error>(Arc::new(state.with_status(answer)))
            });
            if let Err(e) = result {
                debug!("Dropping permission answer: {}", e);
            }
        });
    }
}

impl fmt::Debug for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PermissionState").field(&self.status).finish()
    }
}

#[async_trait]
impl State for PermissionState {
    fn name(&self) -> &'static str {
        self.status.as_str()
    }

    fn work_scope(&self) -> Option<&WorkScope> {
        Some(&self.scope)
    }

    async fn after_old_state_is_removed(&self, _old_state: &Self) -> Result<()> {
        if self.status == PermissionStatus::Requesting {
            self.start_request();
        }
        Ok(())
    }
}

/// Bluetooth permission.
#[derive(Clone)]
pub struct Permissions {
    repo: StateRepo<PermissionState>,
}

impl Permissions {
    /// Create in [`PermissionStatus::Unknown`]. Must be called from within
    /// a Tokio runtime.
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        let repo = StateRepo::new("permissions", |handle| {
            let ctx = Arc::new(PermissionContext {
                provider,
                repo: handle.clone(),
                epochs: AtomicU64::new(1),
            });
            PermissionState {
                status: PermissionStatus::Unknown,
                epoch: 0,
                ctx,
                scope: WorkScope::new(),
            }
        });
        Self { repo }
    }

    pub fn state(&self) -> Arc<PermissionState> {
        self.repo.current_state()
    }

    pub fn status(&self) -> PermissionStatus {
        self.repo.current_state().status
    }

    pub fn states(&self, policy: BufferPolicy) -> StateStream<Arc<PermissionState>> {
        self.repo.subscribe(policy)
    }

    /// Ask the provider for the current status. Ignored while requesting.
    pub async fn refresh(&self) -> Result<Arc<PermissionState>, StateError> {
        self.repo
            .change_state(|state: Arc<PermissionState>| async move {
                if state.status == PermissionStatus::Requesting {
                    return Ok(state);
                }
                let status = match state.ctx.provider.check().await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("Permission check failed: {}", e);
                        PermissionStatus::Denied { locked: false }
                    }
                };
                if status == state.status {
                    return Ok(state);
                }
                Ok::<_, anyhow::Error>(Arc::new(state.with_status(status)))
            })
            .await
    }

    /// Ask the user. Ignored when granted, locked or already requesting.
    pub async fn request(&self) -> Result<Arc<PermissionState>, StateError> {
        self.repo
            .change_state(|state: Arc<PermissionState>| async move {
                match state.status {
                    PermissionStatus::Unknown | PermissionStatus::Denied { locked: false } => {
                        info!("Requesting permission");
                        Ok::<_, anyhow::Error>(Arc::new(state.with_status(PermissionStatus::Requesting)))
                    }
                    _ => Ok(state),
                }
            })
            .await
    }

    /// The platform reported a new status, e.g. after a settings change.
    pub async fn status_changed(&self, status: PermissionStatus) -> Result<Arc<PermissionState>, StateError> {
        self.repo
            .change_state(move |state: Arc<PermissionState>| async move {
                if state.status == status {
                    return Ok(state);
                }
                Ok::<_, anyhow::Error>(Arc::new(state.with_status(status)))
            })
            .await
    }

    /// Wait until the status is granted or denied.
    ///
    /// Returns the last known status if the repository closes first.
    pub async fn wait_for_result(&self) -> PermissionStatus {
        let mut states = self.repo.subscribe(BufferPolicy::Unbounded);
        while let Some(state) = states.next().await {
            if state.status.is_settled() {
                return state.status;
            }
        }
        self.status()
    }

    pub async fn close(&self) {
        self.repo.close().await;
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Permissions").field(&self.status()).finish()
    }
}
