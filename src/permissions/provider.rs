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

//! Permission provider abstraction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::PermissionStatus;

/// Trait for platform permission backends.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Current status without asking the user.
    async fn check(&self) -> Result<PermissionStatus>;

    /// Ask the user and return the answer.
    async fn request(&self) -> Result<PermissionStatus>;
}

/// In-memory provider for tests and demos.
pub struct SimulatedPermissions {
    status: Mutex<PermissionStatus>,
    answer: PermissionStatus,
    delay: Duration,
    failing: AtomicBool,
    requests: AtomicUsize,
}

impl Default for SimulatedPermissions {
    fn default() -> Self {
        Self {
            status: Mutex::new(PermissionStatus::Unknown),
            answer: PermissionStatus::Granted,
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }
}

impl SimulatedPermissions {
    /// Provider that grants every request.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: PermissionStatus) -> Self {
        Self {
            status: Mutex::new(status),
            ..Self::default()
        }
    }

    /// Answer requests with `answer`.
    pub fn answering(mut self, answer: PermissionStatus) -> Self {
        self.answer = answer;
        self
    }

    /// Take `delay` to answer a request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of requests shown to the user.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(anyhow!("permission service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionProvider for SimulatedPermissions {
    async fn check(&self) -> Result<PermissionStatus> {
        self.check_failing()?;
        Ok(*self.status.lock())
    }

    async fn request(&self) -> Result<PermissionStatus> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.check_failing()?;
        debug!("[SIM] Answering permission request: {:?}", self.answer);
        *self.status.lock() = self.answer;
        Ok(self.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_updates_status() {
        let provider = SimulatedPermissions::new().answering(PermissionStatus::Denied { locked: true });
        assert_eq!(provider.check().await.unwrap(), PermissionStatus::Unknown);
        assert_eq!(
            provider.request().await.unwrap(),
            PermissionStatus::Denied { locked: true }
        );
        assert_eq!(provider.check().await.unwrap(), PermissionStatus::Denied { locked: true });
        assert_eq!(provider.requests(), 1);
    }

    #[tokio::test]
    async fn test_failing_provider() {
        let provider = SimulatedPermissions::new();
        provider.set_failing(true);
        assert!(provider.check().await.is_err());
        assert!(provider.request().await.is_err());
    }
}
