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

//! State repositories.
//!
//! A [`StateRepo`] holds the current [`State`] of a long-lived resource,
//! serializes every transition through a single writer and publishes each
//! new state on a [`StateFlow`].
//!
//! During a transition that replaces the state, hooks run in this order:
//!
//! 1. `old.before_creating_new_state()`
//! 2. the transform computes `new` from `old`
//! 3. `old`'s [`WorkScope`] is cancelled
//! 4. `old.after_creating_new_state(new)`
//! 5. `new.before_old_state_is_removed(old)`
//! 6. `new` is published
//! 7. `old.after_new_state_is_set(new)`
//! 8. `new.after_old_state_is_removed(old)`

mod error;
mod flow;
mod repo;
mod scope;

pub use error::{Hook, HookErrorHandler, HookFailure, StateError};
pub use flow::{BufferPolicy, StateFlow, StateStream};
pub use repo::{RepoHandle, StateRepo, StateRepoBuilder};
pub use scope::WorkScope;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// One node of a state machine held by a [`StateRepo`].
///
/// Hooks default to no-ops. A failing hook never stops the transition; the
/// failure is handed to the repository's hook error handler and returned to
/// the caller as [`StateError::HookFailed`].
#[async_trait]
pub trait State: Debug + Send + Sync + 'static {
    /// Name of the variant, for logs and snapshots.
    fn name(&self) -> &'static str;

    /// Work owned by this state, cancelled when the state is replaced.
    fn work_scope(&self) -> Option<&WorkScope> {
        None
    }

    /// Runs on the outgoing state before the transform.
    async fn before_creating_new_state(&self) -> Result<()> {
        Ok(())
    }

    /// Runs on the outgoing state once its successor exists.
    async fn after_creating_new_state(&self, _new_state: &Self) -> Result<()> {
        Ok(())
    }

    /// Runs on the outgoing state after its successor was published.
    async fn after_new_state_is_set(&self, _new_state: &Self) -> Result<()> {
        Ok(())
    }

    /// Runs on the incoming state just before it is published.
    async fn before_old_state_is_removed(&self, _old_state: &Self) -> Result<()> {
        Ok(())
    }

    /// Runs on the incoming state as the last step of the transition.
    async fn after_old_state_is_removed(&self, _old_state: &Self) -> Result<()> {
        Ok(())
    }
}
