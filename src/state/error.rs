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

//! Errors reported by state repositories.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Lifecycle hook that ran during a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Outgoing state, before the transform runs.
    BeforeCreatingNewState,
    /// Outgoing state, after the successor was computed.
    AfterCreatingNewState,
    /// Incoming state, before it is published.
    BeforeOldStateIsRemoved,
    /// Outgoing state, after the successor was published.
    AfterNewStateIsSet,
    /// Incoming state, last step of the transition.
    AfterOldStateIsRemoved,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::BeforeCreatingNewState => "before_creating_new_state",
            Hook::AfterCreatingNewState => "after_creating_new_state",
            Hook::BeforeOldStateIsRemoved => "before_old_state_is_removed",
            Hook::AfterNewStateIsSet => "after_new_state_is_set",
            Hook::AfterOldStateIsRemoved => "after_old_state_is_removed",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle hook that returned an error.
#[derive(Debug, Error)]
#[error("{hook} failed on state {state}: {source}")]
pub struct HookFailure {
    /// Which hook failed.
    pub hook: Hook,
    /// Name of the state the hook ran on.
    pub state: &'static str,
    /// The error returned by the hook.
    #[source]
    pub source: anyhow::Error,
}

/// Errors returned by [`StateRepo`](super::StateRepo) operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The repository no longer accepts transitions.
    #[error("state repository '{repo}' is closed")]
    Closed { repo: String },

    /// The transform failed; the current state was left unchanged.
    #[error("transition in '{repo}' failed: {source}")]
    Transform {
        repo: String,
        #[source]
        source: anyhow::Error,
    },

    /// A transform or hook panicked. The repository keeps running; the
    /// state is whatever was last published.
    #[error("transition in '{repo}' panicked")]
    Panicked { repo: String },

    /// The new state was published, but one or more lifecycle hooks failed.
    #[error("state '{state}' of '{repo}' was set but {} hook(s) failed", .failures.len())]
    HookFailed {
        repo: String,
        state: &'static str,
        failures: Vec<HookFailure>,
    },
}

impl StateError {
    pub fn is_closed(&self) -> bool {
        matches!(self, StateError::Closed { .. })
    }

    /// The transform error, if this is a transform failure.
    pub fn transform_error(&self) -> Option<&anyhow::Error> {
        match self {
            StateError::Transform { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Callback receiving every hook failure of a repository.
pub type HookErrorHandler = Arc<dyn Fn(&str, &HookFailure) + Send + Sync>;

/// Default handler: log the failure.
pub(crate) fn log_hook_failure(repo: &str, failure: &HookFailure) {
    warn!("[{}] {}", repo, failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_hook_failure_display() {
        let failure = HookFailure {
            hook: Hook::AfterNewStateIsSet,
            state: "Connected",
            source: anyhow!("handle already closed"),
        };
        assert_eq!(
            failure.to_string(),
            "after_new_state_is_set failed on state Connected: handle already closed"
        );
    }

    #[test]
    fn test_error_helpers() {
        let closed = StateError::Closed {
            repo: "scanner".to_string(),
        };
        assert!(closed.is_closed());
        assert!(closed.transform_error().is_none());
        assert_eq!(closed.to_string(), "state repository 'scanner' is closed");

        let failed = StateError::Transform {
            repo: "scanner".to_string(),
            source: anyhow!("boom"),
        };
        assert!(!failed.is_closed());
        assert_eq!(failed.transform_error().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn test_hook_failed_counts_failures() {
        let err = StateError::HookFailed {
            repo: "device".to_string(),
            state: "Idle",
            failures: vec![
                HookFailure {
                    hook: Hook::BeforeCreatingNewState,
                    state: "Scanning",
                    source: anyhow!("a"),
                },
                HookFailure {
                    hook: Hook::AfterCreatingNewState,
                    state: "Scanning",
                    source: anyhow!("b"),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "state 'Idle' of 'device' was set but 2 hook(s) failed"
        );
    }
}
