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

//! Cancellable work owned by a single state.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Default)]
struct ScopeInner {
    cancelled: bool,
    tasks: Vec<AbortHandle>,
}

/// A group of tasks that live exactly as long as the state owning them.
///
/// The repository cancels the scope of a state when that state is replaced,
/// so work started for one state can never outlive it.
#[derive(Clone, Default)]
pub struct WorkScope {
    inner: Arc<Mutex<ScopeInner>>,
}

impl WorkScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task owned by this scope.
    ///
    /// Tasks spawned after the scope was cancelled are aborted right away.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut inner = self.inner.lock();
        if inner.cancelled {
            handle.abort();
            return;
        }
        inner.tasks.retain(|task| !task.is_finished());
        inner.tasks.push(handle.abort_handle());
    }

    /// Abort every task of this scope.
    pub fn cancel(&self) {
        let tasks = {
            let mut inner = self.inner.lock();
            inner.cancelled = true;
            std::mem::take(&mut inner.tasks)
        };
        if !tasks.is_empty() {
            debug!("Cancelling {} scoped task(s)", tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.inner
            .lock()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl fmt::Debug for WorkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkScope")
            .field("cancelled", &inner.cancelled)
            .field("tasks", &inner.tasks.len())
            .finish()
    }
}
