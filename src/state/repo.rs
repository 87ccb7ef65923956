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

//! Serialized state transition engine.

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::error::{log_hook_failure, Hook, HookErrorHandler, HookFailure, StateError};
use super::flow::{BufferPolicy, StateFlow, StateStream};
use super::State;

type Job<S> = Box<dyn FnOnce(Arc<Inner<S>>) -> BoxFuture<'static, ()> + Send>;
type Reply<T> = oneshot::Sender<Result<T, StateError>>;

struct Inner<S: State> {
    name: Arc<str>,
    flow: StateFlow<Arc<S>>,
    queue: mpsc::UnboundedSender<Job<S>>,
    closed: AtomicBool,
    on_hook_error: HookErrorHandler,
}

impl<S: State> Inner<S> {
    fn closed_error(&self) -> StateError {
        StateError::Closed {
            repo: self.name.to_string(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Error for a reply channel dropped without an answer. While the
    /// repository is open that only happens when the job panicked.
    fn dropped_reply_error(&self) -> StateError {
        if self.is_closed() {
            return self.closed_error();
        }
        StateError::Panicked {
            repo: self.name.to_string(),
        }
    }

    /// Put a job at the end of the transition queue.
    fn push(&self, job: Job<S>) -> Result<(), StateError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.queue.send(job).map_err(|_| self.closed_error())
    }

    /// Queue a transition. With a reply channel the result is sent back,
    /// without one failures are only logged.
    fn submit<F, Fut, T>(&self, transform: F, reply: Option<Reply<Arc<S>>>) -> Result<(), StateError>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<Arc<S>> + Send + 'static,
    {
        self.push(Box::new(move |inner: Arc<Inner<S>>| {
            async move {
                match reply {
                    Some(reply) => {
                        // The caller gave up before its turn came.
                        if reply.is_closed() {
                            debug!("[{}] Skipping abandoned transition", inner.name);
                            return;
                        }
                        let result = inner.transition(transform).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = inner.transition(transform).await {
                            warn!("[{}] Queued transition failed: {}", inner.name, e);
                        }
                    }
                }
            }
            .boxed()
        }))
    }

    async fn transition<F, Fut, T>(&self, transform: F) -> Result<Arc<S>, StateError>
    where
        F: FnOnce(Arc<S>) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Into<Arc<S>>,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let old = self.flow.value();
        let mut failures = Vec::new();

        if let Err(source) = old.before_creating_new_state().await {
            failures.push(HookFailure {
                hook: Hook::BeforeCreatingNewState,
                state: old.name(),
                source,
            });
        }

        let new: Arc<S> = match transform(old.clone()).await {
            Ok(next) => next.into(),
            Err(source) => {
                debug!("[{}] Transform from {} failed: {}", self.name, old.name(), source);
                self.report(&failures);
                return Err(StateError::Transform {
                    repo: self.name.to_string(),
                    source,
                });
            }
        };

        if Arc::ptr_eq(&old, &new) {
            return self.finish(new, failures);
        }

        if let Some(scope) = old.work_scope() {
            scope.cancel();
        }

        if let Err(source) = old.after_creating_new_state(&new).await {
            failures.push(HookFailure {
                hook: Hook::AfterCreatingNewState,
                state: old.name(),
                source,
            });
        }
        if let Err(source) = new.before_old_state_is_removed(&old).await {
            failures.push(HookFailure {
                hook: Hook::BeforeOldStateIsRemoved,
                state: new.name(),
                source,
            });
        }

        self.flow.publish(new.clone());
        debug!("[{}] {} -> {}", self.name, old.name(), new.name());

        if let Err(source) = old.after_new_state_is_set(&new).await {
            failures.push(HookFailure {
                hook: Hook::AfterNewStateIsSet,
                state: old.name(),
                source,
            });
        }
        if let Err(source) = new.after_old_state_is_removed(&old).await {
            failures.push(HookFailure {
                hook: Hook::AfterOldStateIsRemoved,
                state: new.name(),
                source,
            });
        }

        self.finish(new, failures)
    }

    fn report(&self, failures: &[HookFailure]) {
        for failure in failures {
            (self.on_hook_error)(&self.name, failure);
        }
    }

    fn finish(&self, state: Arc<S>, failures: Vec<HookFailure>) -> Result<Arc<S>, StateError> {
        if failures.is_empty() {
            return Ok(state);
        }
        self.report(&failures);
        Err(StateError::HookFailed {
            repo: self.name.to_string(),
            state: state.name(),
            failures,
        })
    }
}

impl<S: State> Drop for Inner<S> {
    fn drop(&mut self) {
        if let Some(scope) = self.flow.value().work_scope() {
            scope.cancel();
        }
    }
}

/// Drain the transition queue, one job at a time.
///
/// A panicking job is logged and dropped; its caller sees
/// [`StateError::Panicked`] and later jobs run as usual.
async fn run_writer<S: State>(repo: Weak<Inner<S>>, mut jobs: mpsc::UnboundedReceiver<Job<S>>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = repo.upgrade() else {
            break;
        };
        let name = inner.name.clone();
        if AssertUnwindSafe(job(inner)).catch_unwind().await.is_err() {
            error!("[{}] Transition panicked", name);
        }
    }
}

/// Holds the current state of one resource and serializes changes to it.
///
/// Cloning is cheap; all clones share the same state. The repository shuts
/// down when [`close`](StateRepo::close) is called or the last clone drops.
pub struct StateRepo<S: State> {
    inner: Arc<Inner<S>>,
}

impl<S: State> Clone for StateRepo<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for [`StateRepo`].
pub struct StateRepoBuilder<S: State> {
    name: Arc<str>,
    on_hook_error: Option<HookErrorHandler>,
    _state: PhantomData<fn() -> S>,
}

impl<S: State> StateRepoBuilder<S> {
    /// Replace the default hook error handler, which logs a warning.
    pub fn on_hook_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &HookFailure) + Send + Sync + 'static,
    {
        self.on_hook_error = Some(Arc::new(handler));
        self
    }

    /// Create the repository.
    ///
    /// `initial_state` runs exactly once, before this returns, and receives
    /// the handle its state may keep to request further transitions.
    /// Must be called from within a Tokio runtime.
    pub fn build<F>(self, initial_state: F) -> StateRepo<S>
    where
        F: FnOnce(&RepoHandle<S>) -> S,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.name;
        let on_hook_error = self
            .on_hook_error
            .unwrap_or_else(|| Arc::new(log_hook_failure));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<S>>| {
            let handle = RepoHandle {
                inner: weak.clone(),
                name: name.clone(),
            };
            let initial = Arc::new(initial_state(&handle));
            debug!("[{}] Initial state: {}", name, initial.name());
            Inner {
                name,
                flow: StateFlow::new(initial),
                queue: tx,
                closed: AtomicBool::new(false),
                on_hook_error,
            }
        });

        tokio::spawn(run_writer(Arc::downgrade(&inner), rx));

        StateRepo { inner }
    }
}

impl<S: State> StateRepo<S> {
    /// Create a repository with the default hook error handler.
    pub fn new<F>(name: impl Into<String>, initial_state: F) -> Self
    where
        F: FnOnce(&RepoHandle<S>) -> S,
    {
        Self::builder(name).build(initial_state)
    }

    pub fn builder(name: impl Into<String>) -> StateRepoBuilder<S> {
        StateRepoBuilder {
            name: Arc::from(name.into()),
            on_hook_error: None,
            _state: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The latest published state. Never waits for a running transition.
    pub fn current_state(&self) -> Arc<S> {
        self.inner.flow.value()
    }

    /// Request a transition and wait for it to complete.
    ///
    /// `transform` receives the state as it stands when this transition gets
    /// its turn and returns the next state. Returning the same `Arc` leaves
    /// the state untouched. A failing transform leaves the state unchanged
    /// and its error is returned as [`StateError::Transform`].
    ///
    /// Must not be awaited from inside a transform or hook of the same
    /// repository; use [`RepoHandle::enqueue`] there.
    pub async fn change_state<F, Fut, T>(&self, transform: F) -> Result<Arc<S>, StateError>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<Arc<S>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.submit(transform, Some(tx))?;
        rx.await.map_err(|_| self.inner.dropped_reply_error())?
    }

    /// Synchronous, infallible variant of [`change_state`](Self::change_state).
    pub async fn update<F>(&self, f: F) -> Result<Arc<S>, StateError>
    where
        F: FnOnce(&S) -> S + Send + 'static,
    {
        self.change_state(move |state| async move { Ok::<S, anyhow::Error>(f(&state)) })
            .await
    }

    /// Run `f` against the current state while no transition is in flight.
    pub async fn use_state<F, Fut, R>(&self, f: F) -> Result<R, StateError>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx): (Reply<R>, _) = oneshot::channel();
        self.inner.push(Box::new(move |inner: Arc<Inner<S>>| {
            async move {
                if tx.is_closed() {
                    return;
                }
                let result = if inner.is_closed() {
                    Err(inner.closed_error())
                } else {
                    Ok(f(inner.flow.value()).await)
                };
                let _ = tx.send(result);
            }
            .boxed()
        }))?;
        rx.await.map_err(|_| self.inner.dropped_reply_error())?
    }

    /// Stream of states, starting with the current one.
    pub fn subscribe(&self, policy: BufferPolicy) -> StateStream<Arc<S>> {
        self.inner.flow.subscribe(policy)
    }

    /// Conflated stream of states, starting with the current one.
    pub fn stream(&self) -> StateStream<Arc<S>> {
        self.subscribe(BufferPolicy::Conflate)
    }

    /// Weak handle for states and background work.
    pub fn handle(&self) -> RepoHandle<S> {
        RepoHandle {
            inner: Arc::downgrade(&self.inner),
            name: self.inner.name.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop accepting transitions and close the stream.
    ///
    /// A transition already running finishes; queued ones are answered with
    /// [`StateError::Closed`] without being applied. The work scope of the
    /// final state is cancelled.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[{}] Closing state repository", self.inner.name);

        let (tx, rx) = oneshot::channel::<()>();
        let job: Job<S> = Box::new(move |inner: Arc<Inner<S>>| {
            async move {
                if let Some(scope) = inner.flow.value().work_scope() {
                    scope.cancel();
                }
                inner.flow.close();
                let _ = tx.send(());
            }
            .boxed()
        });

        // The writer only stops once every owner is gone, so this can only
        // fail while the repository is being torn down anyway.
        if self.inner.queue.send(job).is_err() {
            self.inner.flow.close();
            return;
        }
        let _ = rx.await;
    }
}

impl<S: State> fmt::Debug for StateRepo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRepo")
            .field("name", &self.inner.name)
            .field("state", &self.current_state().name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning capability to read and change a repository's state.
///
/// States keep one of these instead of the repository itself.
pub struct RepoHandle<S: State> {
    inner: Weak<Inner<S>>,
    name: Arc<str>,
}

impl<S: State> Clone for RepoHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            name: self.name.clone(),
        }
    }
}

impl<S: State> RepoHandle<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning repository, if it is still alive.
    pub fn repo(&self) -> Option<StateRepo<S>> {
        self.inner.upgrade().map(|inner| StateRepo { inner })
    }

    /// The latest published state, if the repository is still alive.
    pub fn current_state(&self) -> Option<Arc<S>> {
        self.inner.upgrade().map(|inner| inner.flow.value())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.upgrade().map_or(true, |inner| inner.is_closed())
    }

    /// See [`StateRepo::change_state`].
    pub async fn change_state<F, Fut, T>(&self, transform: F) -> Result<Arc<S>, StateError>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<Arc<S>> + Send + 'static,
    {
        match self.repo() {
            Some(repo) => repo.change_state(transform).await,
            None => Err(self.closed_error()),
        }
    }

    /// Queue a transition without waiting for it.
    ///
    /// Requests keep their order. Safe to call from hooks and from tasks of
    /// a state's work scope; failures are logged.
    pub fn enqueue<F, Fut, T>(&self, transform: F) -> Result<(), StateError>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<Arc<S>> + Send + 'static,
    {
        match self.inner.upgrade() {
            Some(inner) => inner.submit(transform, None),
            None => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> StateError {
        StateError::Closed {
            repo: self.name.to_string(),
        }
    }
}

impl<S: State> fmt::Debug for RepoHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoHandle")
            .field("name", &self.name)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
