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

//! Hot broadcast of the latest state.
//!
//! A [`StateFlow`] always holds a value. Every subscriber first receives the
//! value current at subscription time and then whatever is published after
//! it, either conflated to the newest value or fully buffered.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::watch;

/// How a subscriber absorbs values published faster than it consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPolicy {
    /// Keep only the newest value. Intermediate values may be skipped.
    #[default]
    Conflate,
    /// Deliver every published value, buffering in memory as needed.
    Unbounded,
    /// No buffer of its own. Reads the shared latest-value slot, which for a
    /// hot state flow behaves exactly like [`BufferPolicy::Conflate`].
    None,
}

struct Publisher<T> {
    latest: Option<watch::Sender<T>>,
    buffered: Vec<async_channel::Sender<T>>,
}

/// Latest-value broadcast primitive.
pub struct StateFlow<T> {
    publisher: Mutex<Publisher<T>>,
    reader: watch::Receiver<T>,
}

impl<T: Clone + Send + Sync + 'static> StateFlow<T> {
    /// Create a flow seeded with `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self {
            publisher: Mutex::new(Publisher {
                latest: Some(tx),
                buffered: Vec::new(),
            }),
            reader: rx,
        }
    }

    /// The latest published value.
    pub fn value(&self) -> T {
        self.reader.borrow().clone()
    }

    /// Publish a new value. Never blocks on subscribers.
    ///
    /// Returns `false` if the flow was already closed.
    pub fn publish(&self, value: T) -> bool {
        let mut publisher = self.publisher.lock();
        let Some(latest) = publisher.latest.as_ref() else {
            return false;
        };
        latest.send_replace(value.clone());
        publisher
            .buffered
            .retain(|tx| tx.try_send(value.clone()).is_ok());
        true
    }

    /// Subscribe with the given buffer policy.
    pub fn subscribe(&self, policy: BufferPolicy) -> StateStream<T> {
        match policy {
            BufferPolicy::Conflate | BufferPolicy::None => StateStream::Latest {
                inner: latest_stream(self.reader.clone()),
            },
            BufferPolicy::Unbounded => {
                let (tx, rx) = async_channel::unbounded();
                let mut publisher = self.publisher.lock();
                // Seed and register under the publisher lock so no value is
                // missed or duplicated between the two.
                let _ = tx.try_send(self.reader.borrow().clone());
                if publisher.latest.is_some() {
                    publisher.buffered.push(tx);
                }
                StateStream::Buffered { inner: Box::pin(rx) }
            }
        }
    }

    /// Close the flow. Subscribers drain what they have not seen yet and end.
    pub fn close(&self) {
        let mut publisher = self.publisher.lock();
        publisher.latest = None;
        publisher.buffered.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.publisher.lock().latest.is_none()
    }

    /// Number of live fully-buffered subscribers.
    pub fn buffered_subscribers(&self) -> usize {
        let mut publisher = self.publisher.lock();
        publisher.buffered.retain(|tx| !tx.is_closed());
        publisher.buffered.len()
    }
}

fn latest_stream<T: Clone + Send + Sync + 'static>(rx: watch::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
    .boxed()
}

pin_project! {
    /// Stream of states returned by [`StateFlow::subscribe`].
    #[project = StateStreamProj]
    pub enum StateStream<T> {
        Latest {
            #[pin]
            inner: BoxStream<'static, T>,
        },
        Buffered {
            #[pin]
            inner: Pin<Box<async_channel::Receiver<T>>>,
        },
    }
}

impl<T> Stream for StateStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.project() {
            StateStreamProj::Latest { inner } => inner.poll_next(cx),
            StateStreamProj::Buffered { inner } => inner.poll_next(cx),
        }
    }
}
