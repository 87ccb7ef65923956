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

//! Serialized state repositories for Bluetooth scanners, devices and
//! permissions.
//!
//! The [`state`] module holds the generic engine. [`bluetooth`] and
//! [`permissions`] build their state machines on top of it, and
//! [`events::EventProcessor`] feeds driver callbacks into them.

pub mod bluetooth;
pub mod config;
pub mod events;
pub mod permissions;
pub mod state;

pub use config::Config;
pub use events::EventProcessor;
pub use state::{BufferPolicy, RepoHandle, State, StateError, StateRepo, StateStream, WorkScope};
