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

//! Bluetooth state machines.
//!
//! A [`Scanner`] collects [`Device`]s while scanning; each device tracks its
//! own connection. Hardware access goes through a [`BluetoothDriver`].

mod device;
mod driver;
mod scanner;
pub mod uuids;

pub use device::{ConnectionStatus, Device, DeviceSettings, DeviceSnapshot, DeviceState};
pub use driver::{
    AdapterStatus, BluetoothDriver, DeviceId, DeviceInfo, DriverCall, DriverEvent, DriverOp,
    ScanFilter, SimulatedDriver,
};
pub use scanner::{Scanner, ScannerSettings, ScannerSnapshot, ScannerState, ScannerStatus};
