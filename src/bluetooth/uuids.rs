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

//! Well-known Bluetooth SIG service UUIDs.

use uuid::Uuid;

/// Bluetooth base UUID (`0000xxxx-0000-1000-8000-00805F9B34FB`).
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit SIG assigned number to a full UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Generic Access service.
pub const GENERIC_ACCESS_UUID: Uuid = from_short(0x1800);

/// Device Information service.
pub const DEVICE_INFORMATION_UUID: Uuid = from_short(0x180A);

/// Heart Rate service.
pub const HEART_RATE_SERVICE_UUID: Uuid = from_short(0x180D);

/// Battery service.
pub const BATTERY_SERVICE_UUID: Uuid = from_short(0x180F);

/// Environmental Sensing service.
pub const ENVIRONMENTAL_SENSING_UUID: Uuid = from_short(0x181A);

const SERVICE_NAMES: [(Uuid, &str); 5] = [
    (GENERIC_ACCESS_UUID, "Generic Access"),
    (DEVICE_INFORMATION_UUID, "Device Information"),
    (HEART_RATE_SERVICE_UUID, "Heart Rate"),
    (BATTERY_SERVICE_UUID, "Battery"),
    (ENVIRONMENTAL_SENSING_UUID, "Environmental Sensing"),
];

/// Human readable name of a known service.
pub fn service_name(uuid: &Uuid) -> Option<&'static str> {
    SERVICE_NAMES
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}
