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

//! Bluetooth communication module.
//!
//! GATT central side: connection lifecycle, characteristic I/O and the
//! peripheral's wire payloads.

mod ble_constants;
pub mod bluer_link;
mod channel;
mod connection;
pub mod mock;
mod protocol;
mod transport;

pub use ble_constants::{config, normal, provisioning};
pub use bluer_link::{BluerBackend, BluerLink};
pub use channel::{ChannelIo, Subscription};
pub use connection::{
    BleMode, ConnectOptions, Connection, ConnectionEvent, ConnectionManager, DisconnectReason,
};
pub use protocol::{
    fold_updates, AuthError, ConfigKey, DeviceStatus, PinManagementAction, ProvisioningCommand,
    ProvisioningError, ProvisioningResponse, ProvisioningStatus, StatusUpdate, TypingProgress,
};
pub use transport::{
    BleBackend, ByAddress, DeviceFilter, DeviceSelector, DiscoveredDevice, StrongestSignal, GattLink,
    Notifications,
};
