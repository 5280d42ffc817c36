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

//! Link-level seams between the client and a BLE stack.
//!
//! [`BleBackend`] discovers peripherals and opens GATT links; [`GattLink`]
//! is one open link to one service. The BlueZ implementation lives in
//! `bluer_link`, the scripted substitute in `mock`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// Values pushed by the peripheral on a subscribed characteristic.
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// What discovery should match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Advertised local name prefix.
    pub name_prefix: String,
    /// Primary service the peripheral must expose.
    pub service: Uuid,
}

impl DeviceFilter {
    /// Whether an advertisement matches by name or by service.
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        name.is_some_and(|n| n.starts_with(&self.name_prefix)) || services.contains(&self.service)
    }
}

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Discovery and connection establishment.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Scan for up to `timeout` and return every matching advertiser.
    async fn discover(
        &self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>>;

    /// Connect to `device` and resolve `service`.
    async fn open(&self, device: &DiscoveredDevice, service: Uuid) -> Result<Arc<dyn GattLink>>;
}

/// One open GATT link, scoped to a single primary service.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Query the stack for the current connection state.
    async fn is_alive(&self) -> bool;

    /// Read a characteristic value.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write one chunk with response. Callers handle chunking.
    async fn write(&self, characteristic: Uuid, chunk: &[u8]) -> Result<()>;

    /// Enable notifications. Dropping the stream unsubscribes.
    async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications>;

    /// Tear the link down from the central side.
    async fn disconnect(&self) -> Result<()>;

    /// Resolves once the link has dropped, from either side.
    async fn closed(&self);
}

/// Picks one device out of the discovered candidates.
///
/// Returning `None` means the user dismissed the choice.
pub trait DeviceSelector: Send + Sync {
    fn select(&self, candidates: &[DiscoveredDevice]) -> Option<DiscoveredDevice>;
}

/// Takes the strongest advertiser.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrongestSignal;

impl DeviceSelector for StrongestSignal {
    fn select(&self, candidates: &[DiscoveredDevice]) -> Option<DiscoveredDevice> {
        candidates
            .iter()
            .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
            .cloned()
    }
}

/// Takes the device with a given address (case-insensitive).
#[derive(Debug, Clone)]
pub struct ByAddress(pub String);

impl DeviceSelector for ByAddress {
    fn select(&self, candidates: &[DiscoveredDevice]) -> Option<DiscoveredDevice> {
        candidates
            .iter()
            .find(|d| d.address.eq_ignore_ascii_case(&self.0))
            .cloned()
    }
}
