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

//! BlueZ GATT central backend.

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, ErrorKind};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{BleBackend, DeviceFilter, DiscoveredDevice, GattLink, Notifications};
use crate::error::{ClientError, Result};

/// How long to wait for BlueZ to resolve remote services after connecting.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

fn link_error(e: bluer::Error) -> ClientError {
    if matches!(e.kind, ErrorKind::InProgress) {
        ClientError::TransientLinkBusy
    } else {
        ClientError::Link(e.to_string())
    }
}

/// BLE central on the default BlueZ adapter.
pub struct BluerBackend {
    _session: bluer::Session,
    adapter: Adapter,
}

impl BluerBackend {
    /// Open a BlueZ session and power on the default adapter.
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await.map_err(link_error)?;
        let adapter = session.default_adapter().await.map_err(link_error)?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await.map_err(link_error)? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await.map_err(link_error)?;
        }

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    async fn inspect(&self, address: Address, filter: &DeviceFilter) -> Option<DiscoveredDevice> {
        let device = self.adapter.device(address).ok()?;
        let name = device.name().await.ok().flatten();
        let services: Vec<Uuid> = device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        if !filter.matches(name.as_deref(), &services) {
            return None;
        }

        Some(DiscoveredDevice {
            address: address.to_string(),
            name: name.unwrap_or_else(|| address.to_string()),
            rssi: device.rssi().await.ok().flatten(),
        })
    }

    async fn wait_services_resolved(device: &Device) -> Result<()> {
        let deadline = tokio::time::Instant::now() + SERVICE_RESOLVE_TIMEOUT;
        while !device.is_services_resolved().await.map_err(link_error)? {
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Link("GATT services not resolved".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BleBackend for BluerBackend {
    async fn discover(
        &self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        let events = self.adapter.discover_devices().await.map_err(link_error)?;
        futures::pin_mut!(events);

        let mut found: Vec<DiscoveredDevice> = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        if found.iter().any(|d| d.address == address.to_string()) {
                            continue;
                        }
                        if let Some(device) = self.inspect(address, filter).await {
                            debug!("Discovered {} ({})", device.name, device.address);
                            found.push(device);
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        Ok(found)
    }

    async fn open(&self, device: &DiscoveredDevice, service: Uuid) -> Result<Arc<dyn GattLink>> {
        let address: Address = device
            .address
            .parse()
            .map_err(|_| ClientError::Link(format!("invalid address {}", device.address)))?;
        let remote = self.adapter.device(address).map_err(link_error)?;

        if !remote.is_connected().await.map_err(link_error)? {
            remote.connect().await.map_err(link_error)?;
        }
        Self::wait_services_resolved(&remote).await?;

        let mut characteristics = HashMap::new();
        for candidate in remote.services().await.map_err(link_error)? {
            if candidate.uuid().await.map_err(link_error)? != service {
                continue;
            }
            for characteristic in candidate.characteristics().await.map_err(link_error)? {
                let uuid = characteristic.uuid().await.map_err(link_error)?;
                characteristics.insert(uuid, characteristic);
            }
        }

        if characteristics.is_empty() {
            let _ = remote.disconnect().await;
            return Err(ClientError::Link(format!("service {} not found", service)));
        }
        debug!("Resolved {} characteristic(s)", characteristics.len());

        let (closed_tx, _) = watch::channel(false);
        let link = Arc::new(BluerLink {
            device: remote,
            characteristics,
            closed_tx,
        });
        link.spawn_event_watch().await?;
        Ok(link)
    }
}

/// One connected peripheral, scoped to one service.
pub struct BluerLink {
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    closed_tx: watch::Sender<bool>,
}

impl BluerLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| ClientError::Link(format!("characteristic {} not present", uuid)))
    }

    async fn spawn_event_watch(&self) -> Result<()> {
        let events = self.device.events().await.map_err(link_error)?;
        let closed_tx = self.closed_tx.clone();
        tokio::spawn(async move {
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    break;
                }
            }
            warn!("Peripheral link dropped");
            closed_tx.send_replace(true);
        });
        Ok(())
    }
}

#[async_trait]
impl GattLink for BluerLink {
    async fn is_alive(&self) -> bool {
        !*self.closed_tx.borrow() && self.device.is_connected().await.unwrap_or(false)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.characteristic(characteristic)?
            .read()
            .await
            .map_err(link_error)
    }

    async fn write(&self, characteristic: Uuid, chunk: &[u8]) -> Result<()> {
        self.characteristic(characteristic)?
            .write(chunk)
            .await
            .map_err(link_error)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications> {
        let stream = self
            .characteristic(characteristic)?
            .notify()
            .await
            .map_err(|e| ClientError::Subscription(e.to_string()))?;
        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self.device.disconnect().await.map_err(link_error);
        self.closed_tx.send_replace(true);
        result
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
