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

//! Session state: one owner for the connection and everything bound to it.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::auth::{AuthMachine, AuthState};
use crate::bluetooth::{BleBackend, BleMode, ByAddress, ChannelIo, ConnectionManager};
use crate::config::BluetoothConfig;
use crate::device::DeviceClient;
use crate::error::Result;
use crate::provisioning::{timeout_from_ms, Provisioner};
use crate::status::StatusMonitor;

/// Connection status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected(BleMode),
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected(BleMode::Provisioning) => "Connected (setup)",
            ConnectionStatus::Connected(BleMode::Normal) => "Connected",
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    status: RwLock<ConnectionStatus>,
    device_name: RwLock<Option<String>>,
}

/// Owns the connection manager and the per-connection components.
pub struct Session {
    pub manager: Arc<ConnectionManager>,
    pub io: ChannelIo,
    pub auth: AuthMachine,
    pub device: DeviceClient,
    pub provisioner: Provisioner,
    pub monitor: StatusMonitor,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(backend: Arc<dyn BleBackend>, config: &BluetoothConfig) -> Self {
        let manager = ConnectionManager::new(backend, config.connect_options());
        if let Some(address) = &config.device_address {
            manager.set_selector(Arc::new(ByAddress(address.clone())));
        }

        let io = ChannelIo::with_mtu(manager.clone(), config.write_mtu);
        let auth = AuthMachine::new(io.clone());
        Self {
            manager,
            device: DeviceClient::new(io.clone()),
            provisioner: Provisioner::with_timeout(io.clone(), timeout_from_ms(config.rpc_timeout_ms)),
            monitor: StatusMonitor::with_interval(io.clone(), config.status_poll_interval())
                .with_auth(auth.clone()),
            auth,
            io,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    pub fn device_name(&self) -> Option<String> {
        self.shared.device_name.read().clone()
    }

    async fn connect(&self, mode: BleMode) -> Result<()> {
        *self.shared.status.write() = ConnectionStatus::Connecting;
        let connection = match self.manager.connect(mode).await {
            Ok(connection) => connection,
            Err(e) => {
                *self.shared.status.write() = ConnectionStatus::Disconnected;
                return Err(e);
            }
        };

        *self.shared.status.write() = ConnectionStatus::Connected(mode);
        *self.shared.device_name.write() = Some(connection.device().name.clone());

        let shared = Arc::downgrade(&self.shared);
        connection.on_disconnect(move |reason| {
            if let Some(shared) = shared.upgrade() {
                info!("Session disconnected ({:?})", reason);
                *shared.status.write() = ConnectionStatus::Disconnected;
                *shared.device_name.write() = None;
            }
        });
        Ok(())
    }

    /// Connect in normal mode, query the lock state and start status updates.
    pub async fn connect_normal(&self) -> Result<AuthState> {
        self.connect(BleMode::Normal).await?;
        let state = self.auth.attach().await?;
        self.monitor.start().await?;
        Ok(state)
    }

    /// Connect to an unprovisioned device.
    pub async fn connect_provisioning(&self) -> Result<()> {
        self.connect(BleMode::Provisioning).await
    }

    pub async fn disconnect(&self) {
        self.monitor.stop();
        self.manager.disconnect().await;
    }
}
