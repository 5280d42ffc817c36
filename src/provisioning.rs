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

//! Provisioning-mode RPC: one outstanding command at a time.
//!
//! A command is answered by the first notification on the result
//! characteristic after the command is written. There is no request id on
//! the wire, so the result subscription is armed before the write and
//! commands are queued behind a FIFO lock.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::validate_new_pin;
use crate::bluetooth::{
    config, provisioning, BleMode, ChannelIo, ProvisioningCommand, ProvisioningError,
    ProvisioningResponse, ProvisioningStatus,
};
use crate::error::{ClientError, Result};

/// Convert a millisecond setting into an RPC timeout. `0` disables it.
pub fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// WiFi credentials for `set_wifi`.
#[derive(Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// RPC client for a peripheral in provisioning mode.
pub struct Provisioner {
    io: ChannelIo,
    queue: tokio::sync::Mutex<()>,
    next_seq: AtomicU64,
    timeout: Option<Duration>,
    /// Connection id on which a request went unanswered.
    stalled_on: Mutex<Option<u64>>,
}

impl Provisioner {
    pub fn new(io: ChannelIo) -> Self {
        Self::with_timeout(io, timeout_from_ms(config::RPC_TIMEOUT_MS))
    }

    /// `None` waits for a response until the connection drops.
    pub fn with_timeout(io: ChannelIo, timeout: Option<Duration>) -> Self {
        Self {
            io,
            queue: tokio::sync::Mutex::new(()),
            next_seq: AtomicU64::new(1),
            timeout,
            stalled_on: Mutex::new(None),
        }
    }

    /// Send one command and wait for its result.
    ///
    /// `success: false` from the peripheral is returned as `Ok`.
    pub async fn send_command(&self, command: &ProvisioningCommand) -> Result<ProvisioningResponse> {
        let _turn = self.queue.lock().await;

        let connection = self.io.manager().require(BleMode::Provisioning).await?;
        if *self.stalled_on.lock() == Some(connection.id()) {
            return Err(ClientError::ResponseStalled);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        info!("RPC #{}: {}", seq, command.name());

        let mut results = self
            .io
            .subscribe_on(&connection, provisioning::RPC_RESULT_UUID)
            .await?;

        // Stays set if this future is dropped before the reply arrives.
        *self.stalled_on.lock() = Some(connection.id());
        if let Err(e) = self
            .io
            .write_json_on(&connection, provisioning::RPC_COMMAND_UUID, command)
            .await
        {
            *self.stalled_on.lock() = None;
            return Err(e);
        }

        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, results.next_text()).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!("RPC #{} unanswered after {:?}", seq, limit);
                    return Err(ClientError::Timeout);
                }
            },
            None => results.next_text().await,
        };

        let text = reply.ok_or(ClientError::NotConnected)?;
        *self.stalled_on.lock() = None;
        let response = ProvisioningResponse::from_json(&text).map_err(|e| {
            warn!("RPC #{} returned malformed payload: {}", seq, e);
            e
        })?;
        debug!(
            "RPC #{} -> success={} message='{}'",
            seq, response.success, response.message
        );
        Ok(response)
    }

    /// Read the provisioning status byte.
    pub async fn read_status(&self) -> Result<ProvisioningStatus> {
        let byte = self.read_byte(provisioning::STATUS_UUID).await?;
        ProvisioningStatus::try_from(byte)
    }

    /// Read the last provisioning error byte.
    pub async fn read_error(&self) -> Result<ProvisioningError> {
        let byte = self.read_byte(provisioning::ERROR_UUID).await?;
        Ok(ProvisioningError::from(byte))
    }

    async fn read_byte(&self, channel: uuid::Uuid) -> Result<u8> {
        let connection = self.io.manager().require(BleMode::Provisioning).await?;
        let bytes = self.io.read_on(&connection, channel).await?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| ClientError::Protocol(format!("empty value on {}", channel)))
    }

    /// Run the setup sequence: PIN, optional WiFi, then complete.
    ///
    /// Stops at the first unsuccessful response and returns it.
    pub async fn provision(
        &self,
        pin: &str,
        wifi: Option<&WifiCredentials>,
    ) -> Result<ProvisioningResponse> {
        validate_new_pin(pin)?;

        let mut steps = vec![ProvisioningCommand::SetPin {
            pin: pin.to_string(),
        }];
        if let Some(wifi) = wifi {
            steps.push(ProvisioningCommand::SetWifi {
                ssid: wifi.ssid.clone(),
                password: wifi.password.clone(),
            });
        }
        steps.push(ProvisioningCommand::Complete);

        let mut last = None;
        for step in &steps {
            let response = self.send_command(step).await?;
            if !response.success {
                warn!("Provisioning step {} rejected: {}", step.name(), response.message);
                return Ok(response);
            }
            last = Some(response);
        }

        info!("Provisioning complete");
        last.ok_or_else(|| ClientError::Protocol("no provisioning steps ran".to_string()))
    }
}
