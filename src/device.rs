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

//! Normal-mode device operations: typing, keys, settings and diagnostics.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::auth::{validate_new_pin, validate_pin_format};
use crate::bluetooth::{
    config, normal, BleMode, ChannelIo, ConfigKey, Connection, DeviceStatus, PinManagementAction,
    StatusUpdate,
};
use crate::error::{ClientError, Result};

/// SHA-256 fingerprint of the peripheral's TLS certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertFingerprint([u8; 32]);

impl CertFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether `der` hashes to this fingerprint.
    pub fn matches_der(&self, der: &[u8]) -> bool {
        Sha256::digest(der).as_slice() == self.0
    }

    /// Firmware without a certificate reports all zeros.
    pub fn is_placeholder(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl FromStr for CertFingerprint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if s.len() != 64 {
            return Err(ClientError::Protocol(format!(
                "fingerprint must be 64 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ClientError::Protocol(format!("invalid fingerprint: {}", e)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for CertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        f.write_str(&groups.join(":"))
    }
}

/// One audit log line: `<134>1 HH:MM:SS esp32-hid - EVENT - - details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Device uptime when the event was logged.
    pub uptime: Duration,
    pub host: String,
    pub event: String,
    pub details: Option<String>,
}

impl AuditEntry {
    /// Parse one line. Returns `None` for lines cut by the device's ring
    /// buffer wrapping.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim_end().splitn(8, ' ');
        let header = fields.next()?;
        if !header.starts_with('<') || !header.contains('>') {
            return None;
        }

        let uptime = parse_uptime(fields.next()?)?;
        let host = fields.next()?.to_string();
        fields.next()?;
        let event = fields.next()?.to_string();
        fields.next()?;
        fields.next()?;
        let details = fields
            .next()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        Some(Self {
            uptime,
            host,
            event,
            details,
        })
    }
}

fn parse_uptime(field: &str) -> Option<Duration> {
    let mut parts = field.split(':').map(|p| p.parse::<u64>().ok());
    let hours = parts.next()??;
    let minutes = parts.next()??;
    let seconds = parts.next()??;
    if parts.next().is_some() {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

/// Audit log returned by `get_logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditLog {
    pub raw: String,
    pub entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            entries: raw.lines().filter_map(AuditEntry::parse).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Operations on an unlocked normal-mode peripheral.
#[derive(Clone)]
pub struct DeviceClient {
    io: ChannelIo,
    audit_timeout: Duration,
}

impl DeviceClient {
    pub fn new(io: ChannelIo) -> Self {
        Self {
            io,
            audit_timeout: Duration::from_millis(config::AUDIT_LOG_TIMEOUT_MS),
        }
    }

    pub fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<Connection> {
        self.io.manager().require(BleMode::Normal).await
    }

    async fn send_action(&self, action: &PinManagementAction) -> Result<()> {
        let connection = self.connection().await?;
        debug!("Sending action {}", action.name());
        self.io
            .write_json_on(&connection, normal::PIN_MANAGEMENT_UUID, action)
            .await
    }

    /// Queue `text` for typing on the host.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let connection = self.connection().await?;
        info!("Sending {} bytes of text", text.len());
        self.io
            .write_on(&connection, normal::TEXT_INPUT_UUID, text.as_bytes())
            .await
    }

    /// Press `keycode` with the HID `modifier` bitmask held.
    pub async fn key_combo(&self, modifier: u8, keycode: u8) -> Result<()> {
        self.send_action(&PinManagementAction::KeyCombo { modifier, keycode })
            .await
    }

    /// Drop queued text and stop typing.
    pub async fn abort(&self) -> Result<()> {
        self.send_action(&PinManagementAction::Abort).await
    }

    /// Change a device-side setting. Returns the value actually sent,
    /// clamped into the key's range.
    pub async fn set_config(&self, key: ConfigKey, value: u32) -> Result<u32> {
        let applied = key.clamp(value);
        if applied != value {
            debug!("{} clamped from {} to {}", key, value, applied);
        }
        self.send_action(&PinManagementAction::SetConfig {
            key,
            value: applied.to_string(),
        })
        .await?;
        info!("Set {} = {}", key, applied);
        Ok(applied)
    }

    /// Replace the PIN. `new` must satisfy the full PIN rules.
    pub async fn change_pin(&self, old: &str, new: &str) -> Result<()> {
        validate_pin_format(old)?;
        validate_new_pin(new)?;
        self.send_action(&PinManagementAction::Set {
            old: old.to_string(),
            new: new.to_string(),
        })
        .await?;
        info!("PIN change sent");
        Ok(())
    }

    /// Request the audit log and wait for it on the status channel.
    ///
    /// The device sends nothing when its log is empty, so a timeout yields
    /// an empty log.
    pub async fn fetch_audit_log(&self) -> Result<AuditLog> {
        let connection = self.connection().await?;
        let mut notifications = self
            .io
            .subscribe_on(&connection, normal::STATUS_UUID)
            .await?;
        self.io
            .write_json_on(
                &connection,
                normal::PIN_MANAGEMENT_UUID,
                &PinManagementAction::GetLogs,
            )
            .await?;

        let wait = async {
            while let Some(text) = notifications.next_text().await {
                if StatusUpdate::from_json(&text).is_ok() {
                    continue;
                }
                return Ok(AuditLog::parse(&text));
            }
            Err(ClientError::NotConnected)
        };

        match tokio::time::timeout(self.audit_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                info!("No audit log received within {:?}", self.audit_timeout);
                Ok(AuditLog::default())
            }
        }
    }

    /// Read the certificate fingerprint characteristic.
    pub async fn read_cert_fingerprint(&self) -> Result<CertFingerprint> {
        let connection = self.connection().await?;
        let text = self
            .io
            .read_text_on(&connection, normal::CERT_FINGERPRINT_UUID)
            .await?;
        text.parse()
    }

    /// One-shot status read.
    pub async fn read_status(&self) -> Result<DeviceStatus> {
        let connection = self.connection().await?;
        let text = self.io.read_text_on(&connection, normal::STATUS_UUID).await?;
        let update = StatusUpdate::from_json(&text)?;
        Ok(DeviceStatus::default().merged(&update))
    }

    /// Fail unless the peripheral reports its USB host link up.
    pub async fn ensure_keyboard_connected(&self) -> Result<DeviceStatus> {
        let status = self.read_status().await?;
        if !status.keyboard_connected {
            return Err(ClientError::KeyboardNotConnected);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockBackend, MockPeripheral};
    use crate::bluetooth::{ConnectOptions, ConnectionManager};
    use std::sync::Arc;

    async fn client() -> (DeviceClient, Arc<MockPeripheral>) {
        let (backend, link) = MockBackend::with_link(BleMode::Normal);
        let manager = ConnectionManager::new(backend, ConnectOptions::default());
        manager.connect(BleMode::Normal).await.unwrap();
        (DeviceClient::new(ChannelIo::new(manager)), link)
    }

    fn actions(link: &MockPeripheral) -> Vec<String> {
        link.writes_to(normal::PIN_MANAGEMENT_UUID)
            .into_iter()
            .map(|bytes| String::from_utf8(bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_fingerprint_parsing() {
        let fp: CertFingerprint = "ab".repeat(32).parse().unwrap();
        assert_eq!(fp.to_hex(), "ab".repeat(32));
        assert!(fp.to_string().starts_with("AB:AB:"));
        assert!("abc".parse::<CertFingerprint>().is_err());
        assert!("zz".repeat(32).parse::<CertFingerprint>().is_err());

        let placeholder: CertFingerprint = "0".repeat(64).parse().unwrap();
        assert!(placeholder.is_placeholder());
    }

    #[test]
    fn test_fingerprint_matches_der() {
        let der = b"not really a certificate";
        let fp: CertFingerprint = hex::encode(Sha256::digest(der)).parse().unwrap();
        assert!(fp.matches_der(der));
        assert!(!fp.matches_der(b"something else"));
    }

    #[test]
    fn test_audit_entry_parsing() {
        let entry = AuditEntry::parse("<134>1 01:02:03 esp32-hid - auth_attempt - - fail 2").unwrap();
        assert_eq!(entry.uptime, Duration::from_secs(3723));
        assert_eq!(entry.event, "auth_attempt");
        assert_eq!(entry.details.as_deref(), Some("fail 2"));

        let bare = AuditEntry::parse("<134>1 00:00:05 esp32-hid - boot - -").unwrap();
        assert_eq!(bare.details, None);

        assert!(AuditEntry::parse("ttempt - - fail 2").is_none());
    }

    #[test]
    fn test_audit_log_skips_wrapped_fragment() {
        let raw = "_connect - -\n<134>1 00:00:01 esp32-hid - boot - -\n<134>1 00:00:09 esp32-hid - ble_connect - -\n";
        let log = AuditLog::parse(raw);
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.entries[1].event, "ble_connect");
    }

    #[tokio::test]
    async fn test_empty_text_is_noop() {
        let (client, link) = client().await;
        client.send_text("").await.unwrap();
        assert!(!link.had_traffic());

        client.send_text("hello").await.unwrap();
        assert_eq!(link.writes_to(normal::TEXT_INPUT_UUID), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_set_config_clamps() {
        let (client, link) = client().await;
        assert_eq!(client.set_config(ConfigKey::TypingDelay, 500).await.unwrap(), 100);
        assert_eq!(
            actions(&link),
            vec![r#"{"action":"set_config","key":"typing_delay","value":"100"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_change_pin_validates_new_pin() {
        let (client, link) = client().await;
        assert!(matches!(
            client.change_pin("482913", "000000").await,
            Err(ClientError::Format(_))
        ));
        assert!(!link.had_traffic());

        client.change_pin("482913", "590172").await.unwrap();
        assert_eq!(
            actions(&link),
            vec![r#"{"action":"set","old":"482913","new":"590172"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_fetch_audit_log_skips_status_notifications() {
        let (client, link) = client().await;
        link.on_write(|peripheral, uuid, _| {
            if uuid == normal::PIN_MANAGEMENT_UUID {
                peripheral.notify(normal::STATUS_UUID, br#"{"typing":false}"#);
                peripheral.notify(
                    normal::STATUS_UUID,
                    b"<134>1 00:00:01 esp32-hid - boot - -\n",
                );
            }
        });

        let log = client.fetch_audit_log().await.unwrap();
        assert_eq!(log.entries.len(), 1);
        assert_eq!(log.entries[0].event, "boot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_audit_log_empty_on_timeout() {
        let (client, _link) = client().await;
        let log = client.fetch_audit_log().await.unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_keyboard_check() {
        let (client, link) = client().await;
        link.set_value(normal::STATUS_UUID, br#"{"keyboard_connected":false}"#);
        assert!(matches!(
            client.ensure_keyboard_connected().await,
            Err(ClientError::KeyboardNotConnected)
        ));

        link.set_value(normal::STATUS_UUID, br#"{"keyboard_connected":true}"#);
        assert!(client.ensure_keyboard_connected().await.is_ok());
    }

    #[tokio::test]
    async fn test_key_combo_and_abort() {
        let (client, link) = client().await;
        client.key_combo(0x01, 0x06).await.unwrap();
        client.abort().await.unwrap();
        assert_eq!(
            actions(&link),
            vec![
                r#"{"action":"key_combo","modifier":1,"keycode":6}"#.to_string(),
                r#"{"action":"abort"}"#.to_string(),
            ]
        );
    }
}
