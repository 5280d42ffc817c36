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

//! Wire payloads for both peripheral modes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ClientError, Result};

/// Provisioning RPC command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ProvisioningCommand {
    SetPin { pin: String },
    SetWifi { ssid: String, password: String },
    Complete,
}

impl ProvisioningCommand {
    /// Command name as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetPin { .. } => "set_pin",
            Self::SetWifi { .. } => "set_wifi",
            Self::Complete => "complete",
        }
    }
}

/// Provisioning RPC result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl ProvisioningResponse {
    /// Decode a result notification.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ClientError::Protocol(format!("invalid RPC response: {}", e)))
    }
}

/// Provisioning status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    Ready = 0,
    Provisioning = 1,
    Provisioned = 2,
}

impl TryFrom<u8> for ProvisioningStatus {
    type Error = ClientError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Provisioning),
            2 => Ok(Self::Provisioned),
            other => Err(ClientError::Protocol(format!(
                "unknown provisioning status {}",
                other
            ))),
        }
    }
}

/// Provisioning error byte. Unrecognised values read as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningError {
    None = 0,
    InvalidPin = 1,
    UnableToConnect = 2,
    Unknown = 3,
}

impl From<u8> for ProvisioningError {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::InvalidPin,
            2 => Self::UnableToConnect,
            _ => Self::Unknown,
        }
    }
}

/// Device-side setting changed through `set_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    /// Delay between typed characters, in ms.
    TypingDelay,
    /// Status LED brightness, in percent.
    LedBrightness,
}

impl ConfigKey {
    /// Accepted value range.
    pub fn range(&self) -> (u32, u32) {
        match self {
            Self::TypingDelay => (5, 100),
            Self::LedBrightness => (1, 100),
        }
    }

    pub fn clamp(&self, value: u32) -> u32 {
        let (min, max) = self.range();
        value.clamp(min, max)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypingDelay => "typing_delay",
            Self::LedBrightness => "led_brightness",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action written to the PIN management characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PinManagementAction {
    /// Change the PIN.
    Set { old: String, new: String },
    /// Unlock the session.
    Verify { pin: String },
    /// Relock the session.
    Logout,
    /// Change a device-side setting. Values travel as decimal strings.
    SetConfig { key: ConfigKey, value: String },
    /// Request the audit log; it arrives as a status notification.
    GetLogs,
    /// Drop queued text and stop typing.
    Abort,
    /// Press a single key with modifiers.
    KeyCombo { modifier: u8, keycode: u8 },
}

impl PinManagementAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Verify { .. } => "verify",
            Self::Logout => "logout",
            Self::SetConfig { .. } => "set_config",
            Self::GetLogs => "get_logs",
            Self::Abort => "abort",
            Self::KeyCombo { .. } => "key_combo",
        }
    }
}

/// Authentication failure reported by the peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthError {
    InvalidPin,
    RateLimited,
    LockedOut,
    /// No error, or a code this client does not know.
    #[default]
    #[serde(other)]
    None,
}

/// Typing progress carried by `{"typing":true,"current":N,"total":M}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingProgress {
    pub current: u32,
    pub total: u32,
}

/// Partial status as sent by the peripheral. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<AuthError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

impl StatusUpdate {
    /// Decode a status payload. Non-object JSON is rejected.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text.trim())
            .map_err(|e| ClientError::Protocol(format!("invalid status: {}", e)))?;
        if !value.is_object() {
            return Err(ClientError::Protocol("status is not a JSON object".to_string()));
        }
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("invalid status: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_json(&String::from_utf8_lossy(bytes))
    }
}

/// Merged view of the peripheral's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub typing: bool,
    pub queue: u32,
    pub authenticated: bool,
    pub keyboard_connected: bool,
    pub retry_delay_ms: u32,
    pub locked_out: bool,
    pub auth_error: AuthError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TypingProgress>,
}

impl DeviceStatus {
    /// Merge `update` field by field. Fields it does not mention keep their
    /// value; the authentication invariants are restored afterwards.
    pub fn apply(&mut self, update: &StatusUpdate) {
        if let Some(v) = update.connected {
            self.connected = v;
        }
        if let Some(v) = update.typing {
            self.typing = v;
            if !v {
                self.progress = None;
            }
        }
        if let Some(v) = update.queue {
            self.queue = v;
        }
        if let Some(v) = update.authenticated {
            self.authenticated = v;
        }
        if let Some(v) = update.keyboard_connected {
            self.keyboard_connected = v;
        }
        if let Some(v) = update.retry_delay_ms {
            self.retry_delay_ms = v;
        }
        if let Some(v) = update.locked_out {
            self.locked_out = v;
        }
        if let Some(v) = update.auth_error {
            self.auth_error = v;
        }
        if let (Some(current), Some(total)) = (update.current, update.total) {
            self.progress = Some(TypingProgress { current, total });
        }

        if self.authenticated && (self.retry_delay_ms > 0 || self.locked_out) {
            // A fresh unlock report outranks stale throttling fields.
            let fresh_unlock = update.authenticated == Some(true)
                && update.retry_delay_ms.is_none()
                && update.locked_out.is_none();
            if fresh_unlock {
                self.retry_delay_ms = 0;
                self.locked_out = false;
            } else {
                self.authenticated = false;
            }
        }
        if self.authenticated {
            self.auth_error = AuthError::None;
        }
    }

    /// Copy with `update` applied.
    pub fn merged(&self, update: &StatusUpdate) -> Self {
        let mut next = self.clone();
        next.apply(update);
        next
    }

    /// Whether the peripheral reports a throttled unlock.
    pub fn is_rate_limited(&self) -> bool {
        !self.authenticated
            && !self.locked_out
            && (self.retry_delay_ms > 0 || self.auth_error == AuthError::RateLimited)
    }

    pub fn is_locked_out(&self) -> bool {
        self.locked_out || self.auth_error == AuthError::LockedOut
    }
}

/// Fold a sequence of updates into `initial`.
pub fn fold_updates<'a>(
    initial: DeviceStatus,
    updates: impl IntoIterator<Item = &'a StatusUpdate>,
) -> DeviceStatus {
    updates.into_iter().fold(initial, |mut status, update| {
        status.apply(update);
        status
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_command_serialization() {
        let json = serde_json::to_string(&ProvisioningCommand::SetPin {
            pin: "482913".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"set_pin","pin":"482913"}"#);

        let json = serde_json::to_string(&ProvisioningCommand::Complete).unwrap();
        assert_eq!(json, r#"{"command":"complete"}"#);

        let json = serde_json::to_string(&ProvisioningCommand::SetWifi {
            ssid: "home".to_string(),
            password: "secret".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"command":"set_wifi","ssid":"home","password":"secret"}"#
        );
    }

    #[test]
    fn test_provisioning_response_parsing() {
        let response =
            ProvisioningResponse::from_json(r#"{"success":false,"message":"weak pin"}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.message, "weak pin");

        assert!(matches!(
            ProvisioningResponse::from_json("not json"),
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn test_status_and_error_bytes() {
        assert_eq!(
            ProvisioningStatus::try_from(2).unwrap(),
            ProvisioningStatus::Provisioned
        );
        assert!(ProvisioningStatus::try_from(9).is_err());
        assert_eq!(ProvisioningError::from(1), ProvisioningError::InvalidPin);
        assert_eq!(ProvisioningError::from(200), ProvisioningError::Unknown);
    }

    #[test]
    fn test_pin_actions() {
        let verify = PinManagementAction::Verify {
            pin: "111111".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&verify).unwrap(),
            r#"{"action":"verify","pin":"111111"}"#
        );

        let config = PinManagementAction::SetConfig {
            key: ConfigKey::TypingDelay,
            value: "20".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&config).unwrap(),
            r#"{"action":"set_config","key":"typing_delay","value":"20"}"#
        );

        let combo = PinManagementAction::KeyCombo {
            modifier: 0x05,
            keycode: 0x4c,
        };
        assert_eq!(
            serde_json::to_string(&combo).unwrap(),
            r#"{"action":"key_combo","modifier":5,"keycode":76}"#
        );

        assert_eq!(
            serde_json::to_string(&PinManagementAction::GetLogs).unwrap(),
            r#"{"action":"get_logs"}"#
        );
    }

    #[test]
    fn test_config_key_clamp() {
        assert_eq!(ConfigKey::TypingDelay.clamp(1), 5);
        assert_eq!(ConfigKey::TypingDelay.clamp(250), 100);
        assert_eq!(ConfigKey::LedBrightness.clamp(0), 1);
        assert_eq!(ConfigKey::LedBrightness.clamp(42), 42);
    }

    #[test]
    fn test_status_update_parsing() {
        let update = StatusUpdate::from_json(
            r#"{"connected":true,"typing":false,"queue":0,"authenticated":false,
                "keyboard_connected":true,"retry_delay_ms":5000,"locked_out":false,
                "auth_error":"rate_limited"}"#,
        )
        .unwrap();
        assert_eq!(update.retry_delay_ms, Some(5000));
        assert_eq!(update.auth_error, Some(AuthError::RateLimited));

        let progress = StatusUpdate::from_json(r#"{"typing":true,"current":3,"total":10}"#).unwrap();
        assert_eq!(progress.current, Some(3));
        assert_eq!(progress.authenticated, None);

        let odd = StatusUpdate::from_json(r#"{"auth_error":"something_new"}"#).unwrap();
        assert_eq!(odd.auth_error, Some(AuthError::None));
        let none = StatusUpdate::from_json(r#"{"auth_error":"none"}"#).unwrap();
        assert_eq!(none.auth_error, Some(AuthError::None));
        assert_eq!(serde_json::to_string(&AuthError::None).unwrap(), r#""none""#);

        assert!(StatusUpdate::from_json("<134>1 12:00:00 esp32-hid - BOOT - - started").is_err());
        assert!(StatusUpdate::from_json("[1,2]").is_err());
    }

    #[test]
    fn test_merge_leaves_unmentioned_fields() {
        let mut status = DeviceStatus {
            authenticated: true,
            retry_delay_ms: 0,
            queue: 4,
            ..Default::default()
        };
        status.apply(&StatusUpdate {
            typing: Some(true),
            ..Default::default()
        });

        assert!(status.typing);
        assert!(status.authenticated);
        assert_eq!(status.retry_delay_ms, 0);
        assert_eq!(status.queue, 4);
    }

    #[test]
    fn test_merge_enforces_auth_invariants() {
        let mut status = DeviceStatus {
            authenticated: true,
            ..Default::default()
        };
        status.apply(&StatusUpdate {
            retry_delay_ms: Some(5000),
            ..Default::default()
        });
        assert!(!status.authenticated);
        assert!(status.is_rate_limited());

        status.apply(&StatusUpdate {
            authenticated: Some(true),
            ..Default::default()
        });
        assert!(status.authenticated);
        assert_eq!(status.retry_delay_ms, 0);

        status.apply(&StatusUpdate {
            locked_out: Some(true),
            retry_delay_ms: Some(u32::MAX),
            auth_error: Some(AuthError::LockedOut),
            ..Default::default()
        });
        assert!(!status.authenticated);
        assert!(status.is_locked_out());
        assert!(!status.is_rate_limited());
    }

    #[test]
    fn test_progress_tracking() {
        let status = fold_updates(
            DeviceStatus::default(),
            &[
                StatusUpdate {
                    typing: Some(true),
                    current: Some(1),
                    total: Some(5),
                    ..Default::default()
                },
                StatusUpdate {
                    typing: Some(true),
                    current: Some(5),
                    total: Some(5),
                    ..Default::default()
                },
            ],
        );
        assert_eq!(status.progress, Some(TypingProgress { current: 5, total: 5 }));

        let idle = status.merged(&StatusUpdate {
            typing: Some(false),
            ..Default::default()
        });
        assert_eq!(idle.progress, None);
    }
}
