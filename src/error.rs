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

//! Error type shared by every layer of the device client.

use thiserror::Error;

use crate::bluetooth::BleMode;

/// Result alias used across the library.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors surfaced by the connection, channel and protocol layers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No advertiser matched the mode's name prefix or service.
    #[error("No matching device found")]
    DeviceNotFound,

    /// Device selection was dismissed before a device was chosen.
    #[error("Device selection cancelled")]
    UserCancelled,

    /// Connecting to the GATT server or resolving the service failed.
    #[error("Link error: {0}")]
    Link(String),

    /// No active connection, or the connection closed mid-operation.
    #[error("Not connected")]
    NotConnected,

    /// The link rejected a concurrently issued operation.
    #[error("Operation already in progress, retry shortly")]
    TransientLinkBusy,

    /// Writing chunk `chunk_index` failed. Earlier chunks were delivered.
    #[error("Write failed at chunk {chunk_index}: {source}")]
    Write {
        chunk_index: usize,
        #[source]
        source: Box<ClientError>,
    },

    /// Enabling notifications failed, typically during pairing.
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// A response payload could not be decoded.
    #[error("Malformed response: {0}")]
    Protocol(String),

    /// Local PIN validation failed; the peripheral was not contacted.
    #[error("{0}")]
    Format(#[from] PinFormatError),

    /// The operation needs the other operating mode.
    #[error("Operation requires {expected} mode, connected in {actual} mode")]
    WrongMode { expected: BleMode, actual: BleMode },

    /// No response arrived in time.
    #[error("Timed out waiting for device response")]
    Timeout,

    /// An earlier request timed out on this connection; its response may
    /// still arrive and would be mistaken for the next one.
    #[error("A previous request is still unanswered, reconnect to continue")]
    ResponseStalled,

    /// The peripheral reports that its USB host link is down.
    #[error("USB keyboard is not connected. Attach the device to a host first.")]
    KeyboardNotConnected,

    /// Release manifest or flashing failure.
    #[error("Firmware: {0}")]
    Firmware(String),
}

impl ClientError {
    /// Whether an explicit user retry is likely to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientLinkBusy => true,
            Self::Write { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether the caller should route the user back to connecting.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ResponseStalled)
    }
}

/// Reasons a PIN is rejected before anything is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PinFormatError {
    #[error("PIN must be exactly 6 digits")]
    Length,
    #[error("PIN must contain only digits")]
    NonDigit,
    #[error("PIN cannot be 000000")]
    AllZero,
    #[error("PIN cannot be a sequential number")]
    Sequential,
    #[error("PIN cannot be all the same digit")]
    Repeated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::TransientLinkBusy.is_retryable());
        assert!(ClientError::Write {
            chunk_index: 1,
            source: Box::new(ClientError::TransientLinkBusy),
        }
        .is_retryable());
        assert!(!ClientError::Write {
            chunk_index: 0,
            source: Box::new(ClientError::Link("gatt".into())),
        }
        .is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
    }

    #[test]
    fn test_format_error_message() {
        let err = ClientError::from(PinFormatError::Length);
        assert_eq!(err.to_string(), "PIN must be exactly 6 digits");
        assert!(!err.needs_reconnect());
        assert!(ClientError::NotConnected.needs_reconnect());
    }
}
