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

//! BLE service and characteristic UUIDs for the HID typer peripheral.

use uuid::Uuid;

/// Provisioning mode (Improv WiFi compatible).
pub mod provisioning {
    use super::Uuid;

    /// Advertised name prefix while the peripheral is unprovisioned.
    pub const DEVICE_NAME: &str = "ESP32-HID-SETUP";

    /// Provisioning GATT service UUID.
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268000);

    /// Provisioning state, 1 byte.
    /// Properties: Read, Notify
    pub const STATUS_UUID: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268001);

    /// Last provisioning error, 1 byte.
    /// Properties: Read, Notify
    pub const ERROR_UUID: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268002);

    /// RPC command characteristic (JSON text).
    /// Properties: Write
    pub const RPC_COMMAND_UUID: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268003);

    /// RPC result characteristic (JSON text).
    /// Properties: Notify
    pub const RPC_RESULT_UUID: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268004);
}

/// Normal (operational) mode.
pub mod normal {
    use super::Uuid;

    /// Advertised name prefix once provisioned.
    pub const DEVICE_NAME: &str = "ESP32-HID-Typer";

    /// Normal-mode GATT service UUID.
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

    /// Text to type on the host.
    /// Properties: Write
    pub const TEXT_INPUT_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

    /// Device status JSON.
    /// Properties: Read, Notify
    pub const STATUS_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

    /// PIN management and device actions (JSON).
    /// Properties: Write
    pub const PIN_MANAGEMENT_UUID: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);

    /// TLS certificate fingerprint, 64 hex characters.
    /// Properties: Read
    pub const CERT_FINGERPRINT_UUID: Uuid =
        Uuid::from_u128(0x6e400006_b5a3_f393_e0a9_e50e24dcca9e);
}

/// BLE configuration constants.
pub mod config {
    /// Largest payload written in one GATT write.
    pub const WRITE_MTU: usize = 512;

    /// Interval between status re-reads while connected.
    pub const STATUS_POLL_INTERVAL_MS: u64 = 1000;

    /// How long discovery runs before giving up.
    pub const SCAN_TIMEOUT_SECS: u64 = 10;

    /// Default wait for an RPC result notification.
    pub const RPC_TIMEOUT_MS: u64 = 10_000;

    /// Wait for the audit log notification after `get_logs`.
    pub const AUDIT_LOG_TIMEOUT_MS: u64 = 5_000;

    /// Number of chunk writes needed for `len` bytes at `mtu`.
    pub fn chunk_count(len: usize, mtu: usize) -> usize {
        len.div_ceil(mtu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            provisioning::SERVICE_UUID.to_string(),
            "00467768-6228-2272-4663-277478268000"
        );
        assert_eq!(
            provisioning::RPC_RESULT_UUID.to_string(),
            "00467768-6228-2272-4663-277478268004"
        );
        assert_eq!(
            normal::SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            normal::CERT_FINGERPRINT_UUID.to_string(),
            "6e400006-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(config::chunk_count(0, 512), 0);
        assert_eq!(config::chunk_count(1, 512), 1);
        assert_eq!(config::chunk_count(512, 512), 1);
        assert_eq!(config::chunk_count(1300, 512), 3);
    }
}
