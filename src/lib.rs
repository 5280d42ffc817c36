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

//! Companion client for the ESP32 BLE HID typer.
//!
//! Connects to the peripheral over GATT, provisions it, unlocks it with a
//! PIN and sends text for it to type on its USB host.

pub mod auth;
pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod provisioning;
pub mod state;
pub mod status;

pub use error::{ClientError, PinFormatError, Result};
