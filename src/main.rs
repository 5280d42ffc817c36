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

//! HID Typer command line companion.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hid_typer_companion::auth::{AuthOutcome, AuthState};
use hid_typer_companion::bluetooth::{BleMode, BluerBackend, ConfigKey, ConnectionEvent};
use hid_typer_companion::config::{Config, SettingsStore};
use hid_typer_companion::device::CertFingerprint;
use hid_typer_companion::firmware::{self, FileManifest, REQUIRED_FILES};
use hid_typer_companion::provisioning::WifiCredentials;
use hid_typer_companion::state::Session;

/// HID modifier bits for left Ctrl and left Alt.
const CTRL_ALT: u8 = 0x01 | 0x04;

#[derive(Parser)]
#[command(name = "hid-typer", version)]
#[command(about = "Companion client for the ESP32 BLE HID typer")]
struct Cli {
    /// Connect only to the device with this address
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Configuration file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct Unlock {
    /// Unlock with this PIN before running the command
    #[arg(short, long)]
    pin: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby devices
    Scan {
        /// Look for unprovisioned devices instead
        #[arg(long)]
        setup: bool,
    },
    /// Set up an unprovisioned device
    Provision {
        /// PIN to set
        #[arg(long)]
        pin: String,
        /// WiFi network name
        #[arg(long, requires = "password")]
        ssid: Option<String>,
        /// WiFi password
        #[arg(long, requires = "ssid")]
        password: Option<String>,
    },
    /// Show device status
    Status {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Unlock the device
    Unlock {
        #[arg(long)]
        pin: String,
    },
    /// Type text on the host ("-" reads stdin)
    Send {
        text: String,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Press a key combination
    Key {
        /// Modifier bitmask, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_byte)]
        modifier: u8,
        /// HID usage id, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_byte)]
        keycode: u8,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Stop typing and drop queued text
    Abort {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Change device settings
    Config {
        /// Delay between characters in ms (5-100)
        #[arg(long)]
        typing_delay: Option<u32>,
        /// LED brightness in percent (1-100)
        #[arg(long)]
        led_brightness: Option<u32>,
        /// Allow key combinations that can affect the host system
        #[arg(long)]
        advanced: Option<bool>,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Change the PIN
    ChangePin {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
    },
    /// Print the device audit log
    Logs {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Show the TLS certificate fingerprint
    Fingerprint {
        /// DER certificate to check against the fingerprint
        #[arg(long)]
        cert: Option<PathBuf>,
    },
    /// Follow status changes until interrupted
    Watch {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// List flashable firmware releases from a manifest file
    Releases {
        #[arg(long)]
        manifest: PathBuf,
    },
}

fn parse_byte(value: &str) -> std::result::Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hid_typer_companion=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(address) = &cli.device {
        config.bluetooth.device_address = Some(address.clone());
    }

    if let Commands::Releases { manifest } = &cli.command {
        return list_releases(manifest.clone()).await;
    }

    let backend = Arc::new(BluerBackend::new().await?);
    let session = Session::new(backend, &config.bluetooth);

    let result = run(&session, &mut config, cli.command).await;
    session.disconnect().await;
    result
}

async fn run(session: &Session, config: &mut Config, command: Commands) -> Result<()> {
    match command {
        Commands::Scan { setup } => {
            let mode = if setup {
                BleMode::Provisioning
            } else {
                BleMode::Normal
            };
            let devices = session.manager.scan(mode).await?;
            println!("Found {} device(s) in {} mode:", devices.len(), mode);
            for device in devices {
                let rssi = device
                    .rssi
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} ({}) RSSI: {}", device.name, device.address, rssi);
            }
        }

        Commands::Provision { pin, ssid, password } => {
            session.connect_provisioning().await?;
            let wifi = ssid.zip(password).map(|(ssid, password)| WifiCredentials { ssid, password });
            let response = session.provisioner.provision(&pin, wifi.as_ref()).await?;
            if !response.success {
                let error = session.provisioner.read_error().await.ok();
                bail!("Provisioning failed: {} ({:?})", response.message, error);
            }
            println!("Device provisioned. It will restart in normal mode.");
        }

        Commands::Status { unlock } => {
            open_normal(session, &unlock).await?;
            let status = session.device.read_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Unlock { pin } => {
            open_normal(session, &Unlock { pin: Some(pin) }).await?;
            println!("Unlocked");
        }

        Commands::Send { text, unlock } => {
            let text = if text == "-" {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                text
            };
            open_normal(session, &unlock).await?;
            session.device.ensure_keyboard_connected().await?;
            session.device.send_text(&text).await?;
            println!("Sent {} characters", text.chars().count());
        }

        Commands::Key {
            modifier,
            keycode,
            unlock,
        } => {
            if modifier & CTRL_ALT == CTRL_ALT && !config.advanced_commands() {
                bail!("Ctrl+Alt combinations are disabled. Enable them with `config --advanced true`.");
            }
            open_normal(session, &unlock).await?;
            session.device.key_combo(modifier, keycode).await?;
        }

        Commands::Abort { unlock } => {
            open_normal(session, &unlock).await?;
            session.device.abort().await?;
            println!("Typing aborted");
        }

        Commands::Config {
            typing_delay,
            led_brightness,
            advanced,
            unlock,
        } => {
            if let Some(enabled) = advanced {
                config.set_advanced_commands(enabled)?;
                println!("Advanced commands {}", if enabled { "enabled" } else { "disabled" });
            }

            let changes: Vec<(ConfigKey, u32)> = [
                (ConfigKey::TypingDelay, typing_delay),
                (ConfigKey::LedBrightness, led_brightness),
            ]
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();

            if changes.is_empty() {
                println!("typing_delay = {} ms", config.get(ConfigKey::TypingDelay));
                println!("led_brightness = {} %", config.get(ConfigKey::LedBrightness));
                println!("advanced_commands = {}", config.advanced_commands());
                return Ok(());
            }

            open_normal(session, &unlock).await?;
            for (key, value) in changes {
                let applied = session.device.set_config(key, value).await?;
                config.set(key, applied)?;
                println!("{} = {}", key, applied);
            }
        }

        Commands::ChangePin { old, new } => {
            open_normal(session, &Unlock { pin: Some(old.clone()) }).await?;
            session.device.change_pin(&old, &new).await?;
            println!("PIN changed");
        }

        Commands::Logs { unlock } => {
            open_normal(session, &unlock).await?;
            let log = session.device.fetch_audit_log().await?;
            if log.raw.is_empty() {
                println!("Audit log is empty");
            } else {
                print!("{}", log.raw);
            }
        }

        Commands::Fingerprint { cert } => {
            open_normal(session, &Unlock::default()).await?;
            let fingerprint = session.device.read_cert_fingerprint().await?;
            print_fingerprint(&fingerprint, cert)?;
        }

        Commands::Watch { unlock } => {
            open_normal(session, &unlock).await?;
            watch(session).await?;
        }

        Commands::Releases { manifest } => list_releases(manifest).await?,
    }
    Ok(())
}

/// Connect in normal mode and unlock when a PIN is given.
async fn open_normal(session: &Session, unlock: &Unlock) -> Result<()> {
    let state = session.connect_normal().await?;
    info!(
        "Connected to {}",
        session.device_name().unwrap_or_default()
    );

    match state {
        AuthState::Unlocked => return Ok(()),
        AuthState::LockedOut => bail!(AuthOutcome::LockedOut.message()),
        _ => {}
    }

    let Some(pin) = &unlock.pin else {
        warn!("Device is locked; pass --pin to unlock");
        return Ok(());
    };

    let outcome = session.auth.authenticate(pin).await?;
    if outcome != AuthOutcome::Unlocked {
        bail!(outcome.message());
    }
    Ok(())
}

fn print_fingerprint(fingerprint: &CertFingerprint, cert: Option<PathBuf>) -> Result<()> {
    if fingerprint.is_placeholder() {
        println!("Device has no certificate installed");
        return Ok(());
    }
    println!("SHA-256: {}", fingerprint);

    if let Some(path) = cert {
        let der = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        if fingerprint.matches_der(&der) {
            println!("Certificate {} matches", path.display());
        } else {
            bail!("Certificate {} does not match the device", path.display());
        }
    }
    Ok(())
}

async fn watch(session: &Session) -> Result<()> {
    let mut status_rx = session.monitor.subscribe();
    let mut auth_rx = session.auth.subscribe();
    let mut events = session.manager.events();

    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(status) = status_rx.borrow_and_update().clone() {
                    println!("{}", serde_json::to_string(&status)?);
                }
            }
            changed = auth_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("auth: {:?}", *auth_rx.borrow_and_update());
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    println!("{:?}", event);
                    if matches!(event, ConnectionEvent::Disconnected { .. }) {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

async fn list_releases(manifest: PathBuf) -> Result<()> {
    let releases = firmware::available_releases(&FileManifest(manifest)).await?;
    if releases.is_empty() {
        println!("No flashable releases (each needs {})", REQUIRED_FILES.join(", "));
        return Ok(());
    }
    for release in releases {
        println!("{}", release.tag);
        for file in REQUIRED_FILES {
            if let Some(url) = release.file_url(file) {
                println!("  {}", url);
            }
        }
    }
    Ok(())
}
