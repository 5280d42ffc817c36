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

//! Connection lifecycle: discovery, the single active link, and teardown.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::{config, normal, provisioning};
use super::transport::{
    BleBackend, DeviceFilter, DeviceSelector, DiscoveredDevice, StrongestSignal, GattLink,
};
use crate::error::{ClientError, Result};

/// Peripheral operating mode, fixed for a connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BleMode {
    /// Initial setup: PIN and WiFi over the RPC channels.
    Provisioning,
    /// Operational: typing, status and PIN management.
    Normal,
}

impl BleMode {
    pub fn service_uuid(&self) -> Uuid {
        match self {
            Self::Provisioning => provisioning::SERVICE_UUID,
            Self::Normal => normal::SERVICE_UUID,
        }
    }

    pub fn default_name_prefix(&self) -> &'static str {
        match self {
            Self::Provisioning => provisioning::DEVICE_NAME,
            Self::Normal => normal::DEVICE_NAME,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for BleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The peripheral or the stack dropped the link.
    Remote,
    /// A liveness check on access found the link gone.
    LinkLost,
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection established.
    Connected {
        device_name: String,
        address: String,
        mode: BleMode,
    },
    /// Connection closed.
    Disconnected { reason: DisconnectReason },
}

type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send>;

struct ConnectionInner {
    id: u64,
    mode: BleMode,
    device: DiscoveredDevice,
    link: Arc<dyn GattLink>,
    closed_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<DisconnectCallback>>,
}

/// Handle to one open link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("device", &self.inner.device)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    fn new(id: u64, mode: BleMode, device: DiscoveredDevice, link: Arc<dyn GattLink>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                mode,
                device,
                link,
                closed_tx,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Monotonic per-manager id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mode(&self) -> BleMode {
        self.inner.mode
    }

    pub fn device(&self) -> &DiscoveredDevice {
        &self.inner.device
    }

    pub(crate) fn link(&self) -> &Arc<dyn GattLink> {
        &self.inner.link
    }

    /// Whether this connection has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        // The sender lives as long as `self`, so this only ends on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Register a callback for this connection's teardown.
    ///
    /// Returns `false` when the connection is already closed.
    pub fn on_disconnect(&self, callback: impl FnOnce(DisconnectReason) + Send + 'static) -> bool {
        let mut listeners = self.inner.listeners.lock();
        if self.is_closed() {
            return false;
        }
        listeners.push(Box::new(callback));
        true
    }

    /// Run `op` unless the connection closes first.
    pub(crate) async fn run<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        tokio::select! {
            biased;
            _ = self.closed() => Err(ClientError::NotConnected),
            result = op => match result {
                Err(_) if self.is_closed() => Err(ClientError::NotConnected),
                other => other,
            },
        }
    }

    /// Mark closed and fire listeners. Returns `true` only the first time.
    fn close(&self, reason: DisconnectReason) -> bool {
        let callbacks = {
            let mut listeners = self.inner.listeners.lock();
            let changed = self.inner.closed_tx.send_if_modified(|closed| {
                if *closed {
                    false
                } else {
                    *closed = true;
                    true
                }
            });
            if !changed {
                return false;
            }
            std::mem::take(&mut *listeners)
        };

        for callback in callbacks {
            callback(reason);
        }
        true
    }
}

/// Discovery and timing knobs for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub provisioning_name_prefix: String,
    pub normal_name_prefix: String,
    pub scan_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            provisioning_name_prefix: provisioning::DEVICE_NAME.to_string(),
            normal_name_prefix: normal::DEVICE_NAME.to_string(),
            scan_timeout: Duration::from_secs(config::SCAN_TIMEOUT_SECS),
        }
    }
}

impl ConnectOptions {
    fn filter(&self, mode: BleMode) -> DeviceFilter {
        let name_prefix = match mode {
            BleMode::Provisioning => &self.provisioning_name_prefix,
            BleMode::Normal => &self.normal_name_prefix,
        };
        DeviceFilter {
            name_prefix: name_prefix.clone(),
            service: mode.service_uuid(),
        }
    }
}

/// Owns the single active connection.
pub struct ConnectionManager {
    backend: Arc<dyn BleBackend>,
    selector: Mutex<Arc<dyn DeviceSelector>>,
    options: ConnectOptions,
    active: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a manager over a backend.
    pub fn new(backend: Arc<dyn BleBackend>, options: ConnectOptions) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            backend,
            selector: Mutex::new(Arc::new(StrongestSignal)),
            options,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            event_tx,
        })
    }

    /// Replace the device selection policy.
    pub fn set_selector(&self, selector: Arc<dyn DeviceSelector>) {
        *self.selector.lock() = selector;
    }

    /// Subscribe to connect/disconnect events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// List advertisers for `mode` without connecting.
    pub async fn scan(&self, mode: BleMode) -> Result<Vec<DiscoveredDevice>> {
        let filter = self.options.filter(mode);
        self.backend
            .discover(&filter, self.options.scan_timeout)
            .await
    }

    /// Scan for a peripheral in `mode` and make it the active connection.
    pub async fn connect(self: &Arc<Self>, mode: BleMode) -> Result<Connection> {
        self.disconnect().await;

        let filter = self.options.filter(mode);
        info!(
            "Scanning for '{}' ({} mode, service {})",
            filter.name_prefix, mode, filter.service
        );

        let candidates = self
            .backend
            .discover(&filter, self.options.scan_timeout)
            .await?;
        if candidates.is_empty() {
            warn!("No device matched '{}'", filter.name_prefix);
            return Err(ClientError::DeviceNotFound);
        }
        debug!("{} candidate(s) found", candidates.len());

        let selector = self.selector.lock().clone();
        let device = selector
            .select(&candidates)
            .ok_or(ClientError::UserCancelled)?;

        info!("Connecting to {} ({})", device.name, device.address);
        let link = self
            .backend
            .open(&device, filter.service)
            .await
            .map_err(|e| match e {
                ClientError::Link(_) => e,
                other => ClientError::Link(other.to_string()),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, mode, device.clone(), link);

        // A concurrent connect may have won; the newer call owns the slot.
        let replaced = self.active.lock().replace(connection.clone());
        if let Some(previous) = replaced {
            self.teardown(&previous, DisconnectReason::Requested);
        }

        self.spawn_link_watch(&connection);

        info!("Connected to {} in {} mode", device.name, mode);
        let _ = self.event_tx.send(ConnectionEvent::Connected {
            device_name: device.name,
            address: device.address,
            mode,
        });

        Ok(connection)
    }

    /// Close the active connection, if any.
    pub async fn disconnect(&self) {
        let current = self.active.lock().take();
        if let Some(connection) = current {
            info!("Disconnecting from {}", connection.device().name);
            self.teardown(&connection, DisconnectReason::Requested);
            if let Err(e) = connection.link().disconnect().await {
                debug!("Link disconnect reported: {}", e);
            }
        }
    }

    /// The active connection, after re-checking link liveness.
    pub async fn connection(&self) -> Option<Connection> {
        let connection = self.active.lock().clone()?;
        if !connection.is_closed() && connection.link().is_alive().await {
            return Some(connection);
        }

        warn!("Link to {} dropped silently", connection.device().name);
        self.teardown(&connection, DisconnectReason::LinkLost);
        None
    }

    /// The active connection, required to be in `mode`.
    pub async fn require(&self, mode: BleMode) -> Result<Connection> {
        let connection = self.connection().await.ok_or(ClientError::NotConnected)?;
        if connection.mode() != mode {
            return Err(ClientError::WrongMode {
                expected: mode,
                actual: connection.mode(),
            });
        }
        Ok(connection)
    }

    /// Whether a live connection exists.
    pub async fn is_connected(&self) -> bool {
        self.connection().await.is_some()
    }

    /// Register a teardown callback on the active connection.
    ///
    /// Returns `false` when there is nothing to register against.
    pub fn on_disconnect(&self, callback: impl FnOnce(DisconnectReason) + Send + 'static) -> bool {
        let current = self.active.lock().clone();
        match current {
            Some(connection) => connection.on_disconnect(callback),
            None => false,
        }
    }

    fn spawn_link_watch(self: &Arc<Self>, connection: &Connection) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let watched = connection.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.link().closed() => {
                    match manager.upgrade() {
                        Some(manager) => manager.teardown(&watched, DisconnectReason::Remote),
                        None => {
                            watched.close(DisconnectReason::Remote);
                        }
                    }
                }
                _ = watched.closed() => {}
            }
        });
    }

    fn teardown(&self, connection: &Connection, reason: DisconnectReason) {
        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|c| c.id() == connection.id()) {
                active.take();
            }
        }

        if connection.close(reason) {
            info!(
                "Connection {} to {} closed ({:?})",
                connection.id(),
                connection.device().name,
                reason
            );
            let _ = self.event_tx.send(ConnectionEvent::Disconnected { reason });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockBackend, MockPeripheral};
    use crate::bluetooth::transport::ByAddress;
    use std::sync::atomic::AtomicUsize;

    fn manager_with(links: &[Arc<MockPeripheral>]) -> (Arc<ConnectionManager>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        for link in links {
            backend.queue_link(link.clone());
        }
        let manager = ConnectionManager::new(backend.clone(), ConnectOptions::default());
        (manager, backend)
    }

    #[tokio::test]
    async fn test_connect_sets_active_connection() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, _backend) = manager_with(&[link]);
        let mut events = manager.events();

        let connection = manager.connect(BleMode::Normal).await.unwrap();
        assert_eq!(connection.mode(), BleMode::Normal);
        assert!(manager.is_connected().await);

        match events.recv().await.unwrap() {
            ConnectionEvent::Connected { mode, .. } => assert_eq!(mode, BleMode::Normal),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_without_advertisers() {
        let backend = Arc::new(MockBackend::new());
        let manager = ConnectionManager::new(backend, ConnectOptions::default());
        assert!(matches!(
            manager.connect(BleMode::Normal).await,
            Err(ClientError::DeviceNotFound)
        ));
    }

    #[tokio::test]
    async fn test_selector_decline_is_user_cancelled() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, _backend) = manager_with(&[link]);
        manager.set_selector(Arc::new(ByAddress("00:00:00:00:00:00".to_string())));

        assert!(matches!(
            manager.connect(BleMode::Normal).await,
            Err(ClientError::UserCancelled)
        ));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_open_failure_is_link_error() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, backend) = manager_with(&[link]);
        backend.fail_next_open();
        assert!(matches!(
            manager.connect(BleMode::Normal).await,
            Err(ClientError::Link(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, _backend) = manager_with(&[link.clone()]);
        manager.connect(BleMode::Normal).await.unwrap();

        manager.disconnect().await;
        manager.disconnect().await;

        assert!(!manager.is_connected().await);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_silent_drop_invalidates_on_access() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, _backend) = manager_with(&[link.clone()]);
        let connection = manager.connect(BleMode::Normal).await.unwrap();

        link.go_silent();
        assert!(manager.connection().await.is_none());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_on_disconnect_fires_once_for_remote_drop() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, _backend) = manager_with(&[link.clone()]);
        let connection = manager.connect(BleMode::Normal).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        assert!(manager.on_disconnect(move |reason| {
            assert_eq!(reason, DisconnectReason::Remote);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        link.drop_link();
        connection.closed().await;
        manager.disconnect().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!connection.on_disconnect(|_| {}));
    }

    #[tokio::test]
    async fn test_on_disconnect_fires_once_for_explicit_disconnect() {
        let link = MockPeripheral::new(BleMode::Normal);
        let (manager, _backend) = manager_with(&[link.clone()]);
        let connection = manager.connect(BleMode::Normal).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.disconnect().await;
        // The link watcher also observes the drop; it must not fire again.
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_invalidates_previous() {
        let first = MockPeripheral::new(BleMode::Normal);
        let second = MockPeripheral::new(BleMode::Provisioning);
        let (manager, _backend) = manager_with(&[first.clone(), second]);

        let old = manager.connect(BleMode::Normal).await.unwrap();
        let new = manager.connect(BleMode::Provisioning).await.unwrap();

        assert!(old.is_closed());
        assert!(!first.is_connected());
        assert!(new.id() > old.id());
        assert_eq!(
            manager.connection().await.unwrap().mode(),
            BleMode::Provisioning
        );
    }

    #[tokio::test]
    async fn test_require_checks_mode() {
        let link = MockPeripheral::new(BleMode::Provisioning);
        let (manager, _backend) = manager_with(&[link]);

        assert!(matches!(
            manager.require(BleMode::Normal).await,
            Err(ClientError::NotConnected)
        ));
        manager.connect(BleMode::Provisioning).await.unwrap();
        assert!(matches!(
            manager.require(BleMode::Normal).await,
            Err(ClientError::WrongMode { .. })
        ));
    }
}
