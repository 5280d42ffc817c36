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

//! Scripted in-memory peripheral for tests.
//!
//! [`MockPeripheral`] implements [`GattLink`] and records every call in
//! order, so tests can assert on the exact sequence of reads, writes and
//! subscriptions. Peripheral behaviour is scripted with stored values,
//! queued read results, write hooks and injected failures.
//!
//! ```
//! use hid_typer_companion::bluetooth::mock::{LinkCall, MockPeripheral};
//! use hid_typer_companion::bluetooth::{normal, BleMode};
//!
//! let peripheral = MockPeripheral::new(BleMode::Normal);
//! peripheral.set_value(normal::STATUS_UUID, br#"{"authenticated":true}"#);
//! assert!(peripheral.calls().is_empty());
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::connection::BleMode;
use super::transport::{BleBackend, DeviceFilter, DiscoveredDevice, GattLink, Notifications};
use crate::error::{ClientError, Result};

/// One recorded link operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Disconnect,
}

/// Failures the mock can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// "Operation already in progress".
    Busy,
    /// Generic GATT failure.
    Gatt,
    /// Link gone.
    NotConnected,
}

impl From<MockFailure> for ClientError {
    fn from(failure: MockFailure) -> Self {
        match failure {
            MockFailure::Busy => ClientError::TransientLinkBusy,
            MockFailure::Gatt => ClientError::Link("GATT operation failed".to_string()),
            MockFailure::NotConnected => ClientError::NotConnected,
        }
    }
}

/// Hook run after each successful write, outside the mock's lock.
pub type WriteHook = Box<dyn FnMut(&MockPeripheral, Uuid, &[u8]) + Send>;

#[derive(Default)]
struct MockState {
    calls: Vec<LinkCall>,
    values: HashMap<Uuid, Vec<u8>>,
    read_script: HashMap<Uuid, VecDeque<std::result::Result<Vec<u8>, MockFailure>>>,
    write_failures: HashMap<usize, MockFailure>,
    subscribe_failures: HashMap<Uuid, usize>,
    subscribers: HashMap<Uuid, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    writes: usize,
    writes_in_flight: usize,
    peak_writes_in_flight: usize,
    write_delay: Option<Duration>,
    hook: Option<WriteHook>,
}

/// In-memory peripheral implementing [`GattLink`].
pub struct MockPeripheral {
    mode: BleMode,
    address: String,
    alive: AtomicBool,
    state: Mutex<MockState>,
    closed_tx: watch::Sender<bool>,
}

static NEXT_ADDRESS: AtomicUsize = AtomicUsize::new(1);

impl MockPeripheral {
    /// A connected peripheral advertising `mode`'s service.
    pub fn new(mode: BleMode) -> Arc<Self> {
        let n = NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            mode,
            address: format!("AA:BB:CC:DD:{:02X}:{:02X}", (n >> 8) & 0xff, n & 0xff),
            alive: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
            closed_tx,
        })
    }

    pub fn mode(&self) -> BleMode {
        self.mode
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertisement as seen by discovery.
    pub fn advertisement(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            address: self.address.clone(),
            name: format!("{}-{}", self.mode.default_name_prefix(), &self.address[12..]),
            rssi: Some(-50),
        }
    }

    /// Recorded operations, in issue order.
    pub fn calls(&self) -> Vec<LinkCall> {
        self.state.lock().calls.clone()
    }

    /// Payloads written to `characteristic`, one entry per chunk.
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Write(uuid, data) if *uuid == characteristic => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether any read or write has been issued.
    pub fn had_traffic(&self) -> bool {
        self.state
            .lock()
            .calls
            .iter()
            .any(|call| matches!(call, LinkCall::Read(_) | LinkCall::Write(..)))
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Value returned by reads once the script is exhausted.
    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.state.lock().values.insert(characteristic, value.to_vec());
    }

    /// Queue a one-shot read result ahead of the stored value.
    pub fn push_read(
        &self,
        characteristic: Uuid,
        result: std::result::Result<Vec<u8>, MockFailure>,
    ) {
        self.state
            .lock()
            .read_script
            .entry(characteristic)
            .or_default()
            .push_back(result);
    }

    /// Fail the `index`-th write issued on this link (zero-based, all
    /// characteristics counted).
    pub fn fail_write_at(&self, index: usize, failure: MockFailure) {
        self.state.lock().write_failures.insert(index, failure);
    }

    /// Fail the next `times` subscriptions on `characteristic`.
    pub fn fail_subscribe(&self, characteristic: Uuid, times: usize) {
        self.state
            .lock()
            .subscribe_failures
            .insert(characteristic, times);
    }

    /// Delay every write, to let tests interleave events.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = Some(delay);
    }

    /// Most writes that were ever in progress at the same time.
    pub fn peak_concurrent_writes(&self) -> usize {
        self.state.lock().peak_writes_in_flight
    }

    /// Script how the peripheral reacts to writes.
    pub fn on_write(&self, hook: impl FnMut(&MockPeripheral, Uuid, &[u8]) + Send + 'static) {
        self.state.lock().hook = Some(Box::new(hook));
    }

    /// Push a notification to current subscribers of `characteristic`.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(&characteristic) {
            subscribers.retain(|tx| tx.send(value.to_vec()).is_ok());
        }
    }

    /// Number of live subscriptions on `characteristic`.
    pub fn subscriber_count(&self, characteristic: Uuid) -> usize {
        self.state
            .lock()
            .subscribers
            .get(&characteristic)
            .map_or(0, |subscribers| {
                subscribers.iter().filter(|tx| !tx.is_closed()).count()
            })
    }

    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Peripheral-initiated disconnect.
    pub fn drop_link(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.lock().subscribers.clear();
        self.closed_tx.send_replace(true);
    }

    /// Link gone without any event reaching the central.
    pub fn go_silent(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    async fn perform_write(&self, characteristic: Uuid, chunk: &[u8]) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(LinkCall::Write(characteristic, chunk.to_vec()));
            let index = state.writes;
            state.writes += 1;
            if let Some(failure) = state.write_failures.remove(&index) {
                return Err(failure.into());
            }
            state.write_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.check_alive()?;
        }

        let hook = self.state.lock().hook.take();
        if let Some(mut hook) = hook {
            hook(self, characteristic, chunk);
            let mut state = self.state.lock();
            if state.hook.is_none() {
                state.hook = Some(hook);
            }
        }
        Ok(())
    }
}

/// Counts a write as in flight until dropped.
struct WriteInFlight<'a>(&'a MockPeripheral);

impl<'a> WriteInFlight<'a> {
    fn enter(peripheral: &'a MockPeripheral) -> Self {
        let mut state = peripheral.state.lock();
        state.writes_in_flight += 1;
        state.peak_writes_in_flight = state.peak_writes_in_flight.max(state.writes_in_flight);
        Self(peripheral)
    }
}

impl Drop for WriteInFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().writes_in_flight -= 1;
    }
}

#[async_trait]
impl GattLink for MockPeripheral {
    async fn is_alive(&self) -> bool {
        self.is_connected()
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.check_alive()?;
        let mut state = self.state.lock();
        state.calls.push(LinkCall::Read(characteristic));
        if let Some(scripted) = state
            .read_script
            .get_mut(&characteristic)
            .and_then(|queue| queue.pop_front())
        {
            return scripted.map_err(ClientError::from);
        }
        state
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| ClientError::Link(format!("characteristic {} not readable", characteristic)))
    }

    async fn write(&self, characteristic: Uuid, chunk: &[u8]) -> Result<()> {
        self.check_alive()?;
        let _in_flight = WriteInFlight::enter(self);
        self.perform_write(characteristic, chunk).await
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications> {
        self.check_alive()?;
        let mut state = self.state.lock();
        state.calls.push(LinkCall::Subscribe(characteristic));

        if let Some(remaining) = state.subscribe_failures.get_mut(&characteristic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::Subscription(
                    "insufficient encryption while pairing".to_string(),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.entry(characteristic).or_default().push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().calls.push(LinkCall::Disconnect);
        self.drop_link();
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Backend handing out queued [`MockPeripheral`]s.
#[derive(Default)]
pub struct MockBackend {
    links: Mutex<VecDeque<Arc<MockPeripheral>>>,
    fail_open: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with a single queued peripheral.
    pub fn with_link(mode: BleMode) -> (Arc<Self>, Arc<MockPeripheral>) {
        let backend = Arc::new(Self::new());
        let link = MockPeripheral::new(mode);
        backend.queue_link(link.clone());
        (backend, link)
    }

    /// Make `link` discoverable; each open consumes one.
    pub fn queue_link(&self, link: Arc<MockPeripheral>) {
        self.links.lock().push_back(link);
    }

    /// Fail the next `open` as a GATT connect error.
    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    async fn discover(
        &self,
        filter: &DeviceFilter,
        _timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        Ok(self
            .links
            .lock()
            .iter()
            .filter(|link| link.mode().service_uuid() == filter.service)
            .map(|link| link.advertisement())
            .collect())
    }

    async fn open(&self, device: &DiscoveredDevice, service: Uuid) -> Result<Arc<dyn GattLink>> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Link("connection attempt failed".to_string()));
        }

        let mut links = self.links.lock();
        let position = links
            .iter()
            .position(|link| link.address() == device.address && link.mode().service_uuid() == service)
            .ok_or_else(|| ClientError::Link(format!("{} went away", device.address)))?;
        let link = links.remove(position).ok_or(ClientError::DeviceNotFound)?;
        Ok(link)
    }
}
