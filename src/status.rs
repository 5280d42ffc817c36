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

//! Live device status: notifications plus a periodic re-read.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::auth::AuthMachine;
use crate::bluetooth::{
    config, normal, BleMode, ChannelIo, Connection, DeviceStatus, StatusUpdate, Subscription,
};
use crate::error::Result;

/// Keeps a merged [`DeviceStatus`] for the active normal-mode connection.
pub struct StatusMonitor {
    io: ChannelIo,
    interval: Duration,
    auth: Option<AuthMachine>,
    view_tx: watch::Sender<Option<DeviceStatus>>,
    task: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl StatusMonitor {
    pub fn new(io: ChannelIo) -> Self {
        Self::with_interval(io, Duration::from_millis(config::STATUS_POLL_INTERVAL_MS))
    }

    pub fn with_interval(io: ChannelIo, interval: Duration) -> Self {
        let (view_tx, _) = watch::channel(None);
        Self {
            io,
            interval,
            auth: None,
            view_tx,
            task: Mutex::new(None),
        }
    }

    /// Feed every merged status into `auth`.
    pub fn with_auth(mut self, auth: AuthMachine) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Latest merged status, `None` when not monitoring.
    pub fn current(&self) -> Option<DeviceStatus> {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceStatus>> {
        self.view_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Start monitoring the active normal-mode connection.
    ///
    /// Calling it again for the same connection is a no-op.
    pub async fn start(&self) -> Result<()> {
        let connection = self.io.manager().require(BleMode::Normal).await?;

        let mut task = self.task.lock();
        if let Some((id, handle)) = task.as_ref() {
            if *id == connection.id() && !handle.is_finished() {
                return Ok(());
            }
        }
        if let Some((_, handle)) = task.take() {
            handle.abort();
        }

        info!("Status monitor started (every {:?})", self.interval);
        let poller = Poller {
            io: self.io.clone(),
            connection: connection.clone(),
            interval: self.interval,
            auth: self.auth.clone(),
            view_tx: self.view_tx.clone(),
        };
        *task = Some((connection.id(), tokio::spawn(poller.run())));
        Ok(())
    }

    /// Stop monitoring and clear the view.
    pub fn stop(&self) {
        if let Some((_, handle)) = self.task.lock().take() {
            handle.abort();
            debug!("Status monitor stopped");
        }
        self.view_tx.send_replace(None);
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

struct Poller {
    io: ChannelIo,
    connection: Connection,
    interval: Duration,
    auth: Option<AuthMachine>,
    view_tx: watch::Sender<Option<DeviceStatus>>,
}

impl Poller {
    async fn run(self) {
        let mut status = DeviceStatus::default();
        self.poll(&mut status).await;

        let mut updates = match self
            .io
            .subscribe_on(&self.connection, normal::STATUS_UUID)
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Status notifications unavailable, polling only: {}", e);
                None
            }
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately and the baseline read covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.connection.closed() => break,
                value = next_value(&mut updates) => match value {
                    Some(bytes) => self.merge(&mut status, &bytes),
                    None => updates = None,
                },
                _ = ticker.tick() => self.poll(&mut status).await,
            }
        }

        debug!("Status monitor for connection {} ended", self.connection.id());
        self.view_tx.send_replace(None);
    }

    async fn poll(&self, status: &mut DeviceStatus) {
        match self.io.read_on(&self.connection, normal::STATUS_UUID).await {
            Ok(bytes) => self.merge(status, &bytes),
            Err(e) => debug!("Status read failed: {}", e),
        }
    }

    fn merge(&self, status: &mut DeviceStatus, bytes: &[u8]) {
        let update = match StatusUpdate::from_bytes(bytes) {
            Ok(update) => update,
            Err(e) => {
                debug!("Ignoring status payload: {}", e);
                return;
            }
        };
        if self.connection.is_closed() {
            return;
        }

        status.apply(&update);
        if let Some(auth) = &self.auth {
            auth.observe(status);
        }
        self.view_tx.send_replace(Some(status.clone()));
    }
}

async fn next_value(updates: &mut Option<Subscription>) -> Option<Vec<u8>> {
    match updates {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
