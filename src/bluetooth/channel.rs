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

//! Read, chunked write and subscribe over GATT characteristics.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::ble_constants::config;
use super::connection::{Connection, ConnectionManager};
use super::transport::Notifications;
use crate::error::{ClientError, Result};

/// Channel operations against the manager's active connection.
#[derive(Clone)]
pub struct ChannelIo {
    manager: Arc<ConnectionManager>,
    mtu: usize,
}

impl ChannelIo {
    /// Channel I/O with the default 512 byte write MTU.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self::with_mtu(manager, config::WRITE_MTU)
    }

    pub fn with_mtu(manager: Arc<ConnectionManager>, mtu: usize) -> Self {
        Self {
            manager,
            mtu: mtu.max(1),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    async fn active(&self) -> Result<Connection> {
        self.manager
            .connection()
            .await
            .ok_or(ClientError::NotConnected)
    }

    /// Read a characteristic value.
    pub async fn read(&self, channel: Uuid) -> Result<Vec<u8>> {
        let connection = self.active().await?;
        self.read_on(&connection, channel).await
    }

    /// Read a characteristic as text.
    pub async fn read_text(&self, channel: Uuid) -> Result<String> {
        let bytes = self.read(channel).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `data`, split into MTU-sized chunks written in order.
    ///
    /// A failure at chunk `k` leaves chunks `0..k` delivered.
    pub async fn write(&self, channel: Uuid, data: &[u8]) -> Result<()> {
        let connection = self.active().await?;
        self.write_on(&connection, channel, data).await
    }

    pub async fn write_text(&self, channel: Uuid, text: &str) -> Result<()> {
        self.write(channel, text.as_bytes()).await
    }

    /// Serialize `value` as JSON and write it.
    pub async fn write_json<T: Serialize>(&self, channel: Uuid, value: &T) -> Result<()> {
        let connection = self.active().await?;
        self.write_json_on(&connection, channel, value).await
    }

    /// Enable notifications on `channel`.
    pub async fn subscribe(&self, channel: Uuid) -> Result<Subscription> {
        let connection = self.active().await?;
        self.subscribe_on(&connection, channel).await
    }

    pub(crate) async fn read_on(&self, connection: &Connection, channel: Uuid) -> Result<Vec<u8>> {
        connection.run(connection.link().read(channel)).await
    }

    pub(crate) async fn read_text_on(&self, connection: &Connection, channel: Uuid) -> Result<String> {
        let bytes = self.read_on(connection, channel).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) async fn write_on(
        &self,
        connection: &Connection,
        channel: Uuid,
        data: &[u8],
    ) -> Result<()> {
        if connection.is_closed() {
            return Err(ClientError::NotConnected);
        }

        let total = config::chunk_count(data.len(), self.mtu);
        for (chunk_index, chunk) in data.chunks(self.mtu).enumerate() {
            debug!(
                "Writing chunk {}/{} ({} bytes) to {}",
                chunk_index + 1,
                total,
                chunk.len(),
                channel
            );
            connection
                .run(connection.link().write(channel, chunk))
                .await
                .map_err(|e| match e {
                    ClientError::NotConnected => e,
                    other => ClientError::Write {
                        chunk_index,
                        source: Box::new(other),
                    },
                })?;
        }
        Ok(())
    }

    pub(crate) async fn write_json_on<T: Serialize>(
        &self,
        connection: &Connection,
        channel: Uuid,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.write_on(connection, channel, &payload).await
    }

    pub(crate) async fn subscribe_on(
        &self,
        connection: &Connection,
        channel: Uuid,
    ) -> Result<Subscription> {
        let stream = connection
            .run(connection.link().subscribe(channel))
            .await
            .map_err(|e| match e {
                ClientError::NotConnected | ClientError::Subscription(_) => e,
                other => ClientError::Subscription(other.to_string()),
            })?;
        debug!("Subscribed to {}", channel);
        Ok(Subscription {
            connection: connection.clone(),
            channel,
            stream,
        })
    }
}

/// Values pushed on one characteristic.
///
/// Ends when the connection closes. Dropping it unsubscribes.
pub struct Subscription {
    connection: Connection,
    channel: Uuid,
    stream: Notifications,
}

impl Subscription {
    pub fn channel(&self) -> Uuid {
        self.channel
    }

    /// Next value, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        if self.connection.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.connection.closed() => None,
            value = self.stream.next() => value,
        }
    }

    /// Next value decoded as text.
    pub async fn next_text(&mut self) -> Option<String> {
        self.next()
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn into_stream(self) -> BoxStream<'static, Vec<u8>> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|value| (value, subscription))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::connection::{BleMode, ConnectOptions};
    use crate::bluetooth::mock::{LinkCall, MockBackend, MockFailure, MockPeripheral};
    use std::time::Duration;

    const CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

    async fn connected(mode: BleMode) -> (ChannelIo, Arc<MockPeripheral>) {
        let (backend, link) = MockBackend::with_link(mode);
        let manager = ConnectionManager::new(backend, ConnectOptions::default());
        manager.connect(mode).await.unwrap();
        (ChannelIo::new(manager), link)
    }

    #[tokio::test]
    async fn test_write_chunks_in_order() {
        let (io, link) = connected(BleMode::Normal).await;
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();

        io.write(CHAR, &payload).await.unwrap();

        let chunks = link.writes_to(CHAR);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![512, 512, 276]);
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_chunk_awaited_before_next() {
        let (io, link) = connected(BleMode::Normal).await;
        link.set_write_delay(Duration::from_millis(20));

        io.write(CHAR, &[0x55u8; 1300]).await.unwrap();

        assert_eq!(link.writes_to(CHAR).len(), 3);
        assert_eq!(link.peak_concurrent_writes(), 1);
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let manager = ConnectionManager::new(Arc::new(MockBackend::new()), ConnectOptions::default());
        let io = ChannelIo::new(manager);
        assert!(matches!(
            io.write(CHAR, b"hello").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(io.read(CHAR).await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failed_chunk_reports_index_and_stops() {
        let (io, link) = connected(BleMode::Normal).await;
        link.fail_write_at(1, MockFailure::Busy);

        let err = io.write(CHAR, &[7u8; 1300]).await.unwrap_err();
        match &err {
            ClientError::Write { chunk_index, .. } => assert_eq!(*chunk_index, 1),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
        // Chunk 0 delivered, chunk 1 attempted, chunk 2 never issued.
        assert_eq!(link.writes_to(CHAR).len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_mid_write_is_not_connected() {
        let (io, link) = connected(BleMode::Normal).await;
        link.set_write_delay(Duration::from_millis(50));

        let writer = {
            let io = io.clone();
            tokio::spawn(async move { io.write(CHAR, &[1u8; 2000]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        link.drop_link();

        let result = writer.await.unwrap();
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscription_ends_on_disconnect() {
        let (io, link) = connected(BleMode::Normal).await;
        let mut subscription = io.subscribe(CHAR).await.unwrap();

        link.notify(CHAR, b"{\"typing\":true}");
        assert_eq!(
            subscription.next_text().await.as_deref(),
            Some("{\"typing\":true}")
        );

        io.manager().disconnect().await;
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_subscription_error() {
        let (io, link) = connected(BleMode::Normal).await;
        link.fail_subscribe(CHAR, 1);

        assert!(matches!(
            io.subscribe(CHAR).await,
            Err(ClientError::Subscription(_))
        ));
        assert!(io.subscribe(CHAR).await.is_ok());
        assert_eq!(
            link.calls()
                .iter()
                .filter(|c| matches!(c, LinkCall::Subscribe(_)))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_read_text_is_lossy() {
        let (io, link) = connected(BleMode::Normal).await;
        link.set_value(CHAR, &[b'o', b'k', 0xff]);
        assert_eq!(io.read_text(CHAR).await.unwrap(), "ok\u{fffd}");
    }
}
