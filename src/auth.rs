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

//! PIN unlock for normal-mode sessions.
//!
//! The peripheral is the authority: every attempt writes a `verify` action
//! and reads the status back. Locally the machine only caches the
//! rate-limit deadline and lockout so that throttled attempts never reach
//! the device.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    normal, BleMode, ChannelIo, Connection, DeviceStatus, PinManagementAction, StatusUpdate,
};
use crate::error::{ClientError, PinFormatError, Result};

/// Check that `pin` is six ASCII digits. Used before unlock attempts.
pub fn validate_pin_format(pin: &str) -> std::result::Result<(), PinFormatError> {
    if pin.chars().count() != 6 {
        return Err(PinFormatError::Length);
    }
    if !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PinFormatError::NonDigit);
    }
    Ok(())
}

/// Full rules for a PIN being set: six digits, and not trivially guessable.
pub fn validate_new_pin(pin: &str) -> std::result::Result<(), PinFormatError> {
    validate_pin_format(pin)?;
    if pin == "000000" {
        return Err(PinFormatError::AllZero);
    }
    if pin == "123456" || pin == "654321" {
        return Err(PinFormatError::Sequential);
    }
    let first = pin.as_bytes()[0];
    if pin.bytes().all(|b| b == first) {
        return Err(PinFormatError::Repeated);
    }
    Ok(())
}

/// Where the session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No normal-mode connection attached.
    Disconnected,
    /// Connected and locked. `retry_at` is set while attempts are throttled.
    Locked { retry_at: Option<Instant> },
    /// A verify is in flight.
    Unlocking,
    Unlocked,
    /// Too many failures; only a device reset recovers.
    LockedOut,
}

/// Result of an unlock attempt as reported by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Unlocked,
    InvalidPin,
    RateLimited { retry_after: Duration },
    LockedOut,
}

impl AuthOutcome {
    /// Classify a status read after a verify.
    pub fn from_status(status: &DeviceStatus) -> Self {
        if status.authenticated {
            Self::Unlocked
        } else if status.is_locked_out() {
            Self::LockedOut
        } else if status.is_rate_limited() {
            Self::RateLimited {
                retry_after: Duration::from_millis(u64::from(status.retry_delay_ms)),
            }
        } else {
            Self::InvalidPin
        }
    }

    /// User-facing message.
    pub fn message(&self) -> String {
        match self {
            Self::Unlocked => "Unlocked".to_string(),
            Self::InvalidPin => "Incorrect PIN.".to_string(),
            Self::RateLimited { retry_after } => {
                match retry_after.as_millis().div_ceil(1000) {
                    0 => "Too many attempts. You can try again now.".to_string(),
                    secs => format!("Too many attempts. Try again in {}s.", secs),
                }
            }
            Self::LockedOut => {
                "Device is locked out after too many failed attempts. Reset it to continue."
                    .to_string()
            }
        }
    }
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

struct AuthInner {
    state: AuthState,
    connection_id: Option<u64>,
    pin_buffer: String,
    retry_delay_ms: u32,
    locked_out: bool,
    last_outcome: Option<AuthOutcome>,
}

impl AuthInner {
    fn new() -> Self {
        Self {
            state: AuthState::Disconnected,
            connection_id: None,
            pin_buffer: String::new(),
            retry_delay_ms: 0,
            locked_out: false,
            last_outcome: None,
        }
    }

    fn reset(&mut self) {
        self.state = AuthState::Disconnected;
        self.connection_id = None;
        self.pin_buffer.clear();
        self.retry_delay_ms = 0;
        self.locked_out = false;
        self.last_outcome = None;
    }

    /// Fold a status report into the cached state.
    fn absorb(&mut self, status: &DeviceStatus) {
        self.retry_delay_ms = status.retry_delay_ms;
        self.locked_out = status.is_locked_out();

        self.state = match AuthOutcome::from_status(status) {
            AuthOutcome::Unlocked => {
                self.pin_buffer.clear();
                AuthState::Unlocked
            }
            AuthOutcome::LockedOut => AuthState::LockedOut,
            AuthOutcome::RateLimited { retry_after } => AuthState::Locked {
                retry_at: Some(Instant::now() + retry_after),
            },
            AuthOutcome::InvalidPin => match self.state {
                // A throttle deadline outlives reports that stop mentioning it.
                AuthState::Locked { retry_at } => AuthState::Locked { retry_at },
                _ => AuthState::Locked { retry_at: None },
            },
        };
    }
}

struct Shared {
    inner: Mutex<AuthInner>,
    state_tx: watch::Sender<AuthState>,
}

impl Shared {
    fn publish(&self, state: AuthState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Returns an attempt that ends while still `Unlocking` to `Locked`.
struct AttemptGuard {
    shared: Arc<Shared>,
    connection_id: u64,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if inner.connection_id != Some(self.connection_id) || inner.state != AuthState::Unlocking {
            return;
        }
        debug!("Unlock attempt abandoned");
        inner.state = AuthState::Locked { retry_at: None };
        inner.pin_buffer.clear();
        drop(inner);
        self.shared.publish(AuthState::Locked { retry_at: None });
    }
}

/// Authentication state machine for one session owner.
#[derive(Clone)]
pub struct AuthMachine {
    io: ChannelIo,
    shared: Arc<Shared>,
}

impl AuthMachine {
    pub fn new(io: ChannelIo) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Disconnected);
        Self {
            io,
            shared: Arc::new(Shared {
                inner: Mutex::new(AuthInner::new()),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> AuthState {
        self.shared.inner.lock().state
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether an unlock attempt would be sent now.
    pub fn can_attempt(&self) -> bool {
        match self.state() {
            AuthState::Locked { retry_at: None } => true,
            AuthState::Locked {
                retry_at: Some(at),
            } => Instant::now() >= at,
            _ => false,
        }
    }

    pub fn retry_delay_ms(&self) -> u32 {
        self.shared.inner.lock().retry_delay_ms
    }

    pub fn is_locked_out(&self) -> bool {
        self.shared.inner.lock().locked_out
    }

    /// Whether a PIN is held for an attempt in progress or a failed one.
    pub fn has_buffered_pin(&self) -> bool {
        !self.shared.inner.lock().pin_buffer.is_empty()
    }

    /// Outcome of the most recent attempt on this connection.
    pub fn last_outcome(&self) -> Option<AuthOutcome> {
        self.shared.inner.lock().last_outcome
    }

    /// Bind to the active normal-mode connection and query its lock state.
    pub async fn attach(&self) -> Result<AuthState> {
        let connection = self.io.manager().require(BleMode::Normal).await?;
        self.attach_to(&connection).await
    }

    async fn attach_to(&self, connection: &Connection) -> Result<AuthState> {
        {
            let mut inner = self.shared.inner.lock();
            inner.reset();
            inner.connection_id = Some(connection.id());
            inner.state = AuthState::Locked { retry_at: None };
        }
        self.shared.publish(AuthState::Locked { retry_at: None });

        let shared = Arc::downgrade(&self.shared);
        let id = connection.id();
        connection.on_disconnect(move |reason| {
            if let Some(shared) = shared.upgrade() {
                let mut inner = shared.inner.lock();
                if inner.connection_id == Some(id) {
                    debug!("Auth reset after disconnect ({:?})", reason);
                    inner.reset();
                    drop(inner);
                    shared.publish(AuthState::Disconnected);
                }
            }
        });

        let status = self.read_status(connection).await?;
        Ok(self.observe_on(id, &status))
    }

    /// Fold a status observed elsewhere (the poller) into the machine.
    pub fn observe(&self, status: &DeviceStatus) -> AuthState {
        let id = self.shared.inner.lock().connection_id;
        match id {
            Some(id) => self.observe_on(id, status),
            None => AuthState::Disconnected,
        }
    }

    fn observe_on(&self, connection_id: u64, status: &DeviceStatus) -> AuthState {
        let state = {
            let mut inner = self.shared.inner.lock();
            if inner.connection_id != Some(connection_id) || inner.state == AuthState::Unlocking {
                return inner.state;
            }
            inner.absorb(status);
            inner.state
        };
        self.shared.publish(state);
        state
    }

    /// Try to unlock with `pin`.
    ///
    /// A malformed PIN fails locally. While throttled or locked out, the
    /// cached outcome is returned and nothing is sent.
    pub async fn authenticate(&self, pin: &str) -> Result<AuthOutcome> {
        validate_pin_format(pin)?;

        let connection = self.io.manager().require(BleMode::Normal).await?;
        if self.shared.inner.lock().connection_id != Some(connection.id()) {
            self.attach_to(&connection).await?;
        }

        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                AuthState::Unlocked => return Ok(AuthOutcome::Unlocked),
                AuthState::LockedOut => return Ok(AuthOutcome::LockedOut),
                AuthState::Locked {
                    retry_at: Some(at),
                } if Instant::now() < at => {
                    return Ok(AuthOutcome::RateLimited {
                        retry_after: at - Instant::now(),
                    });
                }
                AuthState::Unlocking | AuthState::Disconnected => {
                    return Err(ClientError::TransientLinkBusy);
                }
                AuthState::Locked { .. } => {}
            }
            inner.state = AuthState::Unlocking;
            inner.pin_buffer = pin.to_string();
        }
        self.shared.publish(AuthState::Unlocking);
        let _attempt = AttemptGuard {
            shared: self.shared.clone(),
            connection_id: connection.id(),
        };
        info!("Verifying PIN");

        let result = self.verify(&connection, pin).await;

        let (state, outcome) = {
            let mut inner = self.shared.inner.lock();
            if inner.connection_id != Some(connection.id()) {
                // Torn down mid-attempt; the disconnect reset already ran.
                return Err(ClientError::NotConnected);
            }
            match result {
                Ok(status) => {
                    inner.state = AuthState::Locked { retry_at: None };
                    inner.absorb(&status);
                    let outcome = AuthOutcome::from_status(&status);
                    inner.last_outcome = Some(outcome);
                    (inner.state, Ok(outcome))
                }
                Err(e) => {
                    inner.state = AuthState::Locked { retry_at: None };
                    (inner.state, Err(e))
                }
            }
        };
        self.shared.publish(state);

        match &outcome {
            Ok(AuthOutcome::Unlocked) => info!("Session unlocked"),
            Ok(other) => warn!("Unlock rejected: {}", other),
            Err(e) => warn!("Unlock attempt failed: {}", e),
        }
        outcome
    }

    async fn verify(&self, connection: &Connection, pin: &str) -> Result<DeviceStatus> {
        let action = PinManagementAction::Verify {
            pin: pin.to_string(),
        };
        self.io
            .write_json_on(connection, normal::PIN_MANAGEMENT_UUID, &action)
            .await?;
        self.read_status(connection).await
    }

    async fn read_status(&self, connection: &Connection) -> Result<DeviceStatus> {
        let text = self.io.read_text_on(connection, normal::STATUS_UUID).await?;
        let update = StatusUpdate::from_json(&text)?;
        Ok(DeviceStatus::default().merged(&update))
    }

    /// Relock the session on the peripheral.
    pub async fn logout(&self) -> Result<()> {
        let connection = self.io.manager().require(BleMode::Normal).await?;
        self.io
            .write_json_on(&connection, normal::PIN_MANAGEMENT_UUID, &PinManagementAction::Logout)
            .await?;

        let state = {
            let mut inner = self.shared.inner.lock();
            if inner.connection_id != Some(connection.id()) {
                return Ok(());
            }
            inner.pin_buffer.clear();
            inner.last_outcome = None;
            if inner.state == AuthState::Unlocked {
                inner.state = AuthState::Locked { retry_at: None };
            }
            inner.state
        };
        self.shared.publish(state);
        info!("Session locked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockBackend, MockPeripheral};
    use crate::bluetooth::{ConnectOptions, ConnectionManager};

    const LOCKED: &str = r#"{"connected":true,"typing":false,"queue":0,"authenticated":false,"keyboard_connected":true,"retry_delay_ms":0,"locked_out":false}"#;
    const UNLOCKED: &str = r#"{"connected":true,"typing":false,"queue":0,"authenticated":true,"keyboard_connected":true,"retry_delay_ms":0,"locked_out":false}"#;
    const RATE_LIMITED: &str = r#"{"authenticated":false,"auth_error":"rate_limited","retry_delay_ms":5000,"locked_out":false}"#;
    const LOCKED_OUT: &str = r#"{"authenticated":false,"auth_error":"locked_out","retry_delay_ms":4294967295,"locked_out":true}"#;

    async fn machine(initial: &str) -> (AuthMachine, Arc<MockPeripheral>) {
        let (backend, link) = MockBackend::with_link(BleMode::Normal);
        link.set_value(normal::STATUS_UUID, initial.as_bytes());
        let manager = ConnectionManager::new(backend, ConnectOptions::default());
        manager.connect(BleMode::Normal).await.unwrap();
        (AuthMachine::new(ChannelIo::new(manager)), link)
    }

    fn reply_to_verify(link: &MockPeripheral, correct: &'static str, status: &'static str) {
        link.on_write(move |peripheral, uuid, data| {
            if uuid != normal::PIN_MANAGEMENT_UUID {
                return;
            }
            let text = String::from_utf8_lossy(data);
            if text.contains(correct) {
                peripheral.set_value(normal::STATUS_UUID, UNLOCKED.as_bytes());
            } else {
                peripheral.set_value(normal::STATUS_UUID, status.as_bytes());
            }
        });
    }

    #[test]
    fn test_pin_format() {
        assert!(validate_pin_format("482913").is_ok());
        assert_eq!(validate_pin_format("12345"), Err(PinFormatError::Length));
        assert_eq!(validate_pin_format("12a456"), Err(PinFormatError::NonDigit));
        assert_eq!(validate_pin_format("１２３４５６"), Err(PinFormatError::NonDigit));
        // Unlock accepts what the device might already hold.
        assert!(validate_pin_format("111111").is_ok());
    }

    #[test]
    fn test_new_pin_rules() {
        assert!(validate_new_pin("482913").is_ok());
        assert_eq!(validate_new_pin("000000"), Err(PinFormatError::AllZero));
        assert_eq!(validate_new_pin("123456"), Err(PinFormatError::Sequential));
        assert_eq!(validate_new_pin("654321"), Err(PinFormatError::Sequential));
        assert_eq!(validate_new_pin("777777"), Err(PinFormatError::Repeated));
        assert_eq!(validate_new_pin("1234"), Err(PinFormatError::Length));
    }

    #[test]
    fn test_outcome_messages() {
        let limited = AuthOutcome::RateLimited {
            retry_after: Duration::from_millis(5000),
        };
        assert_eq!(limited.message(), "Too many attempts. Try again in 5s.");
        let partial = AuthOutcome::RateLimited {
            retry_after: Duration::from_millis(1200),
        };
        assert_eq!(partial.message(), "Too many attempts. Try again in 2s.");
        let elapsed = AuthOutcome::RateLimited {
            retry_after: Duration::ZERO,
        };
        assert_eq!(elapsed.message(), "Too many attempts. You can try again now.");
        assert_ne!(AuthOutcome::InvalidPin.message(), AuthOutcome::LockedOut.message());
    }

    #[tokio::test]
    async fn test_malformed_pin_sends_nothing() {
        let (auth, link) = machine(LOCKED).await;
        for pin in ["", "12345", "1234567", "abcdef", "12 456"] {
            assert!(matches!(
                auth.authenticate(pin).await,
                Err(ClientError::Format(_))
            ));
        }
        assert!(!link.had_traffic());
    }

    #[tokio::test]
    async fn test_unlock_with_correct_pin() {
        let (auth, link) = machine(LOCKED).await;
        reply_to_verify(&link, "482913", LOCKED);

        assert_eq!(auth.attach().await.unwrap(), AuthState::Locked { retry_at: None });
        assert_eq!(auth.authenticate("482913").await.unwrap(), AuthOutcome::Unlocked);
        assert_eq!(auth.state(), AuthState::Unlocked);
        assert!(!auth.has_buffered_pin());
    }

    #[tokio::test]
    async fn test_wrong_pin_allows_immediate_retry() {
        let (auth, link) = machine(LOCKED).await;
        reply_to_verify(&link, "482913", r#"{"authenticated":false,"auth_error":"invalid_pin","retry_delay_ms":0}"#);

        assert_eq!(auth.authenticate("111111").await.unwrap(), AuthOutcome::InvalidPin);
        assert!(auth.can_attempt());
        assert_eq!(auth.authenticate("482913").await.unwrap(), AuthOutcome::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_attempt_releases_machine() {
        let (auth, link) = machine(LOCKED).await;
        reply_to_verify(&link, "482913", LOCKED);
        auth.attach().await.unwrap();
        link.set_write_delay(Duration::from_millis(500));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), auth.authenticate("482913")).await;
        assert!(abandoned.is_err());
        assert_eq!(auth.state(), AuthState::Locked { retry_at: None });
        assert!(!auth.has_buffered_pin());
        assert!(auth.can_attempt());

        let unlocked = DeviceStatus {
            authenticated: true,
            ..Default::default()
        };
        assert_eq!(auth.observe(&DeviceStatus::default()), AuthState::Locked { retry_at: None });
        assert_eq!(auth.authenticate("482913").await.unwrap(), AuthOutcome::Unlocked);
        assert_eq!(auth.observe(&unlocked), AuthState::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_blocks_until_delay_elapses() {
        let (auth, link) = machine(LOCKED).await;
        reply_to_verify(&link, "482913", RATE_LIMITED);

        let outcome = auth.authenticate("111111").await.unwrap();
        assert_eq!(outcome.message(), "Too many attempts. Try again in 5s.");
        assert!(!auth.can_attempt());

        link.clear_calls();
        let cached = auth.authenticate("482913").await.unwrap();
        assert!(matches!(cached, AuthOutcome::RateLimited { .. }));
        assert!(!link.had_traffic());

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert!(auth.can_attempt());
        assert_eq!(auth.authenticate("482913").await.unwrap(), AuthOutcome::Unlocked);
    }

    #[tokio::test]
    async fn test_lockout_is_terminal() {
        let (auth, link) = machine(LOCKED).await;
        reply_to_verify(&link, "482913", LOCKED_OUT);

        assert_eq!(auth.authenticate("111111").await.unwrap(), AuthOutcome::LockedOut);
        assert_eq!(auth.state(), AuthState::LockedOut);
        assert!(auth.is_locked_out());

        link.clear_calls();
        assert_eq!(auth.authenticate("482913").await.unwrap(), AuthOutcome::LockedOut);
        assert!(!link.had_traffic());
    }

    #[tokio::test]
    async fn test_attach_detects_existing_lockout() {
        let (auth, _link) = machine(LOCKED_OUT).await;
        assert_eq!(auth.attach().await.unwrap(), AuthState::LockedOut);
    }

    #[tokio::test]
    async fn test_disconnect_resets_from_any_state() {
        let (auth, link) = machine(LOCKED).await;
        reply_to_verify(&link, "482913", RATE_LIMITED);
        auth.authenticate("111111").await.unwrap();
        assert!(auth.retry_delay_ms() > 0);
        assert!(auth.has_buffered_pin());

        auth.io.manager().disconnect().await;

        assert_eq!(auth.state(), AuthState::Disconnected);
        assert!(!auth.has_buffered_pin());
        assert_eq!(auth.retry_delay_ms(), 0);
        assert!(!auth.is_locked_out());
    }

    #[tokio::test]
    async fn test_observe_tracks_remote_changes() {
        let (auth, _link) = machine(UNLOCKED).await;
        assert_eq!(auth.attach().await.unwrap(), AuthState::Unlocked);

        let relocked = DeviceStatus::default();
        assert_eq!(auth.observe(&relocked), AuthState::Locked { retry_at: None });

        let locked_out = DeviceStatus {
            locked_out: true,
            retry_delay_ms: u32::MAX,
            ..Default::default()
        };
        assert_eq!(auth.observe(&locked_out), AuthState::LockedOut);
    }

    #[tokio::test]
    async fn test_logout_relocks() {
        let (auth, link) = machine(UNLOCKED).await;
        auth.attach().await.unwrap();
        auth.logout().await.unwrap();

        assert_eq!(auth.state(), AuthState::Locked { retry_at: None });
        let written = link.writes_to(normal::PIN_MANAGEMENT_UUID);
        assert_eq!(written, vec![br#"{"action":"logout"}"#.to_vec()]);
    }
}
