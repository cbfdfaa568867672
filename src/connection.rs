//! Connection registry with duplicate-device detection.
//!
//! The same physical unit can show up twice, typically once over USB and once
//! over WiFi. The registry allows at most one connected handle per non-empty
//! serial number:
//!
//! 1. A handle whose serial is already registered is not connected again. Its
//!    status becomes [`ConnectionStatus::AlreadyConnected`] and the duplicate
//!    handler (if any) decides whether to keep the existing connection or switch
//!    to the new one. Without a handler the existing connection is kept.
//! 2. Any other handle is connected; on success it is registered and added to
//!    the connected set.
//! 3. Handles with an empty serial number are never deduplicated.
//! 4. A handle connected before its serial was known is checked again by
//!    [`ConnectionRegistry::identify`] once the status handshake reports it.
//!
//! The registry lock is held from the duplicate check through the physical
//! connect to the registration, so two concurrent connects for one serial
//! cannot both see it as absent.
//!
//! The registry is an explicitly constructed object, shared by `Arc` from
//! whoever owns the application's devices.

use crate::device::DeviceIdentity;
use crate::error::AppResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Something the registry can physically connect.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Identity used for duplicate detection.
    fn identity(&self) -> DeviceIdentity;

    /// Replace the identity with the one the device reported.
    fn set_identity(&self, identity: DeviceIdentity);

    /// Open the physical connection.
    async fn connect(&self) -> AppResult<()>;

    /// Close the physical connection.
    async fn disconnect(&self) -> AppResult<()>;
}

/// Connection state of a serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// Not connected
    Disconnected,
    /// Connected through the registry
    Connected,
    /// A second handle for an already connected serial was offered
    AlreadyConnected,
    /// The last connect attempt failed
    Failed,
}

/// Answer of a duplicate handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Keep the existing connection and ignore the new handle
    KeepExisting,
    /// Disconnect the existing handle and connect the new one
    SwitchToNew,
}

/// Called with `(existing, new)` when a duplicate serial is offered.
pub type DuplicateHandler =
    Arc<dyn Fn(&DeviceIdentity, &DeviceIdentity) -> DuplicateDecision + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    by_serial: HashMap<String, Arc<dyn Connectable>>,
    connected: Vec<Arc<dyn Connectable>>,
    status: HashMap<String, ConnectionStatus>,
}

impl RegistryState {
    fn remove_handle(&mut self, handle: &Arc<dyn Connectable>) {
        self.connected.retain(|d| !Arc::ptr_eq(d, handle));
    }
}

/// Registry of connected devices.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    duplicate_handler: RwLock<Option<DuplicateHandler>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the duplicate handler, replacing any previous one.
    pub fn set_duplicate_handler(&self, handler: DuplicateHandler) {
        *self.duplicate_handler.write() = Some(handler);
    }

    /// Remove the duplicate handler; duplicates then keep the existing connection.
    pub fn clear_duplicate_handler(&self) {
        *self.duplicate_handler.write() = None;
    }

    fn decide(&self, existing: &DeviceIdentity, new: &DeviceIdentity) -> DuplicateDecision {
        self.duplicate_handler
            .read()
            .as_ref()
            .map(|handler| handler(existing, new))
            .unwrap_or(DuplicateDecision::KeepExisting)
    }

    /// Connect `device` unless its serial number is already connected.
    pub async fn connect(&self, device: Arc<dyn Connectable>) -> AppResult<ConnectionStatus> {
        let identity = device.identity();
        let mut state = self.state.lock().await;

        if let Some(key) = identity.dedup_key() {
            if let Some(existing) = state.by_serial.get(key).cloned() {
                state
                    .status
                    .insert(key.to_string(), ConnectionStatus::AlreadyConnected);
                let existing_identity = existing.identity();
                match self.decide(&existing_identity, &identity) {
                    DuplicateDecision::KeepExisting => {
                        info!(
                            serial = key,
                            existing = %existing_identity.connection,
                            offered = %identity.connection,
                            "Device already connected, keeping existing connection"
                        );
                        return Ok(ConnectionStatus::AlreadyConnected);
                    }
                    DuplicateDecision::SwitchToNew => {
                        info!(
                            serial = key,
                            from = %existing_identity.connection,
                            to = %identity.connection,
                            "Switching device to new connection"
                        );
                        if let Err(e) = existing.disconnect().await {
                            warn!(serial = key, error = %e, "Failed to disconnect existing connection");
                        }
                        state.by_serial.remove(key);
                        state.remove_handle(&existing);
                    }
                }
            }
        }

        if let Err(e) = device.connect().await {
            if let Some(key) = identity.dedup_key() {
                state.status.insert(key.to_string(), ConnectionStatus::Failed);
            }
            warn!(device = %identity, error = %e, "Connect failed");
            return Err(e);
        }

        if let Some(key) = identity.dedup_key() {
            state.by_serial.insert(key.to_string(), device.clone());
            state
                .status
                .insert(key.to_string(), ConnectionStatus::Connected);
        }
        state.connected.push(device);
        info!(device = %identity, "Device connected");
        Ok(ConnectionStatus::Connected)
    }

    /// Record the identity `device` reported after connecting.
    ///
    /// Runs the duplicate check of [`ConnectionRegistry::connect`] against the
    /// reported serial number. When the existing connection is kept, `device`
    /// is disconnected and removed from the registry.
    pub async fn identify(
        &self,
        device: &Arc<dyn Connectable>,
        identity: DeviceIdentity,
    ) -> AppResult<ConnectionStatus> {
        let mut state = self.state.lock().await;
        if !state.connected.iter().any(|d| Arc::ptr_eq(d, device)) {
            return Ok(ConnectionStatus::Disconnected);
        }
        device.set_identity(identity.clone());

        let key = identity.dedup_key().map(str::to_string);
        state
            .by_serial
            .retain(|serial, d| Some(serial) == key.as_ref() || !Arc::ptr_eq(d, device));
        let Some(key) = key else {
            return Ok(ConnectionStatus::Connected);
        };

        if let Some(existing) = state.by_serial.get(&key).cloned() {
            if Arc::ptr_eq(&existing, device) {
                return Ok(ConnectionStatus::Connected);
            }
            state
                .status
                .insert(key.clone(), ConnectionStatus::AlreadyConnected);
            let existing_identity = existing.identity();
            match self.decide(&existing_identity, &identity) {
                DuplicateDecision::KeepExisting => {
                    info!(
                        serial = %key,
                        existing = %existing_identity.connection,
                        offered = %identity.connection,
                        "Identified device is already connected, dropping new connection"
                    );
                    state.remove_handle(device);
                    if let Err(e) = device.disconnect().await {
                        warn!(serial = %key, error = %e, "Failed to disconnect duplicate connection");
                    }
                    return Ok(ConnectionStatus::AlreadyConnected);
                }
                DuplicateDecision::SwitchToNew => {
                    info!(
                        serial = %key,
                        from = %existing_identity.connection,
                        to = %identity.connection,
                        "Switching identified device to new connection"
                    );
                    if let Err(e) = existing.disconnect().await {
                        warn!(serial = %key, error = %e, "Failed to disconnect existing connection");
                    }
                    state.remove_handle(&existing);
                }
            }
        }

        state.by_serial.insert(key.clone(), device.clone());
        state.status.insert(key, ConnectionStatus::Connected);
        info!(device = %identity, "Device identified");
        Ok(ConnectionStatus::Connected)
    }

    /// Disconnect the device registered under `serial`. Returns whether one was.
    pub async fn disconnect(&self, serial: &str) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let Some(device) = state.by_serial.remove(serial) else {
            return Ok(false);
        };
        state.remove_handle(&device);
        state
            .status
            .insert(serial.to_string(), ConnectionStatus::Disconnected);
        device.disconnect().await?;
        info!(serial, "Device disconnected");
        Ok(true)
    }

    /// Disconnect one handle (also works for devices without a serial number).
    pub async fn disconnect_handle(&self, device: &Arc<dyn Connectable>) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        if !state.connected.iter().any(|d| Arc::ptr_eq(d, device)) {
            return Ok(false);
        }
        state.remove_handle(device);
        let identity = device.identity();
        if let Some(key) = identity.dedup_key() {
            state.by_serial.remove(key);
            state
                .status
                .insert(key.to_string(), ConnectionStatus::Disconnected);
        }
        device.disconnect().await?;
        Ok(true)
    }

    /// Disconnect everything, logging individual failures.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        for device in state.connected.drain(..) {
            if let Err(e) = device.disconnect().await {
                warn!(device = %device.identity(), error = %e, "Disconnect failed");
            }
        }
        state.by_serial.clear();
        for status in state.status.values_mut() {
            *status = ConnectionStatus::Disconnected;
        }
    }

    /// Identities of every connected device.
    pub async fn connected_devices(&self) -> Vec<DeviceIdentity> {
        self.state
            .lock()
            .await
            .connected
            .iter()
            .map(|d| d.identity())
            .collect()
    }

    /// Connected handle for `serial`.
    pub async fn get(&self, serial: &str) -> Option<Arc<dyn Connectable>> {
        self.state.lock().await.by_serial.get(serial).cloned()
    }

    /// Last known status of `serial`.
    pub async fn status_of(&self, serial: &str) -> ConnectionStatus {
        self.state
            .lock()
            .await
            .status
            .get(serial)
            .copied()
            .unwrap_or(ConnectionStatus::Disconnected)
    }
}
