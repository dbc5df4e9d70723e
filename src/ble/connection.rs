//! BLE connection management.
//!
//! Drives one lock connection from the connect request through link-up, the
//! settle delay and service discovery to `Ready`, and back to `Disconnected`.
//! All transitions happen under a single lock. Every hardware callback and
//! timer carries the [`LinkId`] of the attempt it belongs to and is dropped
//! if that attempt is no longer current.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::hardware::{BleHardware, CharacteristicHandle, GattService, LinkId};
use crate::ble::scanner::Device;
use crate::bridge::{Event, EventBridge};
use crate::error::{Error, Result};
use crate::host::HostServices;

/// Connection state for the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connect requested, waiting for the link.
    Connecting,
    /// Link established.
    LinkUp,
    /// Waiting out the settle delay before service discovery.
    Settling,
    /// Service discovery in flight.
    DiscoveringServices,
    /// Unlock characteristic resolved; commands accepted.
    Ready,
}

impl ConnectionState {
    /// Check if ready for commands.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if between a connect request and `Ready`.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::LinkUp | Self::Settling | Self::DiscoveringServices
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::LinkUp => write!(f, "LinkUp"),
            Self::Settling => write!(f, "Settling"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// GATT layout the connection resolves after discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockProfile {
    /// Lock service UUID.
    pub service_uuid: Uuid,
    /// Unlock characteristic UUID.
    pub characteristic_uuid: Uuid,
    /// Byte written to unlock.
    pub unlock_payload: u8,
}

impl LockProfile {
    /// Find the unlock characteristic among discovered services.
    pub fn resolve(&self, services: &[GattService]) -> Result<CharacteristicHandle> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.service_uuid)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: self.service_uuid.to_string(),
            })?;

        if !service.characteristics.contains(&self.characteristic_uuid) {
            return Err(Error::CharacteristicNotFound {
                uuid: self.characteristic_uuid.to_string(),
            });
        }

        Ok(CharacteristicHandle {
            service: service.uuid,
            uuid: self.characteristic_uuid,
        })
    }
}

#[derive(Default)]
struct Connection {
    state: ConnectionState,
    link: LinkId,
    device: Option<Device>,
    characteristic: Option<CharacteristicHandle>,
    settle_timer: Option<AbortHandle>,
}

impl Connection {
    fn is_current(&self, link: LinkId) -> bool {
        self.state != ConnectionState::Disconnected && self.link == link
    }

    /// Drop everything but the link counter.
    fn reset(&mut self) {
        if let Some(timer) = self.settle_timer.take() {
            timer.abort();
        }
        self.state = ConnectionState::Disconnected;
        self.device = None;
        self.characteristic = None;
    }
}

/// Manages the connection to the lock.
#[derive(Clone)]
pub struct ConnectionManager {
    profile: LockProfile,
    settle_delay: Duration,
    connection: Arc<Mutex<Connection>>,
    hardware: Arc<dyn BleHardware>,
    host: Arc<dyn HostServices>,
    bridge: EventBridge,
}

impl ConnectionManager {
    /// Create a connection manager.
    pub fn new(
        profile: LockProfile,
        settle_delay: Duration,
        hardware: Arc<dyn BleHardware>,
        host: Arc<dyn HostServices>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            profile,
            settle_delay,
            connection: Arc::new(Mutex::new(Connection::default())),
            hardware,
            host,
            bridge,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.lock().state
    }

    /// Check if ready for commands.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// The id of the live attempt, if any.
    pub fn current_link(&self) -> Option<LinkId> {
        let connection = self.connection.lock();
        (connection.state != ConnectionState::Disconnected).then_some(connection.link)
    }

    /// The device of the live attempt, if any.
    pub fn device(&self) -> Option<Device> {
        self.connection.lock().device.clone()
    }

    /// Start connecting to `device`.
    ///
    /// An existing connection is superseded: its link is closed and a
    /// `Disconnected` event is emitted for it right away.
    pub fn connect(&self, device: Device) -> Result<()> {
        let mut connection = self.connection.lock();

        if connection.state != ConnectionState::Disconnected {
            info!(
                "New connect request supersedes {} ({})",
                connection.link, connection.state
            );
            if let Err(e) = self.hardware.disconnect(connection.link) {
                warn!("Failed to close superseded {}: {}", connection.link, e);
            }
            connection.reset();
            self.bridge.emit(Event::Disconnected);
        }

        let link = connection.link.next();
        self.hardware.connect(link, &device.address)?;

        info!("Connecting to lock at {} ({})", device.address, link);

        connection.link = link;
        connection.state = ConnectionState::Connecting;
        connection.device = Some(device);

        Ok(())
    }

    /// Close the connection.
    ///
    /// The `Disconnected` event follows from the link-down callback. If the
    /// hardware refuses the request the connection is torn down here instead.
    pub fn disconnect(&self) -> Result<()> {
        let mut connection = self.connection.lock();

        if connection.state == ConnectionState::Disconnected {
            return Err(Error::NotConnected);
        }

        info!("Disconnecting from lock ({})", connection.link);

        if let Err(e) = self.hardware.disconnect(connection.link) {
            warn!("Disconnect request failed, tearing down locally: {}", e);
            connection.reset();
            self.bridge.emit(Event::Disconnected);
        }

        Ok(())
    }

    /// Write the unlock byte.
    pub fn write_unlock(&self) -> Result<()> {
        let connection = self.connection.lock();

        let characteristic = match (connection.state, connection.characteristic) {
            (ConnectionState::Ready, Some(characteristic)) => characteristic,
            (state, _) => return Err(Error::NotReady { state }),
        };

        self.hardware.write(
            connection.link,
            &characteristic,
            &[self.profile.unlock_payload],
        )?;

        info!("Unlock command written ({})", connection.link);

        Ok(())
    }

    /// The link came up; arm the settle timer.
    pub fn handle_link_up(&self, link: LinkId) {
        let mut connection = self.connection.lock();

        if !connection.is_current(link) || connection.state != ConnectionState::Connecting {
            trace!("Ignoring link-up for {}", link);
            return;
        }

        Self::set_state(&mut connection, ConnectionState::LinkUp);

        let delay = self.settle_delay;
        let state = self.connection.clone();
        let hardware = self.hardware.clone();
        let host = self.host.clone();
        let bridge = self.bridge.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut connection = state.lock();
            if !connection.is_current(link) || connection.state != ConnectionState::Settling {
                trace!("Stale settle timer for {} ignored", link);
                return;
            }
            connection.settle_timer = None;

            match hardware.discover_services(link) {
                Ok(()) => Self::set_state(&mut connection, ConnectionState::DiscoveringServices),
                Err(e) => Self::fail(&mut connection, hardware.as_ref(), host.as_ref(), &bridge, e),
            }
        });

        connection.settle_timer = Some(handle.abort_handle());
        Self::set_state(&mut connection, ConnectionState::Settling);
        debug!("Waiting {:?} before service discovery", delay);
    }

    /// Service discovery finished; resolve the unlock characteristic.
    pub fn handle_services_discovered(&self, link: LinkId, services: &[GattService]) {
        let mut connection = self.connection.lock();

        if !connection.is_current(link)
            || connection.state != ConnectionState::DiscoveringServices
        {
            trace!("Ignoring service discovery result for {}", link);
            return;
        }

        debug!("Discovered {} services", services.len());

        match self.profile.resolve(services) {
            Ok(characteristic) => {
                connection.characteristic = Some(characteristic);
                Self::set_state(&mut connection, ConnectionState::Ready);
                info!("Lock ready ({})", link);
                self.bridge.emit(Event::Connected);
            }
            Err(e) => Self::fail(
                &mut connection,
                self.hardware.as_ref(),
                self.host.as_ref(),
                &self.bridge,
                e,
            ),
        }
    }

    /// Service discovery failed on the peripheral.
    pub fn handle_service_discovery_failed(&self, link: LinkId, reason: &str) {
        let mut connection = self.connection.lock();

        if !connection.is_current(link)
            || connection.state != ConnectionState::DiscoveringServices
        {
            return;
        }

        Self::fail(
            &mut connection,
            self.hardware.as_ref(),
            self.host.as_ref(),
            &self.bridge,
            Error::ServiceDiscoveryFailed {
                reason: reason.to_string(),
            },
        );
    }

    /// The link is gone.
    pub fn handle_link_down(&self, link: LinkId) {
        let mut connection = self.connection.lock();

        if !connection.is_current(link) {
            trace!("Ignoring link-down for {}", link);
            return;
        }

        info!("Lock disconnected ({}, was {})", link, connection.state);
        connection.reset();
        self.bridge.emit(Event::Disconnected);
    }

    /// The peripheral answered the unlock write.
    pub fn handle_write_completed(&self, link: LinkId, success: bool) {
        let connection = self.connection.lock();

        if !connection.is_current(link) || !connection.state.is_ready() {
            trace!("Ignoring write completion for {}", link);
            return;
        }

        if success {
            debug!("Unlock write acknowledged");
            self.bridge.emit(Event::WriteAck);
        } else {
            warn!("Unlock write rejected by lock");
            self.host.notify("Unlock write failed");
        }
    }

    /// Abandon the current attempt after a resolution failure.
    ///
    /// The state stays where it is until the link-down arrives, so the single
    /// `Disconnected` event still comes from the link-down path.
    fn fail(
        connection: &mut Connection,
        hardware: &dyn BleHardware,
        host: &dyn HostServices,
        bridge: &EventBridge,
        error: Error,
    ) {
        warn!("Connection attempt {} failed: {}", connection.link, error);
        host.notify(&error.to_string());

        if let Err(e) = hardware.disconnect(connection.link) {
            warn!("Disconnect request failed, tearing down locally: {}", e);
            connection.reset();
            bridge.emit(Event::Disconnected);
        }
    }

    fn set_state(connection: &mut Connection, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut connection.state, new_state);
        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
        }
    }
}
