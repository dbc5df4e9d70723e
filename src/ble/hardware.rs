//! Hardware abstraction for the BLE central.
//!
//! Every [`BleHardware`] method only *issues* a request and returns at once.
//! The outcome arrives later as a [`HardwareEvent`], which the owner of the
//! hardware feeds into [`LockManager::handle_hardware_event`].
//!
//! [`LockManager::handle_hardware_event`]: crate::LockManager::handle_hardware_event

use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::ble::filter::DeviceFilter;
use crate::error::Result;

/// Generation tag of one connection attempt.
///
/// Link-scoped callbacks carry the id of the attempt they belong to so that
/// callbacks for a superseded attempt can be told apart and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LinkId(pub u64);

impl LinkId {
    /// The id following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// A GATT service as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// UUIDs of the characteristics in this service.
    pub characteristics: Vec<Uuid>,
}

/// A resolved characteristic, addressed by its service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// UUID of the owning service.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub uuid: Uuid,
}

/// Asynchronous notifications from the BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    /// An advertisement was observed while discovering.
    Advertisement {
        /// Peripheral address or platform identifier.
        address: String,
        /// Manufacturer data keyed by company identifier.
        manufacturer_data: HashMap<u16, Vec<u8>>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// Discovery could not be started or was aborted by the stack.
    DiscoveryFailed {
        /// Description from the stack.
        reason: String,
    },
    /// The link to the peripheral is established.
    LinkUp {
        /// Attempt the callback belongs to.
        link: LinkId,
    },
    /// The link was lost or closed.
    LinkDown {
        /// Attempt the callback belongs to.
        link: LinkId,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Attempt the callback belongs to.
        link: LinkId,
        /// Services exposed by the peripheral.
        services: Vec<GattService>,
    },
    /// Service discovery failed.
    ServiceDiscoveryFailed {
        /// Attempt the callback belongs to.
        link: LinkId,
        /// Description from the stack.
        reason: String,
    },
    /// A characteristic write finished.
    WriteCompleted {
        /// Attempt the callback belongs to.
        link: LinkId,
        /// Whether the peripheral accepted the write.
        success: bool,
    },
}

/// Non-blocking BLE central operations.
#[cfg_attr(test, mockall::automock)]
pub trait BleHardware: Send + Sync {
    /// Start discovering peripherals. Matching is applied again by the caller.
    fn start_discovery(&self, filter: &DeviceFilter) -> Result<()>;

    /// Stop discovering.
    fn stop_discovery(&self) -> Result<()>;

    /// Start connecting to `address`; reports `LinkUp` or `LinkDown`.
    fn connect(&self, link: LinkId, address: &str) -> Result<()>;

    /// Start GATT service discovery; reports `ServicesDiscovered` or
    /// `ServiceDiscoveryFailed`.
    fn discover_services(&self, link: LinkId) -> Result<()>;

    /// Write `payload` to a characteristic; reports `WriteCompleted`.
    fn write(
        &self,
        link: LinkId,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
    ) -> Result<()>;

    /// Close the link or abort a pending connect; reports `LinkDown`.
    fn disconnect(&self, link: LinkId) -> Result<()>;
}
