//! Error types for the ble-door-lock crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this system.
    #[error("Bluetooth not available")]
    BluetoothUnavailable,

    /// The Bluetooth radio is switched off.
    #[error("Bluetooth radio is disabled")]
    RadioDisabled,

    /// The host has not granted the permission required for scanning.
    #[error("Scan permission not granted")]
    PermissionDenied,

    /// A scan session is already running.
    #[error("Scan already in progress")]
    ScanInProgress,

    /// Connect was requested before a scan resolved a lock.
    #[error("No lock has been found yet, scan first")]
    NoDeviceResolved,

    /// The hardware layer does not know the given address.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was looked up.
        address: String,
    },

    /// The command needs a ready connection.
    #[error("Lock not ready (connection is {state})")]
    NotReady {
        /// The connection state at the time of the command.
        state: ConnectionState,
    },

    /// There is no connection to act on.
    #[error("Not connected")]
    NotConnected,

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The peripheral failed GATT service discovery.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed {
        /// Reason reported by the hardware layer.
        reason: String,
    },
}

impl Error {
    /// Whether the caller can retry after fixing a precondition.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::RadioDisabled
                | Self::PermissionDenied
                | Self::ScanInProgress
                | Self::NoDeviceResolved
                | Self::NotReady { .. }
                | Self::NotConnected
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
