//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy side of the lock client:
//! advertisement filtering, the scan session, the connection state machine
//! and the btleplug backend that drives them.

pub mod backend;
pub mod connection;
pub mod filter;
pub mod hardware;
mod links;
pub mod scanner;
pub mod uuids;

pub use backend::BtleplugHardware;
pub use connection::{ConnectionManager, ConnectionState, LockProfile};
pub use filter::DeviceFilter;
pub use hardware::{BleHardware, CharacteristicHandle, GattService, HardwareEvent, LinkId};
pub use scanner::{Device, ScanManager, ScanState};
pub use uuids::*;
