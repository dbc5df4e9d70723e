// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-door-lock
//!
//! A Rust client for an ESP32 Bluetooth Low Energy door lock.
//!
//! The crate finds the lock by its manufacturer advertisement, connects to
//! it, resolves the unlock characteristic and writes the unlock command.
//! Every command is accepted or rejected immediately; what it eventually
//! does is reported as an [`Event`] on a single listener.
//!
//! ## Lifecycle
//!
//! - **Scan**: discovery runs until the lock is seen or 2 s pass, then
//!   reports exactly one [`Event::ScanResult`].
//! - **Connect**: after the link comes up the client waits 600 ms before
//!   service discovery, then reports [`Event::Connected`].
//! - **Unlock**: writes `0x01` to the unlock characteristic; the lock's
//!   acknowledgement is reported as [`Event::WriteAck`].
//! - **Disconnect**: any link loss is reported as one [`Event::Disconnected`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_door_lock::{Event, LockConfig, LockManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = LockManager::with_btleplug(LockConfig::default()).await?;
//!     let mut events = manager.subscribe();
//!
//!     manager.start_scan()?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::ScanResult(Some(_)) => manager.connect()?,
//!             Event::ScanResult(None) => break,
//!             Event::Connected => manager.write_unlock()?,
//!             Event::WriteAck => manager.disconnect()?,
//!             Event::Disconnected => break,
//!         }
//!     }
//!
//!     manager.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Device addresses are CoreBluetooth
//! identifiers rather than MAC addresses.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for config and event records

// Public modules
pub mod ble;
pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod lock_manager;

#[cfg(test)]
mod test_util;

// Re-exports for convenience
pub use bridge::{Event, EventBridge, EventKind, EventListener, EventRecord};
pub use config::LockConfig;
pub use error::{Error, Result};
pub use host::{HostServices, LoggingHost};
pub use lock_manager::{Command, LockManager};

// Re-export commonly used types from submodules
pub use ble::backend::BtleplugHardware;
pub use ble::connection::ConnectionState;
pub use ble::filter::DeviceFilter;
pub use ble::hardware::{BleHardware, HardwareEvent, LinkId};
pub use ble::scanner::{Device, ScanState};
