//! Lock configuration.
//!
//! Defaults are the values the lock firmware expects; overriding them is
//! mostly useful for tests and lab hardware.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::filter::DeviceFilter;
use crate::ble::uuids::*;

/// Default scan timeout.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default delay between link-up and service discovery.
///
/// The lock's GATT server does not answer discovery reliably right after the
/// link comes up.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(600);

/// Configuration for a [`LockManager`](crate::LockManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LockConfig {
    /// Company identifier in the advertisement.
    pub company_id: u16,
    /// Manufacturer data prefix identifying the lock.
    pub signature: Vec<u8>,
    /// How long a scan session may run.
    pub scan_timeout: Duration,
    /// Pause after link-up before service discovery.
    pub settle_delay: Duration,
    /// Lock service UUID.
    pub service_uuid: Uuid,
    /// Unlock characteristic UUID.
    pub characteristic_uuid: Uuid,
    /// Byte written to unlock.
    pub unlock_payload: u8,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            company_id: LOCK_MANUFACTURER_ID,
            signature: LOCK_SIGNATURE.to_vec(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            service_uuid: LOCK_SERVICE_UUID,
            characteristic_uuid: UNLOCK_CHARACTERISTIC_UUID,
            unlock_payload: UNLOCK_PAYLOAD,
        }
    }
}

impl LockConfig {
    /// The advertisement filter described by this config.
    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter::new(self.company_id, self.signature.clone())
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the post-connect settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the advertisement filter.
    pub fn with_filter(mut self, company_id: u16, signature: impl Into<Vec<u8>>) -> Self {
        self.company_id = company_id;
        self.signature = signature.into();
        self
    }

    /// Set the service and characteristic to unlock through.
    pub fn with_characteristic(mut self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self.characteristic_uuid = characteristic_uuid;
        self
    }
}
