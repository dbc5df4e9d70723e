//! Advertisement filtering.
//!
//! Matches manufacturer-specific advertising data against the lock's
//! signature the same way platform scan filters do: the company identifier
//! must be equal and the payload must start with the signature bytes.

use std::collections::HashMap;

use crate::ble::uuids::{LOCK_MANUFACTURER_ID, LOCK_SIGNATURE};

/// Manufacturer-data filter for discovering the lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceFilter {
    company_id: u16,
    signature: Vec<u8>,
}

impl DeviceFilter {
    /// Create a filter for a company identifier and payload prefix.
    pub fn new(company_id: u16, signature: impl Into<Vec<u8>>) -> Self {
        Self {
            company_id,
            signature: signature.into(),
        }
    }

    /// The registered company identifier.
    pub fn company_id(&self) -> u16 {
        self.company_id
    }

    /// The payload prefix.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Check one manufacturer data entry.
    pub fn matches(&self, company_id: u16, data: &[u8]) -> bool {
        company_id == self.company_id && data.starts_with(&self.signature)
    }

    /// Find the matching payload in a full manufacturer data map.
    ///
    /// Returns the raw bytes advertised under the filter's company id.
    pub fn find_match<'a>(&self, manufacturer_data: &'a HashMap<u16, Vec<u8>>) -> Option<&'a [u8]> {
        manufacturer_data
            .get(&self.company_id)
            .filter(|data| self.matches(self.company_id, data))
            .map(Vec::as_slice)
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::new(LOCK_MANUFACTURER_ID, LOCK_SIGNATURE)
    }
}
