//! BLE identifiers of the door lock.
//!
//! These must match the lock firmware exactly.

use uuid::Uuid;

/// Bluetooth SIG company identifier carried in the lock's advertisement.
pub const LOCK_MANUFACTURER_ID: u16 = 0x116B;

/// Manufacturer data the lock advertises under [`LOCK_MANUFACTURER_ID`].
pub const LOCK_SIGNATURE: [u8; 6] = [0xD4, 0xFF, 0x69, 0x38, 0x64, 0xE4];

/// Door lock GATT service UUID.
pub const LOCK_SERVICE_UUID: Uuid = Uuid::from_u128(0x00f0_2981_52a6_8eec_7b56_ef7bfab3f5c1);

/// Unlock characteristic UUID (Write).
pub const UNLOCK_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x01f0_2981_52a6_8eec_7b56_ef7bfab3f5c1);

/// Value written to the unlock characteristic, as a single `u8`.
pub const UNLOCK_PAYLOAD: u8 = 0x01;
