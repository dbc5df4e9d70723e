//! Shared helpers for unit tests.

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::ble::hardware::{GattService, HardwareEvent, MockBleHardware};
use crate::ble::uuids::{
    LOCK_MANUFACTURER_ID, LOCK_SERVICE_UUID, LOCK_SIGNATURE, UNLOCK_CHARACTERISTIC_UUID,
};
use crate::bridge::Event;
use crate::host::MockHostServices;

pub const LOCK_ADDRESS: &str = "24:0A:C4:12:34:56";

/// Let spawned tasks (event delivery in particular) run to completion.
pub async fn flush() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Everything delivered so far.
pub async fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    flush().await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn lock_advertisement(address: &str) -> HardwareEvent {
    let mut manufacturer_data = HashMap::new();
    manufacturer_data.insert(LOCK_MANUFACTURER_ID, LOCK_SIGNATURE.to_vec());
    HardwareEvent::Advertisement {
        address: address.to_string(),
        manufacturer_data,
        rssi: Some(-60),
    }
}

pub fn foreign_advertisement(address: &str) -> HardwareEvent {
    let mut manufacturer_data = HashMap::new();
    manufacturer_data.insert(0x004C, vec![0x02, 0x15, 0x00]);
    HardwareEvent::Advertisement {
        address: address.to_string(),
        manufacturer_data,
        rssi: Some(-80),
    }
}

pub fn lock_services() -> Vec<GattService> {
    vec![
        GattService {
            uuid: uuid::Uuid::from_u128(0x0000_1801_0000_1000_8000_00805f9b34fb),
            characteristics: vec![uuid::Uuid::from_u128(
                0x0000_2a05_0000_1000_8000_00805f9b34fb,
            )],
        },
        GattService {
            uuid: LOCK_SERVICE_UUID,
            characteristics: vec![UNLOCK_CHARACTERISTIC_UUID],
        },
    ]
}

/// Hardware mock that accepts every request any number of times.
pub fn permissive_hardware() -> MockBleHardware {
    let mut hardware = MockBleHardware::new();
    hardware.expect_start_discovery().returning(|_| Ok(()));
    hardware.expect_stop_discovery().returning(|| Ok(()));
    hardware.expect_connect().returning(|_, _| Ok(()));
    hardware.expect_discover_services().returning(|_| Ok(()));
    hardware.expect_write().returning(|_, _, _| Ok(()));
    hardware.expect_disconnect().returning(|_| Ok(()));
    hardware
}

/// Host with the radio on, permission granted and notifications ignored.
pub fn ready_host() -> MockHostServices {
    let mut host = MockHostServices::new();
    host.expect_is_radio_enabled().return_const(true);
    host.expect_has_scan_permission().return_const(true);
    host.expect_notify().return_const(());
    host
}
