//! BLE scanning functionality.
//!
//! A scan session ends exactly once: on the first matching advertisement, on
//! timeout, or when the stack reports a discovery failure. Whichever happens
//! first wins under the session lock; the others become no-ops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::ble::filter::DeviceFilter;
use crate::ble::hardware::BleHardware;
use crate::bridge::{Event, EventBridge};
use crate::error::{Error, Result};

/// A lock found by scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Peripheral address or platform identifier.
    pub address: String,
    /// Manufacturer data advertised under the lock's company id.
    pub manufacturer_data: Vec<u8>,
    /// Signal strength in dBm at discovery.
    pub rssi: Option<i16>,
}

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanState {
    /// No scan has run yet.
    #[default]
    Idle,
    /// Discovery is running.
    Scanning,
    /// The last session has ended.
    Terminated,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

#[derive(Default)]
struct ScanSession {
    state: ScanState,
    generation: u64,
    timeout: Option<AbortHandle>,
    device: Option<Device>,
}

/// Owns the scan session and the last device it resolved.
#[derive(Clone)]
pub struct ScanManager {
    filter: DeviceFilter,
    timeout: Duration,
    session: Arc<Mutex<ScanSession>>,
    hardware: Arc<dyn BleHardware>,
    bridge: EventBridge,
}

impl ScanManager {
    /// Create a scan manager.
    pub fn new(
        filter: DeviceFilter,
        timeout: Duration,
        hardware: Arc<dyn BleHardware>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            filter,
            timeout,
            session: Arc::new(Mutex::new(ScanSession::default())),
            hardware,
            bridge,
        }
    }

    /// Start a scan session and arm its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanInProgress`] if a session is running, or the
    /// hardware error if discovery could not be requested. Neither changes
    /// any state.
    pub fn start_scanning(&self) -> Result<()> {
        let mut session = self.session.lock();

        if session.state == ScanState::Scanning {
            debug!("Already scanning, ignoring start request");
            return Err(Error::ScanInProgress);
        }

        self.hardware.start_discovery(&self.filter)?;

        session.generation += 1;
        session.state = ScanState::Scanning;

        let generation = session.generation;
        let timeout = self.timeout;
        let state = self.session.clone();
        let hardware = self.hardware.clone();
        let bridge = self.bridge.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut session = state.lock();
            if session.state == ScanState::Scanning && session.generation == generation {
                info!("Scan timed out after {:?}", timeout);
                Self::terminate(&mut session, hardware.as_ref(), &bridge, None);
            } else {
                trace!("Stale scan timer for session {} ignored", generation);
            }
        });
        session.timeout = Some(handle.abort_handle());

        info!(
            "Scanning for lock (company {:#06x}, timeout {:?})",
            self.filter.company_id(),
            self.timeout
        );

        Ok(())
    }

    /// Feed an advertisement observed by the hardware.
    pub fn handle_advertisement(
        &self,
        address: &str,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
        rssi: Option<i16>,
    ) {
        let Some(data) = self.filter.find_match(manufacturer_data) else {
            trace!("Ignoring advertisement from {}", address);
            return;
        };

        let mut session = self.session.lock();
        if session.state != ScanState::Scanning {
            trace!("Late advertisement from {} ignored", address);
            return;
        }

        info!("Found lock at {} (rssi {:?})", address, rssi);

        let device = Device {
            address: address.to_string(),
            manufacturer_data: data.to_vec(),
            rssi,
        };
        Self::terminate(&mut session, self.hardware.as_ref(), &self.bridge, Some(device));
    }

    /// The stack gave up on discovery; end the session without a match.
    pub fn handle_discovery_failure(&self, reason: &str) {
        let mut session = self.session.lock();
        if session.state != ScanState::Scanning {
            return;
        }

        warn!("Discovery failed: {}", reason);
        Self::terminate(&mut session, self.hardware.as_ref(), &self.bridge, None);
    }

    /// Current session state.
    pub fn state(&self) -> ScanState {
        self.session.lock().state
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Scanning
    }

    /// The most recently resolved lock.
    pub fn device(&self) -> Option<Device> {
        self.session.lock().device.clone()
    }

    /// End the running session and report its single result.
    fn terminate(
        session: &mut ScanSession,
        hardware: &dyn BleHardware,
        bridge: &EventBridge,
        device: Option<Device>,
    ) {
        session.state = ScanState::Terminated;

        if let Some(timer) = session.timeout.take() {
            timer.abort();
        }

        if let Err(e) = hardware.stop_discovery() {
            warn!("Failed to stop discovery: {}", e);
        }

        let address = device.as_ref().map(|d| d.address.clone());
        if let Some(device) = device {
            session.device = Some(device);
        }

        bridge.emit(Event::ScanResult(address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::hardware::MockBleHardware;
    use crate::test_util::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn scanner(hardware: MockBleHardware) -> (ScanManager, UnboundedReceiver<Event>) {
        let bridge = EventBridge::new();
        let rx = bridge.subscribe();
        let manager = ScanManager::new(
            DeviceFilter::default(),
            Duration::from_millis(2000),
            Arc::new(hardware),
            bridge,
        );
        (manager, rx)
    }

    fn feed(manager: &ScanManager, event: crate::ble::hardware::HardwareEvent) {
        if let crate::ble::hardware::HardwareEvent::Advertisement {
            address,
            manufacturer_data,
            rssi,
        } = event
        {
            manager.handle_advertisement(&address, &manufacturer_data, rssi);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_reports_address_before_timeout() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().times(1).returning(|_| Ok(()));
        hardware.expect_stop_discovery().times(1).returning(|| Ok(()));
        let (manager, mut rx) = scanner(hardware);

        let start = Instant::now();
        assert_ok!(manager.start_scanning());
        assert!(manager.is_scanning());

        tokio::time::sleep(Duration::from_millis(500)).await;
        feed(&manager, lock_advertisement(LOCK_ADDRESS));

        assert_eq!(
            rx.recv().await,
            Some(Event::ScanResult(Some(LOCK_ADDRESS.to_string())))
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(600));
        assert_eq!(manager.state(), ScanState::Terminated);
        assert_eq!(manager.device().map(|d| d.address), Some(LOCK_ADDRESS.to_string()));

        // the timeout must not produce a second result
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_none() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().times(1).returning(|_| Ok(()));
        hardware.expect_stop_discovery().times(1).returning(|| Ok(()));
        let (manager, mut rx) = scanner(hardware);

        let start = Instant::now();
        assert_ok!(manager.start_scanning());
        feed(&manager, foreign_advertisement("11:22:33:44:55:66"));

        assert_eq!(rx.recv().await, Some(Event::ScanResult(None)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2000) && elapsed < Duration::from_millis(2100));
        assert!(manager.device().is_none());

        // a late match after timeout is ignored
        feed(&manager, lock_advertisement(LOCK_ADDRESS));
        assert!(drain(&mut rx).await.is_empty());
        assert!(manager.device().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_scanning_rejected() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().times(1).returning(|_| Ok(()));
        hardware.expect_stop_discovery().times(1).returning(|| Ok(()));
        let (manager, mut rx) = scanner(hardware);

        assert_ok!(manager.start_scanning());
        let err = assert_err!(manager.start_scanning());
        assert!(matches!(err, Error::ScanInProgress));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(drain(&mut rx).await, vec![Event::ScanResult(None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_refusal_leaves_idle() {
        let mut hardware = MockBleHardware::new();
        hardware
            .expect_start_discovery()
            .times(1)
            .returning(|_| Err(Error::BluetoothUnavailable));
        hardware.expect_stop_discovery().never();
        let (manager, mut rx) = scanner(hardware);

        assert_err!(manager.start_scanning());
        assert_eq!(manager.state(), ScanState::Idle);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_reports_none_once() {
        let (manager, mut rx) = scanner(permissive_hardware());

        assert_ok!(manager.start_scanning());
        manager.handle_discovery_failure("scan failed: 2");
        manager.handle_discovery_failure("scan failed: 2");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(drain(&mut rx).await, vec![Event::ScanResult(None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_supersedes_device() {
        let (manager, mut rx) = scanner(permissive_hardware());

        assert_ok!(manager.start_scanning());
        feed(&manager, lock_advertisement("AA:AA:AA:AA:AA:AA"));
        assert_ok!(manager.start_scanning());
        feed(&manager, lock_advertisement("BB:BB:BB:BB:BB:BB"));
        // duplicate advertisement in the same session
        feed(&manager, lock_advertisement("CC:CC:CC:CC:CC:CC"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            drain(&mut rx).await,
            vec![
                Event::ScanResult(Some("AA:AA:AA:AA:AA:AA".to_string())),
                Event::ScanResult(Some("BB:BB:BB:BB:BB:BB".to_string())),
            ]
        );
        assert_eq!(
            manager.device().map(|d| d.address),
            Some("BB:BB:BB:BB:BB:BB".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_end_next_session() {
        let (manager, mut rx) = scanner(permissive_hardware());

        assert_ok!(manager.start_scanning());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        feed(&manager, lock_advertisement(LOCK_ADDRESS));

        // second session starts at 1500ms; the first timer would fire at 2000ms
        assert_ok!(manager.start_scanning());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(manager.is_scanning());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            drain(&mut rx).await,
            vec![
                Event::ScanResult(Some(LOCK_ADDRESS.to_string())),
                Event::ScanResult(None),
            ]
        );
    }
}
