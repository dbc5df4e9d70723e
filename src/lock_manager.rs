//! Lock manager: the command surface of the crate.
//!
//! Commands are accepted or rejected synchronously; their effects arrive
//! later as [`Event`]s on the attached listener. Hardware callbacks enter
//! through [`LockManager::handle_hardware_event`], either called directly by
//! an embedding BLE stack or pumped from a channel by
//! [`LockManager::drive`].

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ble::backend::BtleplugHardware;
use crate::ble::connection::{ConnectionManager, ConnectionState, LockProfile};
use crate::ble::hardware::{BleHardware, HardwareEvent};
use crate::ble::scanner::{Device, ScanManager, ScanState};
use crate::bridge::{Event, EventBridge, EventListener};
use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::host::{HostServices, LoggingHost};

/// Commands the application can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Scan for the lock.
    StartScan,
    /// Connect to the last lock found.
    Connect,
    /// Write the unlock byte.
    WriteUnlock,
    /// Close the connection.
    Disconnect,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartScan => write!(f, "StartScan"),
            Self::Connect => write!(f, "Connect"),
            Self::WriteUnlock => write!(f, "WriteUnlock"),
            Self::Disconnect => write!(f, "Disconnect"),
        }
    }
}

/// Central entry point for finding, connecting to and unlocking the lock.
pub struct LockManager {
    host: Arc<dyn HostServices>,
    bridge: EventBridge,
    scanner: ScanManager,
    connection: ConnectionManager,
    /// Hardware event pump.
    pump_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl LockManager {
    /// Create a manager over the given hardware and host.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: LockConfig,
        hardware: Arc<dyn BleHardware>,
        host: Arc<dyn HostServices>,
    ) -> Self {
        let bridge = EventBridge::new();

        let scanner = ScanManager::new(
            config.filter(),
            config.scan_timeout,
            hardware.clone(),
            bridge.clone(),
        );

        let profile = LockProfile {
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
            unlock_payload: config.unlock_payload,
        };
        let connection = ConnectionManager::new(
            profile,
            config.settle_delay,
            hardware,
            host.clone(),
            bridge.clone(),
        );

        Self {
            host,
            bridge,
            scanner,
            connection,
            pump_handle: RwLock::new(None),
        }
    }

    /// Create a manager on the first system Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_btleplug(config: LockConfig) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let hardware = BtleplugHardware::new(events_tx).await?;
        let host = LoggingHost::new(hardware.radio_enabled());

        let manager = Self::new(config, Arc::new(hardware), Arc::new(host));
        manager.drive(events_rx);

        Ok(manager)
    }

    /// Pump hardware events from `events` until the sender side closes.
    pub fn drive(&self, mut events: mpsc::UnboundedReceiver<HardwareEvent>) {
        let scanner = self.scanner.clone();
        let connection = self.connection.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                Self::dispatch(&scanner, &connection, event);
            }
            debug!("Hardware event pump ended");
        });

        if let Some(previous) = self.pump_handle.write().replace(handle) {
            previous.abort();
        }
    }

    /// Feed one hardware callback into the state machines.
    pub fn handle_hardware_event(&self, event: HardwareEvent) {
        Self::dispatch(&self.scanner, &self.connection, event);
    }

    // === Event listener ===

    /// Register the event listener, replacing any previous one.
    pub fn attach<L: EventListener>(&self, listener: L) {
        self.bridge.attach(listener);
    }

    /// Attach a channel listener and return the receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.bridge.subscribe()
    }

    /// Remove the event listener.
    pub fn detach(&self) {
        self.bridge.detach();
    }

    // === Commands ===

    /// Run a command.
    pub fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::StartScan => self.start_scan(),
            Command::Connect => self.connect(),
            Command::WriteUnlock => self.write_unlock(),
            Command::Disconnect => self.disconnect(),
        }
    }

    /// Start scanning for the lock. Reports `ScanResult`.
    pub fn start_scan(&self) -> Result<()> {
        let result = if !self.host.is_radio_enabled() {
            Err(Error::RadioDisabled)
        } else if !self.host.has_scan_permission() {
            Err(Error::PermissionDenied)
        } else {
            self.scanner.start_scanning()
        };
        self.report(Command::StartScan, result)
    }

    /// Connect to the lock found by the last successful scan. Reports
    /// `Connected` once the lock is ready.
    pub fn connect(&self) -> Result<()> {
        let result = match self.scanner.device() {
            Some(device) => self.connection.connect(device),
            None => Err(Error::NoDeviceResolved),
        };
        self.report(Command::Connect, result)
    }

    /// Unlock. Reports `WriteAck` when the lock confirms.
    pub fn write_unlock(&self) -> Result<()> {
        let result = self.connection.write_unlock();
        self.report(Command::WriteUnlock, result)
    }

    /// Disconnect. Reports `Disconnected`.
    pub fn disconnect(&self) -> Result<()> {
        let result = self.connection.disconnect();
        self.report(Command::Disconnect, result)
    }

    // === State ===

    /// Current scan session state.
    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The lock found by the last successful scan.
    pub fn device(&self) -> Option<Device> {
        self.scanner.device()
    }

    /// Clean shutdown: drop the connection and stop pumping hardware events.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down lock manager");

        if self.connection.state() != ConnectionState::Disconnected {
            if let Err(e) = self.connection.disconnect() {
                warn!("Error disconnecting lock: {}", e);
            }
        }

        self.bridge.detach();

        let pump = self.pump_handle.write().take();
        if let Some(handle) = pump {
            handle.abort();
            let _ = handle.await;
        }

        Ok(())
    }

    /// Surface rejections to the host before returning them.
    fn report(&self, command: Command, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => debug!("{} accepted", command),
            Err(e) => {
                warn!("{} rejected: {}", command, e);
                self.host.notify(&e.to_string());
            }
        }
        result
    }

    fn dispatch(scanner: &ScanManager, connection: &ConnectionManager, event: HardwareEvent) {
        match event {
            HardwareEvent::Advertisement {
                address,
                manufacturer_data,
                rssi,
            } => scanner.handle_advertisement(&address, &manufacturer_data, rssi),
            HardwareEvent::DiscoveryFailed { reason } => scanner.handle_discovery_failure(&reason),
            HardwareEvent::LinkUp { link } => connection.handle_link_up(link),
            HardwareEvent::LinkDown { link } => connection.handle_link_down(link),
            HardwareEvent::ServicesDiscovered { link, services } => {
                connection.handle_services_discovered(link, &services)
            }
            HardwareEvent::ServiceDiscoveryFailed { link, reason } => {
                connection.handle_service_discovery_failed(link, &reason)
            }
            HardwareEvent::WriteCompleted { link, success } => {
                connection.handle_write_completed(link, success)
            }
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::hardware::MockBleHardware;
    use crate::host::MockHostServices;
    use crate::test_util::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn lock_manager(hardware: MockBleHardware, host: MockHostServices) -> LockManager {
        LockManager::new(LockConfig::default(), Arc::new(hardware), Arc::new(host))
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_rejects_scan() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().never();
        let mut host = MockHostServices::new();
        host.expect_is_radio_enabled().return_const(false);
        host.expect_notify()
            .withf(|message| message == "Bluetooth radio is disabled")
            .times(1)
            .return_const(());
        let manager = lock_manager(hardware, host);
        let mut rx = manager.subscribe();

        let err = assert_err!(manager.start_scan());
        assert!(matches!(err, Error::RadioDisabled));
        assert_eq!(manager.scan_state(), ScanState::Idle);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_permission_rejects_scan() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().never();
        let mut host = MockHostServices::new();
        host.expect_is_radio_enabled().return_const(true);
        host.expect_has_scan_permission().return_const(false);
        host.expect_notify().times(1).return_const(());
        let manager = lock_manager(hardware, host);

        let err = assert_err!(manager.execute(Command::StartScan));
        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_in_progress_notifies() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().times(1).returning(|_| Ok(()));
        hardware.expect_stop_discovery().returning(|| Ok(()));
        let mut host = MockHostServices::new();
        host.expect_is_radio_enabled().return_const(true);
        host.expect_has_scan_permission().return_const(true);
        host.expect_notify()
            .withf(|message| message == "Scan already in progress")
            .times(1)
            .return_const(());
        let manager = lock_manager(hardware, host);
        let mut rx = manager.subscribe();

        assert_ok!(manager.start_scan());
        assert_err!(manager.start_scan());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(drain(&mut rx).await, vec![Event::ScanResult(None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_device_rejected() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_connect().never();
        let manager = lock_manager(hardware, ready_host());

        let err = assert_err!(manager.connect());
        assert!(matches!(err, Error::NoDeviceResolved));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_before_ready_makes_no_write() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_write().never();
        let manager = lock_manager(hardware, ready_host());

        let err = assert_err!(manager.execute(Command::WriteUnlock));
        assert!(err.is_precondition());
        assert_err!(manager.execute(Command::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_unlock_session() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().times(1).returning(|_| Ok(()));
        hardware.expect_stop_discovery().times(1).returning(|| Ok(()));
        hardware
            .expect_connect()
            .withf(|_, address| address == LOCK_ADDRESS)
            .times(1)
            .returning(|_, _| Ok(()));
        hardware.expect_discover_services().times(1).returning(|_| Ok(()));
        hardware
            .expect_write()
            .withf(|_, _, payload| payload == [0x01])
            .times(1)
            .returning(|_, _, _| Ok(()));
        hardware.expect_disconnect().times(1).returning(|_| Ok(()));
        let manager = lock_manager(hardware, ready_host());
        let mut rx = manager.subscribe();

        // Scenario A: match 500ms into the scan
        let start = Instant::now();
        assert_ok!(manager.start_scan());
        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.handle_hardware_event(foreign_advertisement("11:22:33:44:55:66"));
        manager.handle_hardware_event(lock_advertisement(LOCK_ADDRESS));
        assert_eq!(
            rx.recv().await,
            Some(Event::ScanResult(Some(LOCK_ADDRESS.to_string())))
        );
        assert!(start.elapsed() < Duration::from_millis(600));

        // Scenario C: connect, settle, discover
        assert_ok!(manager.connect());
        let link = manager.connection.current_link().expect("link");
        let start = Instant::now();
        manager.handle_hardware_event(HardwareEvent::LinkUp { link });
        tokio::time::sleep(Duration::from_millis(650)).await;
        manager.handle_hardware_event(HardwareEvent::ServicesDiscovered {
            link,
            services: lock_services(),
        });
        assert_eq!(rx.recv().await, Some(Event::Connected));
        assert!(start.elapsed() >= Duration::from_millis(650));
        assert_eq!(manager.connection_state(), ConnectionState::Ready);

        assert_ok!(manager.write_unlock());
        manager.handle_hardware_event(HardwareEvent::WriteCompleted {
            link,
            success: true,
        });
        assert_eq!(rx.recv().await, Some(Event::WriteAck));

        assert_ok!(manager.disconnect());
        manager.handle_hardware_event(HardwareEvent::LinkDown { link });
        assert_eq!(rx.recv().await, Some(Event::Disconnected));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_before_settle_reports_disconnected_only() {
        let mut hardware = MockBleHardware::new();
        hardware.expect_start_discovery().returning(|_| Ok(()));
        hardware.expect_stop_discovery().returning(|| Ok(()));
        hardware.expect_connect().returning(|_, _| Ok(()));
        hardware.expect_discover_services().never();
        let manager = lock_manager(hardware, ready_host());
        let mut rx = manager.subscribe();

        assert_ok!(manager.start_scan());
        manager.handle_hardware_event(lock_advertisement(LOCK_ADDRESS));
        assert_ok!(manager.connect());
        let link = manager.connection.current_link().expect("link");

        // Scenario D
        manager.handle_hardware_event(HardwareEvent::LinkUp { link });
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.handle_hardware_event(HardwareEvent::LinkDown { link });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            drain(&mut rx).await,
            vec![
                Event::ScanResult(Some(LOCK_ADDRESS.to_string())),
                Event::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_pumps_channel() {
        let manager = lock_manager(permissive_hardware(), ready_host());
        let mut rx = manager.subscribe();
        let (tx, events) = mpsc::unbounded_channel();
        manager.drive(events);

        assert_ok!(manager.start_scan());
        tx.send(lock_advertisement(LOCK_ADDRESS)).expect("pump alive");

        assert_eq!(
            rx.recv().await,
            Some(Event::ScanResult(Some(LOCK_ADDRESS.to_string())))
        );
        assert_ok!(manager.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_listener_misses_events() {
        let manager = lock_manager(permissive_hardware(), ready_host());
        let mut rx = manager.subscribe();
        manager.detach();

        assert_ok!(manager.start_scan());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.scan_state(), ScanState::Terminated);
        assert!(drain(&mut rx).await.is_empty());
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::StartScan.to_string(), "StartScan");
        assert_eq!(Command::WriteUnlock.to_string(), "WriteUnlock");
    }
}
