//! btleplug implementation of [`BleHardware`].
//!
//! Requests are queued and executed one at a time by a single worker task, so
//! a disconnect always finishes before the connect issued after it starts,
//! and a stop-scan never overtakes the start-scan behind it. Outcomes and
//! adapter events are forwarded as [`HardwareEvent`]s over an unbounded
//! channel.

use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::filter::DeviceFilter;
use crate::ble::hardware::{BleHardware, CharacteristicHandle, GattService, HardwareEvent, LinkId};
use crate::ble::links::LinkTable;
use crate::error::{Error, Result};

type EventSender = mpsc::UnboundedSender<HardwareEvent>;

/// A queued adapter request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    StartDiscovery,
    StopDiscovery,
    Connect {
        link: LinkId,
        address: String,
    },
    DiscoverServices {
        link: LinkId,
    },
    Write {
        link: LinkId,
        characteristic: CharacteristicHandle,
        payload: Vec<u8>,
    },
    Disconnect {
        link: LinkId,
    },
}

/// Run `execute` on each request in arrival order, one at a time.
async fn serve<F, Fut>(mut requests: mpsc::UnboundedReceiver<Request>, mut execute: F)
where
    F: FnMut(Request) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(request) = requests.recv().await {
        trace!("Executing {:?}", request);
        execute(request).await;
    }
    debug!("Request worker ended");
}

/// Whether an advertisement belongs to the lock the current scan looks for.
fn wanted(filter: Option<&DeviceFilter>, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
    filter.is_some_and(|f| f.find_match(manufacturer_data).is_some())
}

/// State shared by the request worker and the adapter event listener.
#[derive(Clone)]
struct Shared {
    adapter: Adapter,
    events_tx: EventSender,
    /// Filter of the current scan.
    filter: Arc<RwLock<Option<DeviceFilter>>>,
    /// Matching peripherals seen while scanning, by address.
    discovered: Arc<RwLock<HashMap<String, PeripheralId>>>,
    links: Arc<Mutex<LinkTable<PeripheralId>>>,
    radio_enabled: Arc<AtomicBool>,
}

/// BLE central backed by the first system adapter.
pub struct BtleplugHardware {
    shared: Shared,
    requests: mpsc::UnboundedSender<Request>,
    /// Handle to the adapter event task.
    listener_handle: JoinHandle<()>,
    /// Handle to the request worker.
    worker_handle: JoinHandle<()>,
}

impl BtleplugHardware {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(events_tx: mpsc::UnboundedSender<HardwareEvent>) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter, events_tx).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(
        adapter: Adapter,
        events_tx: mpsc::UnboundedSender<HardwareEvent>,
    ) -> Result<Self> {
        // Some stacks cannot report power state; assume on unless told off.
        let powered_off = matches!(adapter.adapter_state().await, Ok(CentralState::PoweredOff));

        let shared = Shared {
            adapter,
            events_tx,
            filter: Arc::new(RwLock::new(None)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(Mutex::new(LinkTable::new())),
            radio_enabled: Arc::new(AtomicBool::new(!powered_off)),
        };

        let mut adapter_events = shared.adapter.events().await.map_err(Error::Bluetooth)?;
        let listener = shared.clone();
        let listener_handle = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                listener.handle_event(event).await;
            }
            debug!("Adapter event loop ended");
        });

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let worker = shared.clone();
        let worker_handle = tokio::spawn(serve(requests_rx, move |request| {
            worker.clone().execute(request)
        }));

        Ok(Self {
            shared,
            requests,
            listener_handle,
            worker_handle,
        })
    }

    /// Shared flag tracking whether the radio is powered on.
    pub fn radio_enabled(&self) -> Arc<AtomicBool> {
        self.shared.radio_enabled.clone()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.shared.adapter
    }

    fn enqueue(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::BluetoothUnavailable)
    }
}

impl Shared {
    /// Handle a BLE central event.
    async fn handle_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                self.process_peripheral(&id, None).await;
            }
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                self.process_peripheral(&id, Some(manufacturer_data)).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                self.handle_device_lost(&id).await;
            }
            CentralEvent::StateUpdate(state) => {
                info!("Adapter state: {:?}", state);
                let powered_on = matches!(state, CentralState::PoweredOn);
                self.radio_enabled.store(powered_on, Ordering::SeqCst);
            }
            CentralEvent::ServiceDataAdvertisement { .. } => {}
            CentralEvent::ServicesAdvertisement { .. } => {}
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    /// Record a matching peripheral and forward its advertisement.
    async fn process_peripheral(
        &self,
        id: &PeripheralId,
        manufacturer_data: Option<HashMap<u16, Vec<u8>>>,
    ) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = peripheral.properties().await.ok().flatten();
        let rssi = properties.as_ref().and_then(|p| p.rssi);
        let manufacturer_data = match manufacturer_data {
            Some(data) => data,
            None => match properties {
                Some(p) => p.manufacturer_data,
                None => return,
            },
        };

        if !wanted(self.filter.read().as_ref(), &manufacturer_data) {
            return;
        }

        let address = id.to_string();
        self.discovered.write().insert(address.clone(), id.clone());

        let _ = self.events_tx.send(HardwareEvent::Advertisement {
            address,
            manufacturer_data,
            rssi,
        });
    }

    /// The stack reports `id` disconnected; drop the live links it backed.
    ///
    /// The report may belong to a link that was already closed on purpose
    /// while a newer link to the same peripheral is up, so the peripheral is
    /// asked for its current state first.
    async fn handle_device_lost(&self, id: &PeripheralId) {
        let candidates = self.links.lock().live_on(id);
        if candidates.is_empty() {
            trace!("No live link on {:?}", id);
            return;
        }

        let still_connected = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        };
        if still_connected {
            debug!("Stale disconnect for {:?} ignored", id);
            return;
        }

        for link in candidates {
            if self.links.lock().close(link).is_some() {
                info!("Link lost ({})", link);
                let _ = self.events_tx.send(HardwareEvent::LinkDown { link });
            }
        }
    }

    async fn link_peripheral(&self, link: LinkId) -> Option<Peripheral> {
        let id = self.links.lock().peripheral(link).cloned()?;
        self.adapter.peripheral(&id).await.ok()
    }

    /// Execute one request to completion.
    async fn execute(self, request: Request) {
        match request {
            Request::StartDiscovery => {
                if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
                    error!("Failed to start scan: {}", e);
                    let _ = self.events_tx.send(HardwareEvent::DiscoveryFailed {
                        reason: e.to_string(),
                    });
                }
            }
            Request::StopDiscovery => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            Request::Connect { link, address } => self.connect(link, &address).await,
            Request::DiscoverServices { link } => self.discover_services(link).await,
            Request::Write {
                link,
                characteristic,
                payload,
            } => self.write(link, &characteristic, &payload).await,
            Request::Disconnect { link } => self.disconnect(link).await,
        }
    }

    async fn connect(&self, link: LinkId, address: &str) {
        let known = self.discovered.read().get(address).cloned();
        let Some(id) = known else {
            warn!("Peripheral {} is no longer known ({})", address, link);
            let _ = self.events_tx.send(HardwareEvent::LinkDown { link });
            return;
        };

        self.links.lock().begin(link, id.clone());

        let result = match self.adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral.connect().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if self.links.lock().establish(link) {
                    debug!("Link up ({})", link);
                    let _ = self.events_tx.send(HardwareEvent::LinkUp { link });
                } else {
                    debug!("{} closed while connecting", link);
                }
            }
            Err(e) => {
                warn!("Connection attempt {} failed: {}", link, e);
                self.links.lock().close(link);
                let _ = self.events_tx.send(HardwareEvent::LinkDown { link });
            }
        }
    }

    async fn discover_services(&self, link: LinkId) {
        let Some(peripheral) = self.link_peripheral(link).await else {
            let _ = self.events_tx.send(HardwareEvent::ServiceDiscoveryFailed {
                link,
                reason: Error::NotConnected.to_string(),
            });
            return;
        };

        let event = match peripheral.discover_services().await {
            Ok(()) => {
                let services = peripheral
                    .services()
                    .into_iter()
                    .map(|service| GattService {
                        uuid: service.uuid,
                        characteristics: service
                            .characteristics
                            .iter()
                            .map(|c| c.uuid)
                            .collect(),
                    })
                    .collect();
                HardwareEvent::ServicesDiscovered { link, services }
            }
            Err(e) => HardwareEvent::ServiceDiscoveryFailed {
                link,
                reason: e.to_string(),
            },
        };
        let _ = self.events_tx.send(event);
    }

    async fn write(&self, link: LinkId, characteristic: &CharacteristicHandle, payload: &[u8]) {
        let target = match self.link_peripheral(link).await {
            Some(peripheral) => peripheral
                .characteristics()
                .into_iter()
                .find(|c| {
                    c.uuid == characteristic.uuid && c.service_uuid == characteristic.service
                })
                .map(|c| (peripheral, c)),
            None => None,
        };

        let Some((peripheral, target)) = target else {
            warn!("Characteristic {} unavailable on {}", characteristic.uuid, link);
            let _ = self.events_tx.send(HardwareEvent::WriteCompleted {
                link,
                success: false,
            });
            return;
        };

        let success = match peripheral.write(&target, payload, WriteType::WithResponse).await {
            Ok(()) => {
                trace!("Wrote {} bytes to characteristic {}", payload.len(), target.uuid);
                true
            }
            Err(e) => {
                warn!("Write to {} failed: {}", target.uuid, e);
                false
            }
        };
        let _ = self.events_tx.send(HardwareEvent::WriteCompleted { link, success });
    }

    async fn disconnect(&self, link: LinkId) {
        let id = self.links.lock().close(link);
        if let Some(id) = id {
            match self.adapter.peripheral(&id).await {
                Ok(peripheral) => {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Failed to disconnect {}: {}", link, e);
                    }
                }
                Err(e) => warn!("Failed to get peripheral for {}: {}", link, e),
            }
        }
        // Not every platform reports DeviceDisconnected for a local disconnect.
        let _ = self.events_tx.send(HardwareEvent::LinkDown { link });
    }
}

impl BleHardware for BtleplugHardware {
    fn start_discovery(&self, filter: &DeviceFilter) -> Result<()> {
        debug!("Starting BLE scan (company {:#06x})", filter.company_id());
        // btleplug only filters by service; manufacturer data is matched on arrival.
        *self.shared.filter.write() = Some(filter.clone());
        self.enqueue(Request::StartDiscovery)
    }

    fn stop_discovery(&self) -> Result<()> {
        self.enqueue(Request::StopDiscovery)
    }

    fn connect(&self, link: LinkId, address: &str) -> Result<()> {
        if !self.shared.discovered.read().contains_key(address) {
            return Err(Error::DeviceNotFound {
                address: address.to_string(),
            });
        }

        self.enqueue(Request::Connect {
            link,
            address: address.to_string(),
        })
    }

    fn discover_services(&self, link: LinkId) -> Result<()> {
        self.enqueue(Request::DiscoverServices { link })
    }

    fn write(
        &self,
        link: LinkId,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
    ) -> Result<()> {
        self.enqueue(Request::Write {
            link,
            characteristic: *characteristic,
            payload: payload.to_vec(),
        })
    }

    fn disconnect(&self, link: LinkId) -> Result<()> {
        self.enqueue(Request::Disconnect { link })
    }
}

impl Drop for BtleplugHardware {
    fn drop(&mut self) {
        self.listener_handle.abort();
        self.worker_handle.abort();
    }
}
