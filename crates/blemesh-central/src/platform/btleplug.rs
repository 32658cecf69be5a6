//! Radio platform backed by btleplug
//!
//! btleplug is async while [`RadioPlatform`] is a set of non-blocking
//! requests, so every request is spawned onto the runtime the radio was
//! created on and its outcome is reported as a [`RadioEvent`]. Scan results
//! come from the adapter's event stream; btleplug hands them over already
//! parsed, so they are re-encoded with [`AdvertisementBuilder`] and go through
//! the same parser as any other payload.
//!
//! Capability gaps: there is no way to force the LE transport, request a
//! unit size, or drop the service cache. The central's degraded paths cover
//! all three. Client configuration descriptor writes go through
//! `subscribe`/`unsubscribe`, since some stacks refuse raw CCCD writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ::btleplug::api::{
    Central as _, CentralEvent, Characteristic as BtCharacteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType as BtWriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advertisement::AdvertisementBuilder;
use crate::config::ScanMode;
use crate::events::{RadioEvent, GATT_SUCCESS};
use crate::protocol::{
    uuid_to_u16, CharProperties, Characteristic, Descriptor, DeviceAddress, Service, WriteType,
    CLIENT_CHARACTERISTIC_CONFIG_UUID, DISABLE_NOTIFICATION_VALUE,
};

use super::{ConnectionHandle, HandleId, PlatformError, RadioPlatform};

/// Status reported for a failed characteristic write (GATT_ERROR)
const WRITE_FAILED_STATUS: u8 = 0x85;

impl From<::btleplug::Error> for PlatformError {
    fn from(e: ::btleplug::Error) -> Self {
        PlatformError::Backend(e.to_string())
    }
}

/// Open the first adapter on this machine
pub async fn first_adapter() -> Result<Adapter, PlatformError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(PlatformError::NoAdapter)
}

// ----------------------------------------------------------------------------
// Radio
// ----------------------------------------------------------------------------

struct Link<P> {
    peripheral: P,
    /// Characteristics with local delivery enabled
    notifying: BTreeSet<Uuid>,
    notifications: Option<JoinHandle<()>>,
}

/// Open links by handle
///
/// A handle missing from the table has been released. Spawned connect tasks
/// check it before announcing a link so a release that races the connect
/// closes the link instead of orphaning it.
struct LinkTable<P> {
    links: Mutex<HashMap<HandleId, Link<P>>>,
}

impl<P: Clone> LinkTable<P> {
    fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    fn open(&self, handle: HandleId, peripheral: P) {
        self.links.lock().insert(
            handle,
            Link {
                peripheral,
                notifying: BTreeSet::new(),
                notifications: None,
            },
        );
    }

    fn is_open(&self, handle: HandleId) -> bool {
        self.links.lock().contains_key(&handle)
    }

    fn peripheral(&self, handle: HandleId) -> Option<P> {
        self.links
            .lock()
            .get(&handle)
            .map(|link| link.peripheral.clone())
    }

    fn set_notifying(&self, handle: HandleId, characteristic: Uuid, enable: bool) -> bool {
        let mut links = self.links.lock();
        let Some(link) = links.get_mut(&handle) else {
            return false;
        };
        if enable {
            link.notifying.insert(characteristic);
        } else {
            link.notifying.remove(&characteristic);
        }
        true
    }

    fn delivers(&self, handle: HandleId, characteristic: &Uuid) -> bool {
        self.links
            .lock()
            .get(&handle)
            .map(|link| link.notifying.contains(characteristic))
            .unwrap_or(false)
    }

    /// Hand the notification pump to its link; returned if the link is gone
    fn attach_notifications(
        &self,
        handle: HandleId,
        task: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        match self.links.lock().get_mut(&handle) {
            Some(link) => {
                link.notifications = Some(task);
                Ok(())
            }
            None => Err(task),
        }
    }

    /// Remove a link, stopping its notification pump
    fn close(&self, handle: HandleId) -> Option<P> {
        let link = self.links.lock().remove(&handle)?;
        if let Some(task) = link.notifications {
            task.abort();
        }
        Some(link.peripheral)
    }

    fn handles_where(&self, matches: impl Fn(&P) -> bool) -> Vec<HandleId> {
        self.links
            .lock()
            .iter()
            .filter(|(_, link)| matches(&link.peripheral))
            .map(|(handle, _)| *handle)
            .collect()
    }

    fn close_all(&self) {
        for (_, link) in self.links.lock().drain() {
            if let Some(task) = link.notifications {
                task.abort();
            }
        }
    }
}

struct Shared {
    adapter: Adapter,
    events_tx: mpsc::UnboundedSender<RadioEvent>,
    /// Peripherals seen while scanning, by address
    known: Mutex<HashMap<DeviceAddress, Peripheral>>,
    links: LinkTable<Peripheral>,
}

impl Shared {
    fn send(&self, event: RadioEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Radio event receiver dropped");
        }
    }

    fn handles_for(&self, id: &PeripheralId) -> Vec<HandleId> {
        self.links.handles_where(|peripheral| &peripheral.id() == id)
    }
}

/// Close a link whose handle was released before the connect finished
async fn close_orphan(peripheral: &Peripheral, handle: HandleId) {
    debug!("Connection {} released before it came up; closing", handle);
    if let Err(e) = peripheral.disconnect().await {
        debug!("Disconnect of released {} failed: {}", handle, e);
    }
}

/// [`RadioPlatform`] on a btleplug adapter
pub struct BtleplugRadio {
    shared: Arc<Shared>,
    runtime: Handle,
    next_handle: AtomicU64,
    event_pump: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Wrap `adapter`, returning the radio and its event stream
    ///
    /// Must be called from within a tokio runtime; requests are spawned onto it.
    pub async fn new(
        adapter: Adapter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>), PlatformError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let adapter_events = adapter.events().await?;

        let shared = Arc::new(Shared {
            adapter,
            events_tx,
            known: Mutex::new(HashMap::new()),
            links: LinkTable::new(),
        });

        let pump_shared = Arc::clone(&shared);
        let event_pump = tokio::spawn(async move {
            let mut adapter_events = adapter_events;
            while let Some(event) = adapter_events.next().await {
                handle_adapter_event(&pump_shared, event).await;
            }
            info!("Adapter event stream ended");
        });

        let radio = Self {
            shared,
            runtime: Handle::current(),
            next_handle: AtomicU64::new(1),
            event_pump,
        };
        Ok((radio, events_rx))
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.event_pump.abort();
        self.shared.links.close_all();
    }
}

impl RadioPlatform for BtleplugRadio {
    fn start_scan(&self, mode: ScanMode, service: Uuid) -> bool {
        let filter = match mode {
            ScanMode::ServiceFiltered => ScanFilter {
                services: vec![service],
            },
            ScanMode::Unfiltered => ScanFilter::default(),
        };
        let shared = Arc::clone(&self.shared);
        self.spawn(async move {
            if let Err(e) = shared.adapter.start_scan(filter).await {
                warn!("Failed to start BLE scan: {}", e);
            }
        });
        true
    }

    fn stop_scan(&self) {
        let shared = Arc::clone(&self.shared);
        self.spawn(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
        });
    }

    fn connect(&self, address: &DeviceAddress) -> Result<ConnectionHandle, PlatformError> {
        let peripheral = self
            .shared
            .known
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownPeripheral {
                address: address.to_string(),
            })?;

        let handle = ConnectionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let id = handle.id();
        self.shared.links.open(id, peripheral.clone());

        let shared = Arc::clone(&self.shared);
        self.spawn(async move {
            if let Err(e) = peripheral.connect().await {
                warn!("Connection {} failed: {}", id, e);
                shared.send(RadioEvent::Disconnected { handle: id });
                return;
            }

            if !shared.links.is_open(id) {
                close_orphan(&peripheral, id).await;
                return;
            }

            match peripheral.notifications().await {
                Ok(mut notifications) => {
                    let pump_shared = Arc::clone(&shared);
                    let task = tokio::spawn(async move {
                        while let Some(notification) = notifications.next().await {
                            if pump_shared.links.delivers(id, &notification.uuid) {
                                pump_shared.send(RadioEvent::CharacteristicChanged {
                                    handle: id,
                                    characteristic: notification.uuid,
                                    value: notification.value,
                                });
                            }
                        }
                    });
                    if let Err(task) = shared.links.attach_notifications(id, task) {
                        task.abort();
                    }
                }
                Err(e) => warn!("No notification stream for {}: {}", id, e),
            }

            // The release may also land while the stream was being set up
            if !shared.links.is_open(id) {
                close_orphan(&peripheral, id).await;
                return;
            }

            shared.send(RadioEvent::Connected { handle: id });
        });

        Ok(handle)
    }

    fn discover_services(&self, handle: HandleId) -> bool {
        let Some(peripheral) = self.shared.links.peripheral(handle) else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        self.spawn(async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => peripheral.services().into_iter().map(service_from).collect(),
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", handle, e);
                    Vec::new()
                }
            };
            shared.send(RadioEvent::ServicesDiscovered { handle, services });
        });
        true
    }

    fn set_notify(&self, handle: HandleId, characteristic: &Characteristic, enable: bool) -> bool {
        self.shared
            .links
            .set_notifying(handle, characteristic.uuid, enable)
    }

    fn write_descriptor(&self, handle: HandleId, descriptor: &Descriptor, value: &[u8]) -> bool {
        let Some(peripheral) = self.shared.links.peripheral(handle) else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        let descriptor = descriptor.clone();
        let value = value.to_vec();
        self.spawn(async move {
            let success = match find_characteristic(&peripheral, &descriptor.characteristic_uuid) {
                Some(target) => {
                    let result = if descriptor.uuid != CLIENT_CHARACTERISTIC_CONFIG_UUID {
                        match target.descriptors.iter().find(|d| d.uuid == descriptor.uuid) {
                            Some(raw) => peripheral.write_descriptor(raw, &value).await,
                            None => Ok(()),
                        }
                    } else if value == DISABLE_NOTIFICATION_VALUE {
                        peripheral.unsubscribe(&target).await
                    } else {
                        peripheral.subscribe(&target).await
                    };
                    match result {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                "Descriptor write for {} on {} failed: {}",
                                descriptor.characteristic_uuid, handle, e
                            );
                            false
                        }
                    }
                }
                None => false,
            };
            shared.send(RadioEvent::DescriptorWritten {
                handle,
                characteristic: descriptor.characteristic_uuid,
                value,
                success,
            });
        });
        true
    }

    fn write_characteristic(
        &self,
        handle: HandleId,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        let Some(peripheral) = self.shared.links.peripheral(handle) else {
            return false;
        };
        let Some(target) = find_characteristic(&peripheral, &characteristic.uuid) else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };
        self.spawn(async move {
            let status = match peripheral.write(&target, &value, write_type).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!("Write to {} on {} failed: {}", target.uuid, handle, e);
                    WRITE_FAILED_STATUS
                }
            };
            shared.send(RadioEvent::CharacteristicWritten {
                handle,
                characteristic: target.uuid,
                value,
                status,
            });
        });
        true
    }

    fn disconnect(&self, handle: HandleId) {
        let Some(peripheral) = self.shared.links.peripheral(handle) else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        self.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect of {} failed: {}", handle, e);
            }
            // Not every backend raises DeviceDisconnected for a local disconnect
            shared.send(RadioEvent::Disconnected { handle });
        });
    }

    fn release(&self, handle: ConnectionHandle) {
        let Some(peripheral) = self.shared.links.close(handle.id()) else {
            return;
        };
        self.spawn(async move {
            if matches!(peripheral.is_connected().await, Ok(true)) {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect during release failed: {}", e);
                }
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Adapter Events
// ----------------------------------------------------------------------------

async fn handle_adapter_event(shared: &Shared, event: CentralEvent) {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => {
            report_advertisement(shared, &id).await;
        }
        CentralEvent::DeviceDisconnected(id) => {
            for handle in shared.handles_for(&id) {
                shared.send(RadioEvent::Disconnected { handle });
            }
        }
        _ => {}
    }
}

async fn report_advertisement(shared: &Shared, id: &PeripheralId) {
    let Ok(peripheral) = shared.adapter.peripheral(id).await else {
        return;
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        _ => return,
    };

    let mut short_services = Vec::new();
    let mut long_services = Vec::new();
    for uuid in &properties.services {
        match uuid_to_u16(uuid) {
            Some(short) => short_services.push(short),
            None => long_services.push(*uuid),
        }
    }

    let mut builder = AdvertisementBuilder::new();
    if !short_services.is_empty() {
        builder = builder.service_uuids16(&short_services);
    }
    if !long_services.is_empty() {
        builder = builder.service_uuids128(&long_services);
    }
    // Only 16-bit service data has a wire form the parser reads
    for (uuid, data) in &properties.service_data {
        if let Some(short) = uuid_to_u16(uuid) {
            builder = builder.service_data(short, data);
        }
    }

    let address = DeviceAddress::new(id.to_string());
    shared.known.lock().insert(address.clone(), peripheral);
    shared.send(RadioEvent::Advertisement {
        address,
        data: builder.build(),
    });
}

// ----------------------------------------------------------------------------
// GATT Conversions
// ----------------------------------------------------------------------------

fn find_characteristic(peripheral: &Peripheral, uuid: &Uuid) -> Option<BtCharacteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| &c.uuid == uuid)
}

fn characteristic_from(characteristic: BtCharacteristic) -> Characteristic {
    Characteristic {
        uuid: characteristic.uuid,
        properties: CharProperties::from_bits(characteristic.properties.bits()),
        descriptors: characteristic
            .descriptors
            .into_iter()
            .map(|d| Descriptor {
                uuid: d.uuid,
                characteristic_uuid: d.characteristic_uuid,
            })
            .collect(),
    }
}

fn service_from(service: ::btleplug::api::Service) -> Service {
    Service {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .into_iter()
            .map(characteristic_from)
            .collect(),
    }
}
