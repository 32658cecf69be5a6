//! Central connection manager
//!
//! [`CentralManager`] owns the device registry and the scan controller, routes
//! every [`RadioEvent`] into the per-peripheral state machine and carries out
//! the resulting actions against the [`RadioPlatform`].
//!
//! Locking rule: each record mutation happens inside one registry lock scope.
//! Platform calls and transport notifications are made only after that lock
//! has been released.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advertisement::{evaluate, AdvertiseNonce, ParsedAdvertisement, ScanVerdict};
use crate::config::CentralConfig;
use crate::error::{CentralError, Result};
use crate::events::{
    ConnectionStatus, DeviceRole, PeerMetadata, RadioEvent, TransportEvent, GATT_SUCCESS,
};
use crate::peer::Phase;
use crate::platform::{
    connect_with, strategies_for, ConnectStrategy, ConnectionHandle, HandleId, RadioPlatform,
};
use crate::protocol::{Characteristic, DeviceAddress, Service, WriteType};
use crate::registry::DeviceRegistry;
use crate::scan::ScanController;
use crate::state_machine::{Action, LinkPolicy, PeripheralEvent};
use crate::subscription::{descriptor_result_event, outcome_event, set_subscription};

// ----------------------------------------------------------------------------
// Admission Policy
// ----------------------------------------------------------------------------

/// Decides whether a qualifying peer may be connected to
pub trait ConnectionGovernor: Send + Sync {
    fn should_connect(&self, address: &DeviceAddress) -> bool;
}

impl<F> ConnectionGovernor for F
where
    F: Fn(&DeviceAddress) -> bool + Send + Sync,
{
    fn should_connect(&self, address: &DeviceAddress) -> bool {
        self(address)
    }
}

// ----------------------------------------------------------------------------
// Central Manager
// ----------------------------------------------------------------------------

/// Work left over after a transition, executed outside the registry lock
enum Step {
    Run(Action, Option<HandleId>),
    Release(ConnectionHandle),
}

struct Inner {
    config: CentralConfig,
    platform: Arc<dyn RadioPlatform>,
    registry: Mutex<DeviceRegistry>,
    scan: Mutex<ScanController>,
    notify: RwLock<BTreeSet<Uuid>>,
    advertise_nonce: AdvertiseNonce,
    governor: RwLock<Option<Arc<dyn ConnectionGovernor>>>,
    strategies: Vec<Box<dyn ConnectStrategy>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    dispatch_tx: mpsc::UnboundedSender<DeviceAddress>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceAddress>>>,
}

/// Central-role connection manager
#[derive(Clone)]
pub struct CentralManager {
    inner: Arc<Inner>,
}

impl CentralManager {
    /// Create a manager and the receiver for its transport events
    pub fn new(
        platform: Arc<dyn RadioPlatform>,
        config: CentralConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let notify = config.notify_characteristics.iter().copied().collect();
        let scan = ScanController::new(config.scan_mode, config.service_uuid);
        let strategies = strategies_for(&config.connect_routes);

        let inner = Inner {
            config,
            platform,
            registry: Mutex::new(DeviceRegistry::new()),
            scan: Mutex::new(scan),
            notify: RwLock::new(notify),
            advertise_nonce: AdvertiseNonce::default(),
            governor: RwLock::new(None),
            strategies,
            events_tx,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Take the receiver of queued connection attempts (only once)
    pub fn take_dispatch_receiver(&self) -> Option<mpsc::UnboundedReceiver<DeviceAddress>> {
        self.inner.dispatch_rx.lock().take()
    }

    pub fn config(&self) -> &CentralConfig {
        &self.inner.config
    }

    /// Install the admission policy consulted before each connection
    pub fn set_governor(&self, governor: Arc<dyn ConnectionGovernor>) {
        *self.inner.governor.write() = Some(governor);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Request scanning
    pub fn start(&self) {
        self.inner.scan.lock().start(self.platform());
    }

    /// Stop scanning and ask every known peer to disconnect
    ///
    /// Records go away as their teardowns complete.
    pub fn stop(&self) {
        self.inner.scan.lock().stop(self.platform());

        let addresses = self.inner.registry.lock().addresses();
        for address in addresses {
            self.drive(&address, PeripheralEvent::DisconnectRequested);
        }
    }

    /// Forget every peer immediately
    ///
    /// For use once the radio session is already gone; held handles are
    /// released without any unsubscribe traffic.
    pub fn reset(&self) {
        let handles = self.inner.registry.lock().clear();
        self.inner.scan.lock().reset();
        for handle in handles {
            self.platform().release(handle);
        }
        info!("Central state reset");
    }

    /// Subscribe to `uuid` on connections discovered from now on
    pub fn register_notify_characteristic(&self, uuid: Uuid) {
        self.inner.notify.write().insert(uuid);
    }

    pub fn set_local_advertise_nonce(&self, nonce: i32) {
        self.inner.advertise_nonce.set(nonce);
    }

    /// Shared handle to the local advertisement nonce
    pub fn advertise_nonce(&self) -> AdvertiseNonce {
        self.inner.advertise_nonce.clone()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_connected_to(&self, address: &DeviceAddress) -> bool {
        self.inner.registry.lock().is_ready(address)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scan.lock().is_active()
    }

    pub fn unit_size(&self, address: &DeviceAddress) -> Option<u16> {
        self.inner
            .registry
            .lock()
            .get(address)
            .and_then(|peer| peer.negotiated_unit_size)
    }

    pub fn discovered_characteristics(&self, address: &DeviceAddress) -> Option<Vec<Characteristic>> {
        self.inner
            .registry
            .lock()
            .get(address)
            .and_then(|peer| peer.discovered_characteristics.clone())
    }

    pub fn connected_addresses(&self) -> Vec<DeviceAddress> {
        self.inner.registry.lock().ready_addresses()
    }

    pub fn peripheral_phase(&self, address: &DeviceAddress) -> Option<Phase> {
        self.inner.registry.lock().get(address).map(|peer| peer.phase)
    }

    pub fn is_connecting(&self, address: &DeviceAddress) -> bool {
        self.inner.registry.lock().is_connecting(address)
    }

    /// Number of peers with a record, in any phase
    pub fn peer_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// No peer is connecting, connected or still tearing down
    pub fn is_idle(&self) -> bool {
        self.inner.registry.lock().is_empty()
    }

    // ------------------------------------------------------------------------
    // Data Channel
    // ------------------------------------------------------------------------

    /// Queue `data` for an acknowledged write
    ///
    /// `Ok(true)` only means the platform accepted the request; completion
    /// arrives later as [`TransportEvent::DataSent`].
    pub fn write(&self, data: &[u8], characteristic: Uuid, address: &DeviceAddress) -> Result<bool> {
        let (handle, target) = {
            let registry = self.inner.registry.lock();
            let Some(peer) = registry.get(address) else {
                debug!("Write to unknown peer {} rejected", address);
                return Ok(false);
            };
            let Some(target) = peer.characteristic(&characteristic) else {
                debug!(
                    "Write to {} rejected: characteristic {} not discovered",
                    address, characteristic
                );
                return Ok(false);
            };
            if !target.is_writable() {
                return Err(CentralError::CharacteristicNotWritable { characteristic });
            }
            let Some(handle) = peer.handle_id().filter(|_| peer.is_ready()) else {
                debug!("Write to {} rejected: peer is {}", address, peer.phase);
                return Ok(false);
            };
            (handle, target.clone())
        };

        debug!(
            "Writing {} bytes to {} on {}: {}",
            data.len(),
            characteristic,
            address,
            hex::encode(data)
        );
        Ok(self
            .platform()
            .write_characteristic(handle, &target, data, WriteType::WithResponse))
    }

    /// Begin tearing down the connection to `address`
    pub fn disconnect(&self, address: &DeviceAddress) {
        self.drive(address, PeripheralEvent::DisconnectRequested);
    }

    // ------------------------------------------------------------------------
    // Radio Event Dispatch
    // ------------------------------------------------------------------------

    /// Route one hardware callback
    pub fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement { address, data } => self.on_advertisement(address, &data),
            RadioEvent::Connected { handle } => self.on_link_up(handle),
            RadioEvent::Disconnected { handle } => self.on_link_down(handle),
            RadioEvent::ServicesDiscovered { handle, services } => {
                self.on_services_discovered(handle, services)
            }
            RadioEvent::DescriptorWritten {
                handle,
                characteristic,
                value,
                success,
            } => self.on_descriptor_written(handle, characteristic, &value, success),
            RadioEvent::UnitSizeChanged {
                handle,
                size,
                success,
            } => self.on_unit_size_changed(handle, size, success),
            RadioEvent::CharacteristicChanged {
                handle,
                characteristic,
                value,
            } => self.on_characteristic_changed(handle, characteristic, value),
            RadioEvent::CharacteristicWritten {
                handle,
                characteristic,
                value,
                status,
            } => self.on_characteristic_written(handle, characteristic, value, status),
        }
    }

    fn on_advertisement(&self, address: DeviceAddress, data: &[u8]) {
        if !self.inner.scan.lock().is_requested() {
            return;
        }

        let parsed = ParsedAdvertisement::parse(data);
        let local_nonce = self.inner.advertise_nonce.get();
        let nonce = match evaluate(&parsed, &self.inner.config.service_uuid, local_nonce) {
            ScanVerdict::Connect { nonce } => nonce,
            ScanVerdict::ForeignService => return,
            ScanVerdict::MissingNonce => {
                debug!("Advertisement from {} carries no usable nonce", address);
                return;
            }
            ScanVerdict::Yield { nonce } => {
                debug!(
                    "Leaving {} to connect to us (nonce {} <= {})",
                    address, nonce, local_nonce
                );
                return;
            }
        };

        if self.inner.registry.lock().contains(&address) {
            return;
        }

        let governor = self.inner.governor.read().clone();
        if let Some(governor) = governor {
            if !governor.should_connect(&address) {
                debug!("Connection to {} declined by governor", address);
                return;
            }
        }

        // The record enters Connecting under the same lock that creates it
        let policy = self.link_policy();
        let steps = {
            let mut registry = self.inner.registry.lock();
            if !registry.insert_connecting(address.clone()) {
                return;
            }
            apply_locked(&mut registry, &address, PeripheralEvent::ConnectRequested, &policy)
        };

        info!(
            "Connecting to {} (nonce {} > {})",
            address, nonce, local_nonce
        );
        if let Some(steps) = steps {
            self.run_steps(&address, steps, VecDeque::new());
        }
    }

    fn on_link_up(&self, handle: HandleId) {
        if let Some(address) = self.address_for(handle) {
            info!("Link up with {} ({})", address, handle);
            self.drive(&address, PeripheralEvent::LinkUp);
        }
    }

    fn on_link_down(&self, handle: HandleId) {
        if let Some(address) = self.address_for(handle) {
            info!("Link down with {} ({})", address, handle);
            self.drive(&address, PeripheralEvent::LinkDown);
        }
    }

    fn on_services_discovered(&self, handle: HandleId, services: Vec<Service>) {
        let Some(address) = self.address_for(handle) else {
            return;
        };

        let service_uuid = self.inner.config.service_uuid;
        let characteristics = services
            .into_iter()
            .find(|service| service.uuid == service_uuid)
            .map(|service| service.characteristics);

        match &characteristics {
            Some(characteristics) => {
                for characteristic in characteristics {
                    debug!(
                        "{} characteristic {} properties {}",
                        address, characteristic.uuid, characteristic.properties
                    );
                }
            }
            None => warn!("Service {} not found on {}", service_uuid, address),
        }

        self.drive(&address, PeripheralEvent::ServicesDiscovered { characteristics });
    }

    fn on_descriptor_written(
        &self,
        handle: HandleId,
        characteristic: Uuid,
        value: &[u8],
        success: bool,
    ) {
        let Some(address) = self.address_for(handle) else {
            return;
        };
        if !success {
            warn!(
                "Descriptor write for {} on {} failed",
                characteristic, address
            );
        }
        if let Some(event) = descriptor_result_event(characteristic, value, success) {
            self.drive(&address, event);
        }
    }

    fn on_unit_size_changed(&self, handle: HandleId, size: u16, success: bool) {
        let Some(address) = self.address_for(handle) else {
            return;
        };
        if success {
            debug!("Unit size for {} is {}", address, size);
        } else {
            warn!(
                "Unit size negotiation with {} failed; continuing with {}",
                address, size
            );
        }
        self.drive(&address, PeripheralEvent::UnitSizeReported { size });
    }

    fn on_characteristic_changed(&self, handle: HandleId, characteristic: Uuid, value: Vec<u8>) {
        let address = {
            let registry = self.inner.registry.lock();
            let Some(address) = registry.address_for(handle) else {
                return;
            };
            let delivers = registry
                .get(address)
                .map(|peer| peer.delivers(&characteristic))
                .unwrap_or(false);
            if !delivers {
                debug!(
                    "Dropping value for unsubscribed characteristic {} from {}",
                    characteristic, address
                );
                return;
            }
            address.clone()
        };

        debug!(
            "Received {} bytes from {}: {}",
            value.len(),
            address,
            hex::encode(&value)
        );
        self.emit(TransportEvent::DataReceived {
            role: DeviceRole::Central,
            data: value,
            address,
        });
    }

    fn on_characteristic_written(
        &self,
        handle: HandleId,
        characteristic: Uuid,
        value: Vec<u8>,
        status: u8,
    ) {
        let Some(address) = self.address_for(handle) else {
            return;
        };
        let error = (status != GATT_SUCCESS).then(|| CentralError::WriteRejected {
            address: address.to_string(),
            characteristic,
            status,
        });
        if let Some(error) = &error {
            warn!("{}", error);
        }
        self.emit(TransportEvent::DataSent {
            role: DeviceRole::Central,
            data: value,
            address,
            error,
        });
    }

    // ------------------------------------------------------------------------
    // Connection Dispatch
    // ------------------------------------------------------------------------

    /// Issue the connect request for a queued attempt
    ///
    /// Runs on the ordering context; see [`crate::task::CentralTask`].
    pub fn initiate_connection(&self, address: &DeviceAddress) {
        let pending = self
            .inner
            .registry
            .lock()
            .get(address)
            .map(|peer| peer.phase == Phase::Connecting && peer.handle.is_none())
            .unwrap_or(false);
        if !pending {
            debug!("Skipping stale connection dispatch for {}", address);
            return;
        }

        match connect_with(&self.inner.strategies, self.platform(), address) {
            Ok(handle) => {
                let attached = self.inner.registry.lock().attach_handle(address, handle);
                if let Err(handle) = attached {
                    debug!("{} went away while connecting; releasing {}", address, handle.id());
                    self.platform().disconnect(handle.id());
                    self.platform().release(handle);
                }
            }
            Err(e) => {
                warn!("Unable to connect to {}: {}", address, e);
                self.drive(address, PeripheralEvent::ConnectFailed);
            }
        }
    }

    // ------------------------------------------------------------------------
    // State Machine Driver
    // ------------------------------------------------------------------------

    /// Run an event and every follow-up it produces for one peer
    fn drive(&self, address: &DeviceAddress, event: PeripheralEvent) {
        self.run_steps(address, Vec::new(), VecDeque::from([event]));
    }

    /// Execute `steps`, then drain `queue` along with whatever the steps produce
    fn run_steps(
        &self,
        address: &DeviceAddress,
        steps: Vec<Step>,
        mut queue: VecDeque<PeripheralEvent>,
    ) {
        let mut steps = Some(steps);
        loop {
            // Every step runs before follow-ups are looked at
            for step in steps.take().into_iter().flatten() {
                if let Some(next) = self.execute(address, step) {
                    queue.push_back(next);
                }
            }
            let Some(event) = queue.pop_front() else {
                return;
            };
            steps = self.transition(address, event);
        }
    }

    /// Apply an event under the registry lock
    fn transition(&self, address: &DeviceAddress, event: PeripheralEvent) -> Option<Vec<Step>> {
        let policy = self.link_policy();
        let mut registry = self.inner.registry.lock();
        apply_locked(&mut registry, address, event, &policy)
    }

    /// Carry out one step; returns an event when the outcome is already known
    fn execute(&self, address: &DeviceAddress, step: Step) -> Option<PeripheralEvent> {
        let platform = self.platform();
        let (action, handle) = match step {
            Step::Release(handle) => {
                debug!("Releasing {} for {}", handle.id(), address);
                platform.release(handle);
                return None;
            }
            Step::Run(action, handle) => (action, handle),
        };

        match action {
            Action::PauseScanning => {
                self.inner.scan.lock().pause_for_connection(platform);
                None
            }
            Action::ResumeScanning => {
                let idle = self.inner.registry.lock().connecting_is_empty();
                if idle {
                    self.inner.scan.lock().resume_if_requested(platform);
                }
                None
            }
            Action::Connect => {
                if self.inner.dispatch_tx.send(address.clone()).is_err() {
                    warn!("Connection dispatcher gone; abandoning {}", address);
                    return Some(PeripheralEvent::ConnectFailed);
                }
                None
            }
            Action::DiscoverServices => {
                let issued = handle
                    .map(|handle| platform.discover_services(handle))
                    .unwrap_or(false);
                if issued {
                    None
                } else {
                    warn!("Unable to start service discovery on {}", address);
                    Some(PeripheralEvent::DiscoveryIssueFailed)
                }
            }
            Action::Subscribe { characteristic } => match handle {
                Some(handle) => {
                    debug!("Subscribing to {} on {}", characteristic.uuid, address);
                    let outcome = set_subscription(platform, handle, &characteristic, true);
                    outcome_event(&characteristic, true, outcome)
                }
                None => Some(PeripheralEvent::SubscriptionFailed {
                    characteristic: characteristic.uuid,
                }),
            },
            Action::Unsubscribe { characteristic } => match handle {
                Some(handle) => {
                    debug!("Unsubscribing from {} on {}", characteristic.uuid, address);
                    let outcome = set_subscription(platform, handle, &characteristic, false);
                    outcome_event(&characteristic, false, outcome)
                }
                None => Some(PeripheralEvent::UnsubscribeIssueFailed),
            },
            Action::RequestUnitSize { size } => {
                let issued = handle
                    .map(|handle| platform.request_unit_size(handle, size))
                    .unwrap_or(false);
                if issued {
                    None
                } else {
                    debug!("Unit size negotiation unavailable for {}", address);
                    Some(PeripheralEvent::NegotiationUnavailable)
                }
            }
            Action::InvalidateCache => {
                let refreshed = handle
                    .map(|handle| platform.invalidate_service_cache(handle))
                    .unwrap_or(false);
                if !refreshed {
                    warn!("Unable to invalidate service cache for {}", address);
                }
                None
            }
            Action::Disconnect => {
                if let Some(handle) = handle {
                    platform.disconnect(handle);
                }
                None
            }
            Action::ReportConnected { unit_size } => {
                info!("Connected to {} (unit size {:?})", address, unit_size);
                self.emit(TransportEvent::IdentifierUpdated {
                    role: DeviceRole::Central,
                    address: address.clone(),
                    status: ConnectionStatus::Connected,
                    metadata: Some(PeerMetadata { unit_size }),
                });
                None
            }
            Action::ReportDisconnected => {
                info!("Disconnected from {}", address);
                self.emit(TransportEvent::IdentifierUpdated {
                    role: DeviceRole::Central,
                    address: address.clone(),
                    status: ConnectionStatus::Disconnected,
                    metadata: None,
                });
                None
            }
            // Handled under the registry lock
            Action::Release | Action::Forget => None,
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn platform(&self) -> &dyn RadioPlatform {
        self.inner.platform.as_ref()
    }

    fn address_for(&self, handle: HandleId) -> Option<DeviceAddress> {
        let address = self.inner.registry.lock().address_for(handle).cloned();
        if address.is_none() {
            debug!("Ignoring event for unknown connection {}", handle);
        }
        address
    }

    fn link_policy(&self) -> LinkPolicy {
        let requested_unit_size = (self.inner.config.request_unit_size
            && self.inner.platform.supports_unit_size_negotiation())
        .then_some(self.inner.config.requested_unit_size);
        LinkPolicy {
            notify: self.inner.notify.read().clone(),
            requested_unit_size,
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.inner.events_tx.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}

/// Apply `event` to the record for `address`, settling Release and Forget
/// against the registry the caller holds locked
fn apply_locked(
    registry: &mut DeviceRegistry,
    address: &DeviceAddress,
    event: PeripheralEvent,
    policy: &LinkPolicy,
) -> Option<Vec<Step>> {
    let Some(peer) = registry.get_mut(address) else {
        debug!("No record for {}; dropping {}", address, event.name());
        return None;
    };
    let handle = peer.handle_id();
    let transition = match peer.apply(event, policy) {
        Ok(transition) => transition,
        Err(e) => {
            warn!("{}", e);
            return None;
        }
    };

    if transition.changed_phase() {
        debug!("{}: {} -> {}", address, transition.from, transition.to);
    }
    if transition.to == Phase::Ready {
        registry.mark_ready(address);
    }

    let mut steps = Vec::with_capacity(transition.actions.len());
    for action in transition.actions {
        match action {
            Action::Release => {
                if let Some(handle) = registry.take_handle(address) {
                    steps.push(Step::Release(handle));
                }
            }
            Action::Forget => {
                registry.remove(address);
            }
            action => steps.push(Step::Run(action, handle)),
        }
    }
    Some(steps)
}
