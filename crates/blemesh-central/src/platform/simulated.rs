//! In-memory radio that records every request
//!
//! Nothing is delivered on its own: callers inject
//! [`RadioEvent`](crate::events::RadioEvent)s to play the hardware's part.
//! Useful for exercising the central without an adapter.

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::{ConnectRoute, ScanMode};
use crate::protocol::{Characteristic, Descriptor, DeviceAddress, WriteType};

use super::{ConnectionHandle, HandleId, PlatformError, RadioPlatform};

/// A request issued to the simulated radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan { mode: ScanMode, service: Uuid },
    StopScan,
    Connect { address: DeviceAddress, route: ConnectRoute },
    DiscoverServices(HandleId),
    SetNotify {
        handle: HandleId,
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        handle: HandleId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    RequestUnitSize { handle: HandleId, size: u16 },
    WriteCharacteristic {
        handle: HandleId,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect(HandleId),
    Release(HandleId),
    InvalidateCache(HandleId),
}

#[derive(Debug)]
struct SimulatedState {
    calls: Vec<RadioCall>,
    next_handle: u64,
    scan_accepted: bool,
    low_energy_supported: bool,
    connect_accepted: bool,
    discovery_accepted: bool,
    descriptor_writes_accepted: bool,
    negotiation_supported: bool,
    negotiation_accepted: bool,
    writes_accepted: bool,
    cache_invalidation_supported: bool,
}

/// Scriptable radio for tests and dry runs
#[derive(Debug)]
pub struct SimulatedRadio {
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// A radio that accepts everything and supports unit-size negotiation
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                calls: Vec::new(),
                next_handle: 1,
                scan_accepted: true,
                low_energy_supported: true,
                connect_accepted: true,
                discovery_accepted: true,
                descriptor_writes_accepted: true,
                negotiation_supported: true,
                negotiation_accepted: true,
                writes_accepted: true,
                cache_invalidation_supported: true,
            }),
        }
    }

    pub fn set_scan_accepted(&self, accepted: bool) {
        self.state.lock().scan_accepted = accepted;
    }

    pub fn set_low_energy_supported(&self, supported: bool) {
        self.state.lock().low_energy_supported = supported;
    }

    pub fn set_connect_accepted(&self, accepted: bool) {
        self.state.lock().connect_accepted = accepted;
    }

    pub fn set_discovery_accepted(&self, accepted: bool) {
        self.state.lock().discovery_accepted = accepted;
    }

    pub fn set_descriptor_writes_accepted(&self, accepted: bool) {
        self.state.lock().descriptor_writes_accepted = accepted;
    }

    pub fn set_negotiation_supported(&self, supported: bool) {
        self.state.lock().negotiation_supported = supported;
    }

    pub fn set_negotiation_accepted(&self, accepted: bool) {
        self.state.lock().negotiation_accepted = accepted;
    }

    pub fn set_writes_accepted(&self, accepted: bool) {
        self.state.lock().writes_accepted = accepted;
    }

    pub fn set_cache_invalidation_supported(&self, supported: bool) {
        self.state.lock().cache_invalidation_supported = supported;
    }

    /// Every request issued so far, in order
    pub fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Index of the first recorded call equal to `call`
    pub fn position(&self, call: &RadioCall) -> Option<usize> {
        self.state.lock().calls.iter().position(|c| c == call)
    }

    pub fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn connect_attempts(&self) -> Vec<(DeviceAddress, ConnectRoute)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RadioCall::Connect { address, route } => Some((address.clone(), *route)),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<HandleId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RadioCall::Release(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RadioCall) {
        self.state.lock().calls.push(call);
    }

    fn issue_connect(
        &self,
        address: &DeviceAddress,
        route: ConnectRoute,
    ) -> Result<ConnectionHandle, PlatformError> {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::Connect {
            address: address.clone(),
            route,
        });
        let accepted = match route {
            ConnectRoute::LowEnergy => state.low_energy_supported && state.connect_accepted,
            ConnectRoute::Standard => state.connect_accepted,
        };
        if !accepted {
            return Err(PlatformError::Backend(format!(
                "simulated connect to {} refused",
                address
            )));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        Ok(ConnectionHandle::new(id))
    }
}

impl RadioPlatform for SimulatedRadio {
    fn start_scan(&self, mode: ScanMode, service: Uuid) -> bool {
        self.record(RadioCall::StartScan { mode, service });
        self.state.lock().scan_accepted
    }

    fn stop_scan(&self) {
        self.record(RadioCall::StopScan);
    }

    fn connect_low_energy(
        &self,
        address: &DeviceAddress,
    ) -> Result<ConnectionHandle, PlatformError> {
        self.issue_connect(address, ConnectRoute::LowEnergy)
    }

    fn connect(&self, address: &DeviceAddress) -> Result<ConnectionHandle, PlatformError> {
        self.issue_connect(address, ConnectRoute::Standard)
    }

    fn discover_services(&self, handle: HandleId) -> bool {
        self.record(RadioCall::DiscoverServices(handle));
        self.state.lock().discovery_accepted
    }

    fn set_notify(&self, handle: HandleId, characteristic: &Characteristic, enable: bool) -> bool {
        self.record(RadioCall::SetNotify {
            handle,
            characteristic: characteristic.uuid,
            enable,
        });
        true
    }

    fn write_descriptor(&self, handle: HandleId, descriptor: &Descriptor, value: &[u8]) -> bool {
        self.record(RadioCall::WriteDescriptor {
            handle,
            characteristic: descriptor.characteristic_uuid,
            value: value.to_vec(),
        });
        self.state.lock().descriptor_writes_accepted
    }

    fn supports_unit_size_negotiation(&self) -> bool {
        self.state.lock().negotiation_supported
    }

    fn request_unit_size(&self, handle: HandleId, size: u16) -> bool {
        self.record(RadioCall::RequestUnitSize { handle, size });
        self.state.lock().negotiation_accepted
    }

    fn write_characteristic(
        &self,
        handle: HandleId,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        self.record(RadioCall::WriteCharacteristic {
            handle,
            characteristic: characteristic.uuid,
            value: value.to_vec(),
            write_type,
        });
        self.state.lock().writes_accepted
    }

    fn disconnect(&self, handle: HandleId) {
        self.record(RadioCall::Disconnect(handle));
    }

    fn release(&self, handle: ConnectionHandle) {
        self.record(RadioCall::Release(handle.id()));
    }

    fn invalidate_service_cache(&self, handle: HandleId) -> bool {
        self.record(RadioCall::InvalidateCache(handle));
        self.state.lock().cache_invalidation_supported
    }
}
