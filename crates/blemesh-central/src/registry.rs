//! Device registry: the single source of truth for peripheral state
//!
//! Holds the address-keyed records, the handle-to-address index and the set of
//! unresolved connection attempts. The manager keeps the whole registry behind
//! one lock so the three are always updated together.

use std::collections::{HashMap, HashSet};

use crate::peer::{Phase, PeripheralConnection};
use crate::platform::{ConnectionHandle, HandleId};
use crate::protocol::DeviceAddress;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    peripherals: HashMap<DeviceAddress, PeripheralConnection>,
    by_handle: HashMap<HandleId, DeviceAddress>,
    connecting: HashSet<DeviceAddress>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.peripherals.contains_key(address)
    }

    /// Insert a fresh record and mark the attempt unresolved
    ///
    /// Returns `false` if the address already has a record.
    pub fn insert_connecting(&mut self, address: DeviceAddress) -> bool {
        if self.peripherals.contains_key(&address) {
            return false;
        }
        self.connecting.insert(address.clone());
        self.peripherals
            .insert(address.clone(), PeripheralConnection::new(address));
        true
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&PeripheralConnection> {
        self.peripherals.get(address)
    }

    pub fn get_mut(&mut self, address: &DeviceAddress) -> Option<&mut PeripheralConnection> {
        self.peripherals.get_mut(address)
    }

    pub fn address_for(&self, handle: HandleId) -> Option<&DeviceAddress> {
        self.by_handle.get(&handle)
    }

    /// Store a freshly issued handle on its record
    ///
    /// Hands the handle back if the record is gone or already holds one.
    pub fn attach_handle(
        &mut self,
        address: &DeviceAddress,
        handle: ConnectionHandle,
    ) -> Result<(), ConnectionHandle> {
        match self.peripherals.get_mut(address) {
            Some(peer) if peer.handle.is_none() && peer.phase == Phase::Connecting => {
                self.by_handle.insert(handle.id(), address.clone());
                peer.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Take the handle off a record, dropping its index entry
    pub fn take_handle(&mut self, address: &DeviceAddress) -> Option<ConnectionHandle> {
        let handle = self.peripherals.get_mut(address)?.handle.take()?;
        self.by_handle.remove(&handle.id());
        Some(handle)
    }

    /// Remove a record along with its index and connecting entries
    pub fn remove(&mut self, address: &DeviceAddress) -> Option<PeripheralConnection> {
        let peer = self.peripherals.remove(address)?;
        if let Some(id) = peer.handle_id() {
            self.by_handle.remove(&id);
        }
        self.connecting.remove(address);
        Some(peer)
    }

    /// The attempt resolved into a usable connection
    pub fn mark_ready(&mut self, address: &DeviceAddress) {
        self.connecting.remove(address);
    }

    pub fn is_connecting(&self, address: &DeviceAddress) -> bool {
        self.connecting.contains(address)
    }

    pub fn is_ready(&self, address: &DeviceAddress) -> bool {
        self.peripherals
            .get(address)
            .map(PeripheralConnection::is_ready)
            .unwrap_or(false)
    }

    pub fn connecting_is_empty(&self) -> bool {
        self.connecting.is_empty()
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.peripherals.keys().cloned().collect()
    }

    pub fn ready_addresses(&self) -> Vec<DeviceAddress> {
        let mut ready: Vec<_> = self
            .peripherals
            .values()
            .filter(|p| p.is_ready())
            .map(|p| p.address.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Drop everything, returning the handles that were still held
    pub fn clear(&mut self) -> Vec<ConnectionHandle> {
        self.by_handle.clear();
        self.connecting.clear();
        self.peripherals
            .drain()
            .filter_map(|(_, mut peer)| peer.handle.take())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }
}
