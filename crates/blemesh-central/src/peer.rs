//! Per-peripheral connection record

use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

use crate::platform::{ConnectionHandle, HandleId};
use crate::protocol::{Characteristic, DeviceAddress};

// ----------------------------------------------------------------------------
// Lifecycle Phase
// ----------------------------------------------------------------------------

/// Lifecycle phase of one peripheral connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Connecting,
    DiscoveringServices,
    SubscribingNotifications,
    NegotiatingUnitSize,
    Ready,
    Disconnecting,
    Disconnected,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Connecting => "Connecting",
            Phase::DiscoveringServices => "DiscoveringServices",
            Phase::SubscribingNotifications => "SubscribingNotifications",
            Phase::NegotiatingUnitSize => "NegotiatingUnitSize",
            Phase::Ready => "Ready",
            Phase::Disconnecting => "Disconnecting",
            Phase::Disconnected => "Disconnected",
        }
    }

    /// Phases between a connect request and `Ready`
    pub fn is_establishing(&self) -> bool {
        matches!(
            self,
            Phase::Connecting
                | Phase::DiscoveringServices
                | Phase::SubscribingNotifications
                | Phase::NegotiatingUnitSize
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Connection Record
// ----------------------------------------------------------------------------

/// Everything the central knows about one peripheral
#[derive(Debug)]
pub struct PeripheralConnection {
    pub address: DeviceAddress,
    pub phase: Phase,
    /// `None` until discovery finds the target service
    pub discovered_characteristics: Option<Vec<Characteristic>>,
    pub negotiated_unit_size: Option<u16>,
    pub handle: Option<ConnectionHandle>,
    /// Discovered characteristics that matched the notify registry at discovery time
    pub(crate) notify_targets: Vec<Characteristic>,
    /// Characteristics with local notification delivery enabled
    pub(crate) subscribed: BTreeSet<Uuid>,
    pub(crate) pending_enable: BTreeSet<Uuid>,
    pub(crate) pending_unsubscribe: BTreeSet<Uuid>,
}

impl PeripheralConnection {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            phase: Phase::Idle,
            discovered_characteristics: None,
            negotiated_unit_size: None,
            handle: None,
            notify_targets: Vec::new(),
            subscribed: BTreeSet::new(),
            pending_enable: BTreeSet::new(),
            pending_unsubscribe: BTreeSet::new(),
        }
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(ConnectionHandle::id)
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Look up a discovered characteristic by UUID
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.discovered_characteristics
            .as_ref()?
            .iter()
            .find(|c| &c.uuid == uuid)
    }

    pub fn notify_target(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.notify_targets.iter().find(|c| &c.uuid == uuid)
    }

    /// Whether inbound values for `uuid` should reach the caller
    pub fn delivers(&self, uuid: &Uuid) -> bool {
        self.subscribed.contains(uuid)
    }
}
