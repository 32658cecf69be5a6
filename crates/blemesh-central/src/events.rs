//! Events flowing into and out of the central
//!
//! [`RadioEvent`] is the single serialized stream of hardware callbacks fed
//! into the central; [`TransportEvent`] is what the central reports to the
//! transport layer above it.

use uuid::Uuid;

use crate::error::CentralError;
use crate::platform::HandleId;
use crate::protocol::{DeviceAddress, Service};

// ----------------------------------------------------------------------------
// Inbound: Radio Events
// ----------------------------------------------------------------------------

/// Hardware callbacks, delivered in order on one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A scan result with its raw advertisement payload
    Advertisement {
        address: DeviceAddress,
        data: Vec<u8>,
    },
    /// The link came up
    Connected { handle: HandleId },
    /// The link went down, or a connect attempt failed
    Disconnected { handle: HandleId },
    /// Service discovery finished; an empty list means nothing was found
    ServicesDiscovered {
        handle: HandleId,
        services: Vec<Service>,
    },
    /// Result of a descriptor write
    DescriptorWritten {
        handle: HandleId,
        characteristic: Uuid,
        value: Vec<u8>,
        success: bool,
    },
    /// The transport unit size changed
    UnitSizeChanged {
        handle: HandleId,
        size: u16,
        success: bool,
    },
    /// A notification or indication arrived
    CharacteristicChanged {
        handle: HandleId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Result of a characteristic write
    CharacteristicWritten {
        handle: HandleId,
        characteristic: Uuid,
        value: Vec<u8>,
        status: u8,
    },
}

impl RadioEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            RadioEvent::Advertisement { .. } => "advertisement",
            RadioEvent::Connected { .. } => "connected",
            RadioEvent::Disconnected { .. } => "disconnected",
            RadioEvent::ServicesDiscovered { .. } => "services-discovered",
            RadioEvent::DescriptorWritten { .. } => "descriptor-written",
            RadioEvent::UnitSizeChanged { .. } => "unit-size-changed",
            RadioEvent::CharacteristicChanged { .. } => "characteristic-changed",
            RadioEvent::CharacteristicWritten { .. } => "characteristic-written",
        }
    }
}

/// GATT status reported for a successful operation
pub const GATT_SUCCESS: u8 = 0;

// ----------------------------------------------------------------------------
// Outbound: Transport Events
// ----------------------------------------------------------------------------

/// Role of the local device in a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    Central,
}

/// Connection status reported to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Extra details attached to a status update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMetadata {
    pub unit_size: Option<u16>,
}

/// Notifications delivered to the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer became ready or went away
    IdentifierUpdated {
        role: DeviceRole,
        address: DeviceAddress,
        status: ConnectionStatus,
        metadata: Option<PeerMetadata>,
    },
    /// Bytes arrived from a peer
    DataReceived {
        role: DeviceRole,
        data: Vec<u8>,
        address: DeviceAddress,
    },
    /// An outbound write completed
    DataSent {
        role: DeviceRole,
        data: Vec<u8>,
        address: DeviceAddress,
        error: Option<CentralError>,
    },
}
