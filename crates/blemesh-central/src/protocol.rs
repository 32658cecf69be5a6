//! BLE protocol constants and GATT model types

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Well-known UUIDs
// ----------------------------------------------------------------------------

/// Default mesh service UUID advertised by peripherals running this transport
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x72A83FEC_0E1D_4F0B_9A6F_8D3C0B5E1A20);

/// Client characteristic configuration descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// The Bluetooth base UUID, `00000000-0000-1000-8000-00805f9b34fb`
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Descriptor value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Descriptor value disabling notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Transport-unit size requested after subscription
pub const DEFAULT_REQUESTED_UNIT_SIZE: u16 = 512;

/// Expand a 16-bit assigned number into its 128-bit form
pub fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Recover the 16-bit form of a UUID derived from the Bluetooth base UUID
pub fn uuid_to_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u32;
    if short <= u16::MAX as u32 && value & !(0xFFFF_u128 << 96) == BLUETOOTH_BASE_UUID {
        Some(short as u16)
    } else {
        None
    }
}

// ----------------------------------------------------------------------------
// Addresses
// ----------------------------------------------------------------------------

/// Stable identifier of a remote peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

// ----------------------------------------------------------------------------
// GATT Model
// ----------------------------------------------------------------------------

/// Characteristic property bits, as carried in the GATT declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharProperties(u8);

impl CharProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for CharProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for CharProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::NOTIFY, "notify"),
            (Self::INDICATE, "indicate"),
            (Self::WRITE, "write"),
            (Self::WRITE_WITHOUT_RESPONSE, "write-no-rsp"),
            (Self::READ, "read"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        write!(f, " ({})", self.0)
    }
}

/// A descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

/// A characteristic found under the target service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: CharProperties) -> Self {
        Self {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Attach a client configuration descriptor
    pub fn with_client_config(mut self) -> Self {
        self.descriptors.push(Descriptor {
            uuid: CLIENT_CHARACTERISTIC_CONFIG_UUID,
            characteristic_uuid: self.uuid,
        });
        self
    }

    pub fn client_config(&self) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
    }

    pub fn is_writable(&self) -> bool {
        self.properties.contains(CharProperties::WRITE)
    }
}

/// A primary service exposed by a connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

/// Write mode for outbound characteristic writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Acknowledged write (the default)
    WithResponse,
    WithoutResponse,
}
