//! Radio platform capability consumed by the central
//!
//! The central never talks to a radio stack directly. Every hardware
//! operation is a non-blocking request on [`RadioPlatform`] that reports
//! whether it could be issued; the eventual outcome is delivered later as a
//! [`RadioEvent`](crate::events::RadioEvent) on the single event stream.

pub mod btleplug;
pub mod simulated;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConnectRoute, ScanMode};
use crate::protocol::{Characteristic, Descriptor, DeviceAddress, WriteType};

// ----------------------------------------------------------------------------
// Connection Handles
// ----------------------------------------------------------------------------

/// Identifier of a live radio connection, used to correlate events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ownership of a live radio connection
///
/// Deliberately neither `Clone` nor `Copy`: the only way to give it up is
/// [`RadioPlatform::release`], which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle(HandleId);

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        Self(HandleId(id))
    }

    pub fn id(&self) -> HandleId {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures reported by a radio backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Operation not supported by this platform: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Unknown peripheral: {address}")]
    UnknownPeripheral { address: String },

    #[error("No BLE adapter available")]
    NoAdapter,

    #[error("Backend error: {0}")]
    Backend(String),
}

// ----------------------------------------------------------------------------
// Platform Capability
// ----------------------------------------------------------------------------

/// Radio operations the central drives
///
/// Implementations must not call back into the central synchronously; all
/// results go through the event stream.
pub trait RadioPlatform: Send + Sync {
    /// Begin scanning; `false` if the scan could not be started
    fn start_scan(&self, mode: ScanMode, service: Uuid) -> bool;

    fn stop_scan(&self);

    /// Connect forcing the LE transport
    fn connect_low_energy(
        &self,
        _address: &DeviceAddress,
    ) -> Result<ConnectionHandle, PlatformError> {
        Err(PlatformError::Unsupported {
            operation: "connect_low_energy",
        })
    }

    /// Connect using the platform's standard entry point
    fn connect(&self, address: &DeviceAddress) -> Result<ConnectionHandle, PlatformError>;

    fn discover_services(&self, handle: HandleId) -> bool;

    /// Toggle local delivery of notifications; synchronous
    fn set_notify(&self, handle: HandleId, characteristic: &Characteristic, enable: bool) -> bool;

    fn write_descriptor(&self, handle: HandleId, descriptor: &Descriptor, value: &[u8]) -> bool;

    fn supports_unit_size_negotiation(&self) -> bool {
        false
    }

    fn request_unit_size(&self, _handle: HandleId, _size: u16) -> bool {
        false
    }

    fn write_characteristic(
        &self,
        handle: HandleId,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> bool;

    fn disconnect(&self, handle: HandleId);

    /// Close the connection and free everything the platform holds for it
    fn release(&self, handle: ConnectionHandle);

    /// Drop any cached service table; best effort
    fn invalidate_service_cache(&self, _handle: HandleId) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// Connect Strategies
// ----------------------------------------------------------------------------

/// One way of issuing a connect request
pub trait ConnectStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect(
        &self,
        platform: &dyn RadioPlatform,
        address: &DeviceAddress,
    ) -> Result<ConnectionHandle, PlatformError>;
}

/// Preferred strategy: pin the connection to the LE transport so dual-mode
/// peers are not probed over classic SDP
pub struct LowEnergyConnect;

impl ConnectStrategy for LowEnergyConnect {
    fn name(&self) -> &'static str {
        "low-energy"
    }

    fn connect(
        &self,
        platform: &dyn RadioPlatform,
        address: &DeviceAddress,
    ) -> Result<ConnectionHandle, PlatformError> {
        platform.connect_low_energy(address)
    }
}

/// Fallback strategy using the stable connect call
pub struct StandardConnect;

impl ConnectStrategy for StandardConnect {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn connect(
        &self,
        platform: &dyn RadioPlatform,
        address: &DeviceAddress,
    ) -> Result<ConnectionHandle, PlatformError> {
        platform.connect(address)
    }
}

/// Build the strategy chain for the configured routes
pub fn strategies_for(routes: &[ConnectRoute]) -> Vec<Box<dyn ConnectStrategy>> {
    routes
        .iter()
        .map(|route| -> Box<dyn ConnectStrategy> {
            match route {
                ConnectRoute::LowEnergy => Box::new(LowEnergyConnect),
                ConnectRoute::Standard => Box::new(StandardConnect),
            }
        })
        .collect()
}

/// Try each strategy in order until one issues the request
pub fn connect_with(
    strategies: &[Box<dyn ConnectStrategy>],
    platform: &dyn RadioPlatform,
    address: &DeviceAddress,
) -> Result<ConnectionHandle, PlatformError> {
    let mut last_error = PlatformError::Unsupported { operation: "connect" };
    for strategy in strategies {
        match strategy.connect(platform, address) {
            Ok(handle) => {
                tracing::debug!(
                    "Connect to {} issued via {} strategy",
                    address,
                    strategy.name()
                );
                return Ok(handle);
            }
            Err(e) => {
                tracing::warn!(
                    "Unable to connect to {} via {} strategy: {}",
                    address,
                    strategy.name(),
                    e
                );
                last_error = e;
            }
        }
    }
    Err(last_error)
}
