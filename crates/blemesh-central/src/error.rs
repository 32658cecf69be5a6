//! Error types for the BLE central

use thiserror::Error;
use uuid::Uuid;

use crate::platform::PlatformError;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the central connection manager
///
/// Hardware hiccups never show up here: they are absorbed by the connection
/// state machine and reported as a `Disconnected` status update instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CentralError {
    /// Caller misuse: the characteristic does not carry the write property
    #[error("Requested write on characteristic {characteristic} without write property")]
    CharacteristicNotWritable { characteristic: Uuid },

    #[error("Write to characteristic {characteristic} on {address} was rejected by the peer (status {status})")]
    WriteRejected {
        address: String,
        characteristic: Uuid,
        status: u8,
    },

    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Central driver already attached")]
    DriverAlreadyAttached,

    #[error("Platform error: {0}")]
    Platform(PlatformError),
}

impl From<PlatformError> for CentralError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::NoAdapter => CentralError::AdapterNotAvailable,
            other => CentralError::Platform(other),
        }
    }
}

/// Result type for central operations
pub type Result<T> = std::result::Result<T, CentralError>;
