//! BLE central configuration

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{DEFAULT_REQUESTED_UNIT_SIZE, MESH_SERVICE_UUID};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// How the platform scanner is asked to filter advertisements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Ask the radio to filter by service UUID
    ServiceFiltered,
    /// Scan everything and filter in software (legacy path)
    Unfiltered,
}

/// Connect strategies, tried in the configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectRoute {
    /// Force the LE link; not every stack exposes this
    LowEnergy,
    /// Whatever the platform's standard connect call does
    Standard,
}

/// Configuration for the BLE central
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Service every peer must advertise and expose
    pub service_uuid: Uuid,
    /// Scan backend
    pub scan_mode: ScanMode,
    /// Whether to negotiate a larger transport unit after subscribing
    pub request_unit_size: bool,
    /// Transport unit requested during negotiation
    pub requested_unit_size: u16,
    /// Connect strategies in preference order
    pub connect_routes: Vec<ConnectRoute>,
    /// Characteristics to subscribe to on every new connection
    pub notify_characteristics: Vec<Uuid>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            service_uuid: MESH_SERVICE_UUID,
            // Hardware service filtering is unreliable on some chipsets
            scan_mode: ScanMode::Unfiltered,
            request_unit_size: true,
            requested_unit_size: DEFAULT_REQUESTED_UNIT_SIZE,
            connect_routes: vec![ConnectRoute::LowEnergy, ConnectRoute::Standard],
            notify_characteristics: Vec::new(),
        }
    }
}

impl CentralConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target service
    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Set the scan backend
    pub fn with_scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    /// Enable or disable unit-size negotiation
    pub fn with_unit_size_negotiation(mut self, enabled: bool) -> Self {
        self.request_unit_size = enabled;
        self
    }

    /// Set the requested transport unit size
    pub fn with_requested_unit_size(mut self, size: u16) -> Self {
        self.requested_unit_size = size;
        self
    }

    /// Replace the connect strategy order
    pub fn with_connect_routes(mut self, routes: Vec<ConnectRoute>) -> Self {
        self.connect_routes = routes;
        self
    }

    /// Add a characteristic to subscribe to on connect
    pub fn with_notify_characteristic(mut self, uuid: Uuid) -> Self {
        if !self.notify_characteristics.contains(&uuid) {
            self.notify_characteristics.push(uuid);
        }
        self
    }
}
