//! Central-role BLE connection manager for the blemesh transport
//!
//! This crate discovers nearby peripherals advertising the mesh service,
//! connects to them, and runs each connection through a bounded lifecycle
//! (service discovery, notification subscription, unit-size negotiation)
//! before exchanging raw byte payloads with it.
//!
//! ## Architecture
//!
//! - [`advertisement`] - Advertisement parsing and the nonce filter
//! - [`scan`] - Scan lifecycle (requested versus active)
//! - [`registry`] - Address-keyed connection records and the handle index
//! - [`state_machine`] - Per-peripheral lifecycle transitions
//! - [`subscription`] - Client configuration descriptor writes
//! - [`manager`] - Event routing, the data channel and the caller API
//! - [`task`] - Driver loop feeding radio events into the manager
//! - [`platform`] - Radio capability, connect strategies, and backends
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use blemesh_central::platform::btleplug::{first_adapter, BtleplugRadio};
//! use blemesh_central::{CentralConfig, CentralManager, CentralTask};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (radio, radio_events) = BtleplugRadio::new(first_adapter().await?).await?;
//! let (manager, mut events) = CentralManager::new(Arc::new(radio), CentralConfig::new());
//!
//! let task = CentralTask::new(manager.clone(), radio_events)?;
//! tokio::spawn(task.run());
//!
//! manager.start();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod advertisement;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod peer;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod scan;
pub mod state_machine;
pub mod subscription;
pub mod task;

// Public API exports
pub use advertisement::{AdvertiseNonce, AdvertisementBuilder, ParsedAdvertisement, ScanVerdict};
pub use config::{CentralConfig, ConnectRoute, ScanMode};
pub use error::{CentralError, Result};
pub use events::{ConnectionStatus, DeviceRole, PeerMetadata, RadioEvent, TransportEvent};
pub use manager::{CentralManager, ConnectionGovernor};
pub use peer::Phase;
pub use platform::{ConnectionHandle, HandleId, PlatformError, RadioPlatform};
pub use protocol::{
    CharProperties, Characteristic, Descriptor, DeviceAddress, Service, MESH_SERVICE_UUID,
};
pub use task::CentralTask;
