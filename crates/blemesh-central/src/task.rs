//! Driver task: the central's single ordering context

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{CentralError, Result};
use crate::events::RadioEvent;
use crate::manager::CentralManager;
use crate::protocol::DeviceAddress;

/// Pumps radio events and queued connection attempts into the manager
pub struct CentralTask {
    manager: CentralManager,
    radio_rx: mpsc::UnboundedReceiver<RadioEvent>,
    dispatch_rx: mpsc::UnboundedReceiver<DeviceAddress>,
}

impl CentralTask {
    /// Attach a driver to `manager`; only one driver may exist per manager
    pub fn new(
        manager: CentralManager,
        radio_rx: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> Result<Self> {
        let dispatch_rx = manager
            .take_dispatch_receiver()
            .ok_or(CentralError::DriverAlreadyAttached)?;
        Ok(Self {
            manager,
            radio_rx,
            dispatch_rx,
        })
    }

    /// Run until the radio event stream ends
    pub async fn run(mut self) {
        info!("Central task starting");

        loop {
            tokio::select! {
                event = self.radio_rx.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Radio event: {}", event.kind());
                            self.manager.handle_radio_event(event);
                        }
                        None => {
                            info!("Radio event channel closed, shutting down");
                            break;
                        }
                    }
                }

                address = self.dispatch_rx.recv() => {
                    match address {
                        Some(address) => self.manager.initiate_connection(&address),
                        None => {
                            info!("Connection dispatch channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        info!("Central task stopped");
    }
}
