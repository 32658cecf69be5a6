//! Application wiring: adapter, radio backend, central and driver task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blemesh_central::platform::btleplug::{first_adapter, BtleplugRadio};
use blemesh_central::{
    CentralError, CentralManager, CentralTask, ConnectionStatus, DeviceAddress, TransportEvent,
};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// How long shutdown waits for peers to finish tearing down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running central bound to the first local adapter
pub struct CentralApp {
    manager: CentralManager,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    driver: JoinHandle<()>,
}

impl CentralApp {
    /// Open the adapter and start the driver task (scanning is not started)
    pub async fn new(config: &AppConfig, nonce: Option<i32>) -> Result<Self> {
        let adapter = first_adapter().await.map_err(CentralError::from)?;
        let (radio, radio_events) = BtleplugRadio::new(adapter).await?;
        let (manager, events) = CentralManager::new(Arc::new(radio), config.central.clone());

        let nonce = nonce
            .or(config.runtime.advertise_nonce)
            .unwrap_or_else(random_nonce);
        manager.set_local_advertise_nonce(nonce);
        info!("Local advertisement nonce: {}", nonce);

        let task = CentralTask::new(manager.clone(), radio_events)?;
        let driver = tokio::spawn(task.run());

        Ok(Self {
            manager,
            events,
            driver,
        })
    }

    pub fn manager(&self) -> &CentralManager {
        &self.manager
    }

    /// Next transport event, or `None` once the central is gone
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Wait until `address` reports ready; returns its negotiated unit size
    pub async fn wait_until_ready(
        &mut self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Option<u16>> {
        if self.manager.is_connected_to(address) {
            return Ok(self.manager.unit_size(address));
        }

        let wait = async {
            while let Some(event) = self.events.recv().await {
                if let TransportEvent::IdentifierUpdated {
                    address: updated,
                    status: ConnectionStatus::Connected,
                    metadata,
                    ..
                } = event
                {
                    if &updated == address {
                        return Some(metadata.and_then(|m| m.unit_size));
                    }
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(unit_size)) => Ok(unit_size),
            Ok(None) => Err(CliError::Config("central stopped unexpectedly".to_string())),
            Err(_) => Err(CliError::Timeout(format!("{} never became ready", address))),
        }
    }

    /// Stop scanning, disconnect every peer and stop the driver
    ///
    /// The driver keeps running until every teardown has released its
    /// connection, or until the grace period runs out.
    pub async fn shutdown(mut self) {
        self.manager.stop();

        let drained = drain_teardowns(&self.manager, &mut self.events, SHUTDOWN_GRACE).await;
        if !drained {
            warn!(
                "{} peers still tearing down after {:?}; releasing",
                self.manager.peer_count(),
                SHUTDOWN_GRACE
            );
            self.manager.reset();
        }

        self.driver.abort();
        debug!("Central driver stopped");
    }
}

/// Wait until the manager holds no records; `false` on timeout
async fn drain_teardowns(
    manager: &CentralManager,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    grace: Duration,
) -> bool {
    let drained = tokio::time::timeout(grace, async {
        while !manager.is_idle() {
            if events.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    drained.is_ok() && manager.is_idle()
}

/// Nonce drawn from the v4 UUID generator
fn random_nonce() -> i32 {
    uuid::Uuid::new_v4().as_u128() as i32
}
