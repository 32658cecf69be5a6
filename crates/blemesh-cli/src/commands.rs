//! Command handlers for the blemesh CLI

use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use blemesh_central::{ConnectionStatus, DeviceAddress, TransportEvent};

use crate::app::CentralApp;
use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Scan { seconds } => Self::handle_scan_command(&config, cli.nonce, seconds).await,
            Commands::Send {
                to,
                characteristic,
                payload,
            } => {
                Self::handle_send_command(&config, cli.nonce, to, characteristic, payload).await
            }
            Commands::Config => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    }

    /// Handle the scan command
    async fn handle_scan_command(
        config: &AppConfig,
        nonce: Option<i32>,
        seconds: Option<u64>,
    ) -> Result<()> {
        let mut app = CentralApp::new(config, nonce).await?;
        app.manager().start();
        info!("Scanning for {}... Press Ctrl+C to stop", config.central.service_uuid);

        let deadline = async {
            match seconds {
                Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = app.next_event() => match event {
                    Some(event) => println!("{}", describe(&event)),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                _ = &mut deadline => break,
            }
        }

        app.shutdown().await;
        Ok(())
    }

    /// Handle the send command
    async fn handle_send_command(
        config: &AppConfig,
        nonce: Option<i32>,
        to: String,
        characteristic: String,
        payload: String,
    ) -> Result<()> {
        let address = DeviceAddress::new(to);
        let characteristic = Uuid::parse_str(&characteristic)?;
        let data = hex::decode(payload.trim())?;

        let mut app = CentralApp::new(config, nonce).await?;
        app.manager().start();

        let ready_timeout = Duration::from_secs(config.runtime.ready_timeout_secs);
        let unit_size = app.wait_until_ready(&address, ready_timeout).await?;
        info!("{} ready (unit size {:?})", address, unit_size);

        let result = Self::write_and_confirm(&mut app, config, &address, characteristic, &data).await;
        app.shutdown().await;
        result?;

        println!("Sent {} bytes to {}", data.len(), address);
        Ok(())
    }

    async fn write_and_confirm(
        app: &mut CentralApp,
        config: &AppConfig,
        address: &DeviceAddress,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        if !app.manager().write(data, characteristic, address)? {
            return Err(CliError::WriteRejected(format!(
                "{} is not ready or has no characteristic {}",
                address, characteristic
            )));
        }

        let confirm = async {
            while let Some(event) = app.next_event().await {
                if let TransportEvent::DataSent {
                    address: sent_to,
                    error,
                    ..
                } = event
                {
                    if &sent_to == address {
                        return Some(error);
                    }
                }
            }
            None
        };

        let write_timeout = Duration::from_secs(config.runtime.write_timeout_secs);
        match tokio::time::timeout(write_timeout, confirm).await {
            Ok(Some(None)) => Ok(()),
            Ok(Some(Some(e))) => Err(CliError::WriteRejected(e.to_string())),
            Ok(None) => Err(CliError::Config("central stopped unexpectedly".to_string())),
            Err(_) => Err(CliError::Timeout(format!("no write confirmation from {}", address))),
        }
    }
}

/// One-line rendering of a transport event
pub fn describe(event: &TransportEvent) -> String {
    match event {
        TransportEvent::IdentifierUpdated {
            address,
            status: ConnectionStatus::Connected,
            metadata,
            ..
        } => {
            let unit_size = metadata.as_ref().and_then(|m| m.unit_size);
            match unit_size {
                Some(size) => format!("+ {} ready (unit size {})", address, size),
                None => format!("+ {} ready", address),
            }
        }
        TransportEvent::IdentifierUpdated {
            address,
            status: ConnectionStatus::Disconnected,
            ..
        } => format!("- {} disconnected", address),
        TransportEvent::DataReceived { address, data, .. } => {
            format!("< {} [{}] {}", address, data.len(), hex::encode(data))
        }
        TransportEvent::DataSent {
            address,
            data,
            error: None,
            ..
        } => format!("> {} [{}] sent", address, data.len()),
        TransportEvent::DataSent {
            address,
            data,
            error: Some(e),
            ..
        } => format!("> {} [{}] failed: {}", address, data.len(), e),
    }
}
