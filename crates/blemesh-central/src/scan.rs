//! Scan lifecycle
//!
//! Tracks whether scanning was *requested* by the caller separately from
//! whether the radio is *actively* scanning. Connection attempts pause the
//! radio without touching the request, so the scan comes back on its own once
//! the attempt resolves.

use uuid::Uuid;

use crate::config::ScanMode;
use crate::platform::RadioPlatform;

/// Requested versus actual scan status
///
/// `requested` can stay set while `active` is forced off for a connection
/// attempt. Clearing `requested` always clears `active` as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanState {
    pub requested: bool,
    pub active: bool,
}

/// Owns the scan on/off lifecycle
#[derive(Debug)]
pub struct ScanController {
    state: ScanState,
    mode: ScanMode,
    service: Uuid,
}

impl ScanController {
    pub fn new(mode: ScanMode, service: Uuid) -> Self {
        Self {
            state: ScanState::default(),
            mode,
            service,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Request scanning and start the radio if it is idle
    pub fn start(&mut self, platform: &dyn RadioPlatform) {
        self.state.requested = true;
        self.activate(platform);
    }

    /// Withdraw the request and halt the radio
    pub fn stop(&mut self, platform: &dyn RadioPlatform) {
        self.state.requested = false;
        if self.state.active {
            platform.stop_scan();
            self.state.active = false;
            tracing::info!("Scanning stopped");
        }
    }

    /// Halt the radio for a connection attempt, keeping the request
    pub fn pause_for_connection(&mut self, platform: &dyn RadioPlatform) {
        if self.state.active {
            platform.stop_scan();
            self.state.active = false;
            tracing::debug!("Scanning paused for connection attempt");
        }
    }

    /// Restart the radio if the caller still wants scanning
    pub fn resume_if_requested(&mut self, platform: &dyn RadioPlatform) {
        if self.state.requested {
            self.activate(platform);
        }
    }

    /// Forget all state without touching the radio
    pub fn reset(&mut self) {
        self.state = ScanState::default();
    }

    fn activate(&mut self, platform: &dyn RadioPlatform) {
        if self.state.active {
            return;
        }
        if platform.start_scan(self.mode, self.service) {
            self.state.active = true;
            tracing::info!("Scanning for {} ({:?})", self.service, self.mode);
        } else {
            tracing::warn!("Platform refused to start scanning");
        }
    }
}
