//! Per-peripheral connection state machine
//!
//! Drives one [`PeripheralConnection`] through its lifecycle:
//!
//! ```text
//! Idle -> Connecting -> DiscoveringServices -> SubscribingNotifications
//!      -> NegotiatingUnitSize -> Ready -> Disconnecting -> Disconnected
//! ```
//!
//! Transitions are pure: [`PeripheralConnection::apply`] mutates the record
//! and returns the [`Action`]s the manager must carry out. Nothing in here
//! touches the radio.

use std::collections::BTreeSet;

use thiserror::Error;
use uuid::Uuid;

use crate::peer::{Phase, PeripheralConnection};
use crate::protocol::Characteristic;

// ----------------------------------------------------------------------------
// Events and Actions
// ----------------------------------------------------------------------------

/// Inputs to the per-peripheral state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// A qualifying advertisement passed admission
    ConnectRequested,
    /// No connect strategy could issue the request
    ConnectFailed,
    /// The radio link came up
    LinkUp,
    /// The radio link went down
    LinkDown,
    /// Service discovery could not be started
    DiscoveryIssueFailed,
    /// Discovery finished; `None` when the target service was absent
    ServicesDiscovered {
        characteristics: Option<Vec<Characteristic>>,
    },
    /// Notifications enabled, or nothing to confirm against
    SubscriptionConfirmed { characteristic: Uuid },
    SubscriptionFailed { characteristic: Uuid },
    /// Negotiation could not be requested
    NegotiationUnavailable,
    UnitSizeReported { size: u16 },
    /// A disable write completed, successfully or not
    UnsubscribeSettled { characteristic: Uuid },
    /// A disable write could not be issued
    UnsubscribeIssueFailed,
    /// The caller asked for the peer to be dropped
    DisconnectRequested,
}

impl PeripheralEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PeripheralEvent::ConnectRequested => "ConnectRequested",
            PeripheralEvent::ConnectFailed => "ConnectFailed",
            PeripheralEvent::LinkUp => "LinkUp",
            PeripheralEvent::LinkDown => "LinkDown",
            PeripheralEvent::DiscoveryIssueFailed => "DiscoveryIssueFailed",
            PeripheralEvent::ServicesDiscovered { .. } => "ServicesDiscovered",
            PeripheralEvent::SubscriptionConfirmed { .. } => "SubscriptionConfirmed",
            PeripheralEvent::SubscriptionFailed { .. } => "SubscriptionFailed",
            PeripheralEvent::NegotiationUnavailable => "NegotiationUnavailable",
            PeripheralEvent::UnitSizeReported { .. } => "UnitSizeReported",
            PeripheralEvent::UnsubscribeSettled { .. } => "UnsubscribeSettled",
            PeripheralEvent::UnsubscribeIssueFailed => "UnsubscribeIssueFailed",
            PeripheralEvent::DisconnectRequested => "DisconnectRequested",
        }
    }
}

/// Work the manager performs after a transition, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    PauseScanning,
    /// Resume scanning once no other attempt is unresolved
    ResumeScanning,
    /// Hand the address to the ordering context for connection
    Connect,
    DiscoverServices,
    Subscribe { characteristic: Characteristic },
    Unsubscribe { characteristic: Characteristic },
    RequestUnitSize { size: u16 },
    InvalidateCache,
    Disconnect,
    /// Give the connection handle back to the platform
    Release,
    /// Drop the record from the registry
    Forget,
    ReportConnected { unit_size: Option<u16> },
    ReportDisconnected,
}

/// Knobs fixed for a connection when its services are discovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPolicy {
    /// Snapshot of the notify registry
    pub notify: BTreeSet<Uuid>,
    /// `None` when negotiation is disabled or unsupported
    pub requested_unit_size: Option<u16>,
}

/// Result of a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: Phase,
    pub to: Phase,
    pub actions: Vec<Action>,
}

impl StateTransition {
    pub fn changed_phase(&self) -> bool {
        self.from != self.to
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid transition for {address} from {from} on event {event}")]
    InvalidTransition {
        address: String,
        from: Phase,
        event: &'static str,
    },
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl PeripheralConnection {
    /// Process an event, returning the actions to execute
    ///
    /// On error the record is left untouched.
    pub fn apply(
        &mut self,
        event: PeripheralEvent,
        policy: &LinkPolicy,
    ) -> Result<StateTransition, TransitionError> {
        let from = self.phase;
        let mut actions = Vec::new();

        match (from, event) {
            (Phase::Idle, PeripheralEvent::ConnectRequested) => {
                self.phase = Phase::Connecting;
                actions.push(Action::PauseScanning);
                actions.push(Action::Connect);
            }

            (Phase::Connecting, PeripheralEvent::ConnectFailed) => {
                self.finalize(&mut actions);
            }

            (Phase::Connecting, PeripheralEvent::LinkUp) => {
                self.phase = Phase::DiscoveringServices;
                actions.push(Action::DiscoverServices);
            }

            (Phase::DiscoveringServices, PeripheralEvent::DiscoveryIssueFailed) => {
                self.begin_teardown(true, &mut actions);
            }

            (Phase::DiscoveringServices, PeripheralEvent::ServicesDiscovered { characteristics }) => {
                match characteristics {
                    Some(characteristics) if !characteristics.is_empty() => {
                        self.notify_targets = characteristics
                            .iter()
                            .filter(|c| policy.notify.contains(&c.uuid))
                            .cloned()
                            .collect();
                        self.discovered_characteristics = Some(characteristics);

                        if self.notify_targets.is_empty() {
                            self.enter_negotiation(policy, &mut actions);
                        } else {
                            self.phase = Phase::SubscribingNotifications;
                            for target in &self.notify_targets {
                                self.pending_enable.insert(target.uuid);
                                self.subscribed.insert(target.uuid);
                                actions.push(Action::Subscribe {
                                    characteristic: target.clone(),
                                });
                            }
                        }
                    }
                    _ => {
                        // Wait for the link to drop before releasing
                        self.phase = Phase::Disconnecting;
                        actions.push(Action::InvalidateCache);
                        actions.push(Action::Disconnect);
                    }
                }
            }

            (
                Phase::SubscribingNotifications,
                PeripheralEvent::SubscriptionConfirmed { characteristic },
            ) => {
                if self.pending_enable.remove(&characteristic) && self.pending_enable.is_empty() {
                    self.enter_negotiation(policy, &mut actions);
                }
            }

            (Phase::SubscribingNotifications, PeripheralEvent::SubscriptionFailed { .. }) => {
                self.begin_teardown(true, &mut actions);
            }

            (Phase::NegotiatingUnitSize, PeripheralEvent::UnitSizeReported { size }) => {
                self.negotiated_unit_size = Some(size);
                self.become_ready(&mut actions);
            }

            (Phase::NegotiatingUnitSize, PeripheralEvent::NegotiationUnavailable) => {
                self.become_ready(&mut actions);
            }

            // Renegotiation, or a stack reporting its unit size early
            (
                Phase::Connecting
                | Phase::DiscoveringServices
                | Phase::SubscribingNotifications
                | Phase::Ready,
                PeripheralEvent::UnitSizeReported { size },
            ) => {
                self.negotiated_unit_size = Some(size);
            }

            (
                Phase::Connecting
                | Phase::DiscoveringServices
                | Phase::SubscribingNotifications
                | Phase::NegotiatingUnitSize
                | Phase::Ready,
                PeripheralEvent::LinkDown | PeripheralEvent::DisconnectRequested,
            ) => {
                self.begin_teardown(false, &mut actions);
            }

            (Phase::Disconnecting, PeripheralEvent::LinkDown) => {
                if self.pending_unsubscribe.is_empty() {
                    self.finalize(&mut actions);
                }
            }

            (Phase::Disconnecting, PeripheralEvent::UnsubscribeSettled { characteristic }) => {
                if self.pending_unsubscribe.remove(&characteristic)
                    && self.pending_unsubscribe.is_empty()
                {
                    self.finalize(&mut actions);
                }
            }

            (Phase::Disconnecting, PeripheralEvent::UnsubscribeIssueFailed) => {
                self.pending_unsubscribe.clear();
                self.finalize(&mut actions);
            }

            // Late results for a connection already on its way out
            (
                Phase::Disconnecting,
                PeripheralEvent::DisconnectRequested
                | PeripheralEvent::SubscriptionConfirmed { .. }
                | PeripheralEvent::SubscriptionFailed { .. }
                | PeripheralEvent::UnitSizeReported { .. },
            ) => {}

            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    address: self.address.to_string(),
                    from,
                    event: event.name(),
                });
            }
        }

        Ok(StateTransition {
            from,
            to: self.phase,
            actions,
        })
    }

    fn enter_negotiation(&mut self, policy: &LinkPolicy, actions: &mut Vec<Action>) {
        match policy.requested_unit_size {
            Some(size) => {
                self.phase = Phase::NegotiatingUnitSize;
                actions.push(Action::RequestUnitSize { size });
            }
            None => self.become_ready(actions),
        }
    }

    fn become_ready(&mut self, actions: &mut Vec<Action>) {
        self.phase = Phase::Ready;
        actions.push(Action::ReportConnected {
            unit_size: self.negotiated_unit_size,
        });
        actions.push(Action::ResumeScanning);
    }

    /// Unsubscribe every notify target; release once they have all settled
    ///
    /// With `disconnect` set, a disconnect follows the disable writes (or
    /// precedes the release when there is nothing to unsubscribe).
    fn begin_teardown(&mut self, disconnect: bool, actions: &mut Vec<Action>) {
        self.phase = Phase::Disconnecting;
        self.pending_enable.clear();

        for target in &self.notify_targets {
            self.pending_unsubscribe.insert(target.uuid);
            self.subscribed.remove(&target.uuid);
            actions.push(Action::Unsubscribe {
                characteristic: target.clone(),
            });
        }

        if disconnect && self.handle.is_some() {
            actions.push(Action::Disconnect);
        }

        if self.pending_unsubscribe.is_empty() {
            self.finalize(actions);
        }
    }

    fn finalize(&mut self, actions: &mut Vec<Action>) {
        self.phase = Phase::Disconnected;
        self.subscribed.clear();
        if self.handle.is_some() {
            actions.push(Action::Release);
        }
        actions.push(Action::Forget);
        actions.push(Action::ReportDisconnected);
        actions.push(Action::ResumeScanning);
    }
}
