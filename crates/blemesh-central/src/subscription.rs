//! Notification subscription through the client configuration descriptor

use crate::platform::{HandleId, RadioPlatform};
use crate::protocol::{Characteristic, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE};
use crate::state_machine::PeripheralEvent;

/// What happened when a subscription change was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// Descriptor write issued; the result arrives as an event
    Pending,
    /// The characteristic has no client configuration descriptor
    NoDescriptor,
    /// The descriptor write could not be issued
    IssueFailed,
}

/// Toggle local delivery, then write the client configuration descriptor
pub fn set_subscription(
    platform: &dyn RadioPlatform,
    handle: HandleId,
    characteristic: &Characteristic,
    enable: bool,
) -> SubscriptionOutcome {
    if !platform.set_notify(handle, characteristic, enable) {
        tracing::debug!(
            "Local notification toggle refused for {} on {}",
            characteristic.uuid,
            handle
        );
    }

    let Some(descriptor) = characteristic.client_config() else {
        tracing::debug!(
            "Characteristic {} has no client configuration descriptor",
            characteristic.uuid
        );
        return SubscriptionOutcome::NoDescriptor;
    };

    let value: &[u8] = if enable {
        &ENABLE_INDICATION_VALUE
    } else {
        &DISABLE_NOTIFICATION_VALUE
    };

    if platform.write_descriptor(handle, descriptor, value) {
        SubscriptionOutcome::Pending
    } else {
        tracing::warn!(
            "Unable to write descriptor for {} on {} (enable: {})",
            characteristic.uuid,
            handle,
            enable
        );
        SubscriptionOutcome::IssueFailed
    }
}

/// Follow-up event for an issued subscription request, if one is due now
pub fn outcome_event(
    characteristic: &Characteristic,
    enable: bool,
    outcome: SubscriptionOutcome,
) -> Option<PeripheralEvent> {
    let characteristic = characteristic.uuid;
    match (enable, outcome) {
        (_, SubscriptionOutcome::Pending) => None,
        (true, SubscriptionOutcome::NoDescriptor) => {
            Some(PeripheralEvent::SubscriptionConfirmed { characteristic })
        }
        (true, SubscriptionOutcome::IssueFailed) => {
            Some(PeripheralEvent::SubscriptionFailed { characteristic })
        }
        (false, SubscriptionOutcome::NoDescriptor) => {
            Some(PeripheralEvent::UnsubscribeSettled { characteristic })
        }
        (false, SubscriptionOutcome::IssueFailed) => Some(PeripheralEvent::UnsubscribeIssueFailed),
    }
}

/// Interpret a descriptor write result
///
/// Disable writes settle whatever their status; the connection is going away
/// regardless.
pub fn descriptor_result_event(
    characteristic: uuid::Uuid,
    value: &[u8],
    success: bool,
) -> Option<PeripheralEvent> {
    if value == ENABLE_INDICATION_VALUE {
        if success {
            Some(PeripheralEvent::SubscriptionConfirmed { characteristic })
        } else {
            Some(PeripheralEvent::SubscriptionFailed { characteristic })
        }
    } else if value == DISABLE_NOTIFICATION_VALUE {
        Some(PeripheralEvent::UnsubscribeSettled { characteristic })
    } else {
        tracing::error!(
            "Unexpected descriptor value {} written for {}",
            hex::encode(value),
            characteristic
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::{RadioCall, SimulatedRadio};
    use crate::protocol::CharProperties;
    use uuid::Uuid;

    fn notify_characteristic() -> Characteristic {
        Characteristic::new(Uuid::from_u128(0xA1), CharProperties::NOTIFY).with_client_config()
    }

    #[test]
    fn test_enable_writes_indication_value() {
        let radio = SimulatedRadio::new();
        let characteristic = notify_characteristic();

        let outcome = set_subscription(&radio, HandleId(1), &characteristic, true);
        assert_eq!(outcome, SubscriptionOutcome::Pending);
        assert_eq!(
            radio.calls(),
            vec![
                RadioCall::SetNotify {
                    handle: HandleId(1),
                    characteristic: characteristic.uuid,
                    enable: true,
                },
                RadioCall::WriteDescriptor {
                    handle: HandleId(1),
                    characteristic: characteristic.uuid,
                    value: vec![0x02, 0x00],
                },
            ]
        );
    }

    #[test]
    fn test_disable_writes_zero_value() {
        let radio = SimulatedRadio::new();
        let characteristic = notify_characteristic();

        set_subscription(&radio, HandleId(1), &characteristic, false);
        assert!(radio.calls().contains(&RadioCall::WriteDescriptor {
            handle: HandleId(1),
            characteristic: characteristic.uuid,
            value: vec![0x00, 0x00],
        }));
    }

    #[test]
    fn test_missing_descriptor_skips_write() {
        let radio = SimulatedRadio::new();
        let characteristic = Characteristic::new(Uuid::from_u128(0xA1), CharProperties::NOTIFY);

        let outcome = set_subscription(&radio, HandleId(1), &characteristic, true);
        assert_eq!(outcome, SubscriptionOutcome::NoDescriptor);
        assert_eq!(
            outcome_event(&characteristic, true, outcome),
            Some(PeripheralEvent::SubscriptionConfirmed {
                characteristic: characteristic.uuid
            })
        );
    }

    #[test]
    fn test_refused_write_is_a_failure() {
        let radio = SimulatedRadio::new();
        radio.set_descriptor_writes_accepted(false);
        let characteristic = notify_characteristic();

        let outcome = set_subscription(&radio, HandleId(1), &characteristic, true);
        assert_eq!(outcome, SubscriptionOutcome::IssueFailed);
        assert_eq!(
            outcome_event(&characteristic, true, outcome),
            Some(PeripheralEvent::SubscriptionFailed {
                characteristic: characteristic.uuid
            })
        );
        assert_eq!(
            outcome_event(&characteristic, false, outcome),
            Some(PeripheralEvent::UnsubscribeIssueFailed)
        );
    }

    #[test]
    fn test_descriptor_results() {
        let uuid = Uuid::from_u128(0xA1);
        assert_eq!(
            descriptor_result_event(uuid, &ENABLE_INDICATION_VALUE, true),
            Some(PeripheralEvent::SubscriptionConfirmed { characteristic: uuid })
        );
        assert_eq!(
            descriptor_result_event(uuid, &ENABLE_INDICATION_VALUE, false),
            Some(PeripheralEvent::SubscriptionFailed { characteristic: uuid })
        );
        assert_eq!(
            descriptor_result_event(uuid, &DISABLE_NOTIFICATION_VALUE, false),
            Some(PeripheralEvent::UnsubscribeSettled { characteristic: uuid })
        );
        assert_eq!(descriptor_result_event(uuid, &[0x01, 0x00], true), None);
    }
}
