//! End-to-end connection lifecycle tests against the simulated radio

use std::sync::Arc;
use std::time::Duration;

use blemesh_central::platform::simulated::{RadioCall, SimulatedRadio};
use blemesh_central::protocol::{CharProperties, WriteType};
use blemesh_central::{
    AdvertisementBuilder, CentralConfig, CentralError, ConnectRoute, CentralManager, CentralTask,
    Characteristic, ConnectionStatus, DeviceAddress, HandleId, PeerMetadata, Phase, RadioEvent,
    Service, TransportEvent, MESH_SERVICE_UUID,
};
use tokio::sync::mpsc;
use uuid::Uuid;

const RX_UUID: Uuid = Uuid::from_u128(0x72A83FEC_0E1D_4F0B_9A6F_8D3C0B5E1A21);
const TX_UUID: Uuid = Uuid::from_u128(0x72A83FEC_0E1D_4F0B_9A6F_8D3C0B5E1A22);

fn rx() -> Characteristic {
    Characteristic::new(RX_UUID, CharProperties::NOTIFY | CharProperties::INDICATE)
        .with_client_config()
}

fn tx() -> Characteristic {
    Characteristic::new(TX_UUID, CharProperties::WRITE | CharProperties::READ)
}

fn mesh_service(characteristics: Vec<Characteristic>) -> Service {
    Service {
        uuid: MESH_SERVICE_UUID,
        characteristics,
    }
}

fn advertisement(nonce: i32) -> Vec<u8> {
    AdvertisementBuilder::new()
        .service_uuids128(&[MESH_SERVICE_UUID])
        .nonce(0xFE2C, nonce)
        .build()
}

struct Harness {
    radio: Arc<SimulatedRadio>,
    manager: CentralManager,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatch: mpsc::UnboundedReceiver<DeviceAddress>,
}

impl Harness {
    fn new(config: CentralConfig) -> Self {
        let radio = Arc::new(SimulatedRadio::new());
        let (manager, events) = CentralManager::new(radio.clone(), config);
        let dispatch = manager.take_dispatch_receiver().unwrap();
        manager.set_local_advertise_nonce(3);
        Self {
            radio,
            manager,
            events,
            dispatch,
        }
    }

    fn with_notify() -> Self {
        let harness = Self::new(CentralConfig::default());
        harness.manager.register_notify_characteristic(RX_UUID);
        harness
    }

    fn advertise(&self, address: &str, nonce: i32) {
        self.manager.handle_radio_event(RadioEvent::Advertisement {
            address: DeviceAddress::from(address),
            data: advertisement(nonce),
        });
    }

    /// Run queued connection attempts the way the driver task would
    fn pump_dispatch(&mut self) {
        while let Ok(address) = self.dispatch.try_recv() {
            self.manager.initiate_connection(&address);
        }
    }

    fn drain_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn radio_event(&self, event: RadioEvent) {
        self.manager.handle_radio_event(event);
    }

    fn assert_exclusive(&self, address: &DeviceAddress) {
        assert!(
            !(self.manager.is_connecting(address) && self.manager.is_connected_to(address)),
            "{} both connecting and ready",
            address
        );
    }

    /// Bring `address` all the way to Ready with a negotiated size of 185
    fn connect_ready(&mut self, address: &str) -> HandleId {
        let device = DeviceAddress::from(address);
        self.advertise(address, 5);
        self.pump_dispatch();
        let handle = HandleId(self.radio.connect_attempts().len() as u64);

        self.radio_event(RadioEvent::Connected { handle });
        self.radio_event(RadioEvent::ServicesDiscovered {
            handle,
            services: vec![mesh_service(vec![rx(), tx()])],
        });
        self.radio_event(RadioEvent::DescriptorWritten {
            handle,
            characteristic: RX_UUID,
            value: vec![0x02, 0x00],
            success: true,
        });
        self.radio_event(RadioEvent::UnitSizeChanged {
            handle,
            size: 185,
            success: true,
        });
        assert!(self.manager.is_connected_to(&device));
        handle
    }
}

fn connected_updates(events: &[TransportEvent]) -> Vec<&TransportEvent> {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                TransportEvent::IdentifierUpdated {
                    status: ConnectionStatus::Connected,
                    ..
                }
            )
        })
        .collect()
}

fn disconnected_updates(events: &[TransportEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                TransportEvent::IdentifierUpdated {
                    status: ConnectionStatus::Disconnected,
                    ..
                }
            )
        })
        .count()
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

#[test]
fn test_higher_peer_nonce_initiates_connection() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.manager.start();
    assert!(harness.manager.is_scanning());

    harness.advertise("X", 5);
    let address = DeviceAddress::from("X");
    assert_eq!(harness.manager.peripheral_phase(&address), Some(Phase::Connecting));
    assert!(harness.manager.is_connecting(&address));
    assert!(!harness.manager.is_scanning());
    assert!(harness.radio.calls().contains(&RadioCall::StopScan));

    harness.pump_dispatch();
    assert_eq!(harness.radio.connect_attempts().len(), 1);
}

#[test]
fn test_lower_or_equal_nonce_is_ignored() {
    let harness = Harness::new(CentralConfig::default());
    harness.manager.start();

    harness.advertise("X", 2);
    harness.advertise("Y", 3);
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("Y"))
        .is_none());
    assert!(harness.manager.is_scanning());
}

#[test]
fn test_advertisements_ignored_until_started() {
    let harness = Harness::new(CentralConfig::default());

    harness.advertise("X", 5);
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
}

#[test]
fn test_repeat_advertisement_does_not_reconnect() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.manager.start();

    harness.advertise("X", 5);
    harness.advertise("X", 5);
    harness.pump_dispatch();
    assert_eq!(harness.radio.connect_attempts().len(), 1);
}

#[test]
fn test_governor_can_decline() {
    let mut harness = Harness::new(CentralConfig::default());
    harness
        .manager
        .set_governor(Arc::new(|address: &DeviceAddress| address.as_str() != "X"));
    harness.manager.start();

    harness.advertise("X", 5);
    harness.advertise("Y", 5);
    harness.pump_dispatch();
    assert_eq!(
        harness.radio.connect_attempts()[0].0,
        DeviceAddress::from("Y")
    );
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

#[test]
fn test_subscribe_negotiate_then_ready() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let address = DeviceAddress::from("X");

    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);
    harness.assert_exclusive(&address);

    harness.radio_event(RadioEvent::Connected { handle });
    assert!(harness
        .radio
        .calls()
        .contains(&RadioCall::DiscoverServices(handle)));

    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![mesh_service(vec![rx(), tx()])],
    });
    assert_eq!(
        harness.manager.peripheral_phase(&address),
        Some(Phase::SubscribingNotifications)
    );
    assert!(harness.radio.calls().contains(&RadioCall::WriteDescriptor {
        handle,
        characteristic: RX_UUID,
        value: vec![0x02, 0x00],
    }));

    harness.radio_event(RadioEvent::DescriptorWritten {
        handle,
        characteristic: RX_UUID,
        value: vec![0x02, 0x00],
        success: true,
    });
    assert!(harness
        .radio
        .calls()
        .contains(&RadioCall::RequestUnitSize { handle, size: 512 }));
    assert!(!harness.manager.is_connected_to(&address));
    harness.assert_exclusive(&address);

    harness.radio_event(RadioEvent::UnitSizeChanged {
        handle,
        size: 185,
        success: true,
    });
    harness.assert_exclusive(&address);

    let events = harness.drain_events();
    assert_eq!(
        connected_updates(&events),
        vec![&TransportEvent::IdentifierUpdated {
            role: blemesh_central::DeviceRole::Central,
            address: address.clone(),
            status: ConnectionStatus::Connected,
            metadata: Some(PeerMetadata {
                unit_size: Some(185)
            }),
        }]
    );
    assert_eq!(harness.manager.unit_size(&address), Some(185));
    assert!(harness.manager.is_connected_to(&address));
    assert!(!harness.manager.is_connecting(&address));
    assert!(harness.manager.is_scanning());
    assert_eq!(harness.manager.connected_addresses(), vec![address]);
}

#[test]
fn test_renegotiation_reports_connected_once() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");

    harness.radio_event(RadioEvent::UnitSizeChanged {
        handle,
        size: 247,
        success: true,
    });

    let events = harness.drain_events();
    assert_eq!(connected_updates(&events).len(), 1);
    assert_eq!(harness.manager.unit_size(&DeviceAddress::from("X")), Some(247));
}

#[test]
fn test_missing_characteristics_invalidate_cache_and_disconnect() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let address = DeviceAddress::from("X");
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);

    harness.radio_event(RadioEvent::Connected { handle });
    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![mesh_service(Vec::new())],
    });

    let calls = harness.radio.calls();
    assert!(calls.contains(&RadioCall::InvalidateCache(handle)));
    assert!(calls.contains(&RadioCall::Disconnect(handle)));
    assert_eq!(
        harness.manager.peripheral_phase(&address),
        Some(Phase::Disconnecting)
    );

    harness.radio_event(RadioEvent::Disconnected { handle });
    let events = harness.drain_events();
    assert!(connected_updates(&events).is_empty());
    assert_eq!(disconnected_updates(&events), 1);
    assert_eq!(harness.radio.released(), vec![handle]);
    assert!(harness.manager.peripheral_phase(&address).is_none());
    assert!(harness.manager.is_scanning());
}

#[test]
fn test_foreign_service_only_is_rejected() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.manager.start();
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);

    harness.radio_event(RadioEvent::Connected { handle });
    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![Service {
            uuid: Uuid::from_u128(0x180D),
            characteristics: vec![tx()],
        }],
    });

    assert!(harness
        .radio
        .calls()
        .contains(&RadioCall::InvalidateCache(handle)));
    assert!(harness
        .manager
        .discovered_characteristics(&DeviceAddress::from("X"))
        .is_none());
}

#[test]
fn test_ready_without_negotiation_support() {
    let mut harness = Harness::with_notify();
    harness.radio.set_negotiation_supported(false);
    harness.manager.start();
    let address = DeviceAddress::from("X");
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);

    harness.radio_event(RadioEvent::Connected { handle });
    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![mesh_service(vec![rx(), tx()])],
    });
    harness.radio_event(RadioEvent::DescriptorWritten {
        handle,
        characteristic: RX_UUID,
        value: vec![0x02, 0x00],
        success: true,
    });

    assert!(harness.manager.is_connected_to(&address));
    assert_eq!(harness.manager.unit_size(&address), None);
    assert_eq!(
        harness.radio.count(|c| matches!(c, RadioCall::RequestUnitSize { .. })),
        0
    );
}

#[test]
fn test_failed_negotiation_still_reaches_ready() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let address = DeviceAddress::from("X");
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);

    harness.radio_event(RadioEvent::Connected { handle });
    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![mesh_service(vec![rx(), tx()])],
    });
    harness.radio_event(RadioEvent::DescriptorWritten {
        handle,
        characteristic: RX_UUID,
        value: vec![0x02, 0x00],
        success: true,
    });
    harness.radio_event(RadioEvent::UnitSizeChanged {
        handle,
        size: 23,
        success: false,
    });

    assert!(harness.manager.is_connected_to(&address));
    assert_eq!(harness.manager.unit_size(&address), Some(23));
}

#[test]
fn test_descriptor_failure_tears_down() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let address = DeviceAddress::from("X");
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);

    harness.radio_event(RadioEvent::Connected { handle });
    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![mesh_service(vec![rx(), tx()])],
    });
    harness.radio_event(RadioEvent::DescriptorWritten {
        handle,
        characteristic: RX_UUID,
        value: vec![0x02, 0x00],
        success: false,
    });
    assert_eq!(
        harness.manager.peripheral_phase(&address),
        Some(Phase::Disconnecting)
    );
    assert!(harness.radio.calls().contains(&RadioCall::WriteDescriptor {
        handle,
        characteristic: RX_UUID,
        value: vec![0x00, 0x00],
    }));

    harness.radio_event(RadioEvent::DescriptorWritten {
        handle,
        characteristic: RX_UUID,
        value: vec![0x00, 0x00],
        success: true,
    });
    assert!(harness.manager.peripheral_phase(&address).is_none());
    assert_eq!(harness.radio.released(), vec![handle]);
    assert!(connected_updates(&harness.drain_events()).is_empty());

    let disable = harness
        .radio
        .position(&RadioCall::WriteDescriptor {
            handle,
            characteristic: RX_UUID,
            value: vec![0x00, 0x00],
        })
        .unwrap();
    let disconnect = harness
        .radio
        .position(&RadioCall::Disconnect(handle))
        .unwrap();
    let release = harness.radio.position(&RadioCall::Release(handle)).unwrap();
    assert!(disable < disconnect);
    assert!(disconnect < release);
}

#[test]
fn test_discovery_issue_failure_disconnects() {
    let mut harness = Harness::with_notify();
    harness.radio.set_discovery_accepted(false);
    harness.manager.start();
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);

    harness.radio_event(RadioEvent::Connected { handle });

    let disconnect = harness
        .radio
        .position(&RadioCall::Disconnect(handle))
        .unwrap();
    let release = harness.radio.position(&RadioCall::Release(handle)).unwrap();
    assert!(disconnect < release);
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
    assert_eq!(disconnected_updates(&harness.drain_events()), 1);
}

#[test]
fn test_connect_failure_resumes_scanning() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.radio.set_connect_accepted(false);
    harness.manager.start();

    harness.advertise("X", 5);
    harness.pump_dispatch();

    let events = harness.drain_events();
    assert_eq!(disconnected_updates(&events), 1);
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
    assert!(harness.manager.is_scanning());
    assert!(harness.radio.released().is_empty());
}

#[test]
fn test_standard_connect_when_low_energy_unavailable() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.radio.set_low_energy_supported(false);
    harness.manager.start();

    harness.advertise("X", 5);
    harness.pump_dispatch();

    let address = DeviceAddress::from("X");
    assert_eq!(
        harness.radio.connect_attempts(),
        vec![
            (address.clone(), ConnectRoute::LowEnergy),
            (address.clone(), ConnectRoute::Standard),
        ]
    );
    harness.radio_event(RadioEvent::Connected {
        handle: HandleId(1),
    });
    assert_eq!(
        harness.manager.peripheral_phase(&address),
        Some(Phase::DiscoveringServices)
    );
}

#[test]
fn test_scanning_waits_for_every_attempt() {
    let mut harness = Harness::with_notify();
    harness.manager.start();

    harness.connect_ready("A");
    harness.advertise("B", 5);
    assert!(!harness.manager.is_scanning());

    harness.pump_dispatch();
    harness.radio_event(RadioEvent::Disconnected {
        handle: HandleId(2),
    });
    assert!(harness.manager.is_scanning());
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[test]
fn test_unsubscribe_precedes_release() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");

    harness.radio_event(RadioEvent::Disconnected { handle });
    harness.radio_event(RadioEvent::DescriptorWritten {
        handle,
        characteristic: RX_UUID,
        value: vec![0x00, 0x00],
        success: false,
    });

    let unsubscribe = harness
        .radio
        .position(&RadioCall::WriteDescriptor {
            handle,
            characteristic: RX_UUID,
            value: vec![0x00, 0x00],
        })
        .unwrap();
    let release = harness.radio.position(&RadioCall::Release(handle)).unwrap();
    assert!(unsubscribe < release);
    assert_eq!(harness.radio.released(), vec![handle]);
}

#[test]
fn test_unsubscribe_issue_failure_releases_directly() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");

    harness.radio.set_descriptor_writes_accepted(false);
    harness.radio_event(RadioEvent::Disconnected { handle });

    assert_eq!(harness.radio.released(), vec![handle]);
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
}

#[test]
fn test_stop_drains_registry() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let a = harness.connect_ready("A");
    let b = harness.connect_ready("B");

    harness.manager.stop();
    assert!(!harness.manager.is_scanning());
    // Advisory: records stay until their teardowns resolve
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("A"))
        .is_some());
    assert!(harness.manager.connected_addresses().is_empty());
    assert!(!harness.manager.is_idle());
    assert_eq!(harness.manager.peer_count(), 2);

    for handle in [a, b] {
        harness.radio_event(RadioEvent::DescriptorWritten {
            handle,
            characteristic: RX_UUID,
            value: vec![0x00, 0x00],
            success: true,
        });
    }

    assert!(harness.manager.connected_addresses().is_empty());
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("A"))
        .is_none());
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("B"))
        .is_none());
    assert!(!harness.manager.is_scanning());
    assert!(harness.manager.is_idle());
    assert_eq!(disconnected_updates(&harness.drain_events()), 2);
}

#[test]
fn test_stop_abandons_pending_attempt() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.manager.start();
    harness.advertise("X", 5);

    harness.manager.stop();
    harness.pump_dispatch();

    assert!(harness.radio.connect_attempts().is_empty());
    assert!(harness
        .manager
        .peripheral_phase(&DeviceAddress::from("X"))
        .is_none());
}

#[test]
fn test_new_record_is_never_seen_idle() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let harness = Harness::new(CentralConfig::default());
    harness.manager.start();
    let done = Arc::new(AtomicBool::new(false));

    let names: Vec<String> = (0..16).map(|i| format!("P{}", i)).collect();

    let observer = {
        let manager = harness.manager.clone();
        let done = Arc::clone(&done);
        let addresses: Vec<DeviceAddress> =
            names.iter().map(|n| DeviceAddress::from(n.as_str())).collect();
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            while !done.load(Ordering::Acquire) {
                seen.extend(addresses.iter().filter_map(|a| manager.peripheral_phase(a)));
            }
            seen
        })
    };

    for name in &names {
        harness.advertise(name, 5);
    }
    done.store(true, Ordering::Release);

    let seen = observer.join().unwrap();
    assert!(seen.iter().all(|phase| *phase == Phase::Connecting));
    assert_eq!(harness.manager.peer_count(), 16);
}

#[test]
fn test_reset_forgets_everything() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");

    harness.manager.reset();
    assert!(!harness.manager.is_scanning());
    assert!(harness.manager.connected_addresses().is_empty());
    assert_eq!(harness.radio.released(), vec![handle]);

    // Late callbacks for the old connection are ignored
    harness.radio_event(RadioEvent::Disconnected { handle });
    assert_eq!(harness.radio.released(), vec![handle]);
}

// ----------------------------------------------------------------------------
// Data Channel
// ----------------------------------------------------------------------------

#[test]
fn test_write_without_discovery_is_rejected() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.manager.start();
    harness.advertise("X", 5);
    harness.pump_dispatch();

    let address = DeviceAddress::from("X");
    assert_eq!(harness.manager.write(b"hi", TX_UUID, &address), Ok(false));
    assert_eq!(
        harness
            .manager
            .write(b"hi", TX_UUID, &DeviceAddress::from("nobody")),
        Ok(false)
    );
    assert_eq!(
        harness
            .radio
            .count(|c| matches!(c, RadioCall::WriteCharacteristic { .. })),
        0
    );
}

#[test]
fn test_write_to_ready_peer() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");
    let address = DeviceAddress::from("X");

    let accepted = tokio_test::assert_ok!(harness.manager.write(b"hello", TX_UUID, &address));
    assert!(accepted);
    assert!(harness.radio.calls().contains(&RadioCall::WriteCharacteristic {
        handle,
        characteristic: TX_UUID,
        value: b"hello".to_vec(),
        write_type: WriteType::WithResponse,
    }));

    assert_eq!(
        harness
            .manager
            .write(b"hello", Uuid::from_u128(0xDEAD), &address),
        Ok(false)
    );
}

#[test]
fn test_write_to_non_writable_characteristic_is_an_error() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    harness.connect_ready("X");

    assert_eq!(
        harness
            .manager
            .write(b"hello", RX_UUID, &DeviceAddress::from("X")),
        Err(CentralError::CharacteristicNotWritable {
            characteristic: RX_UUID
        })
    );
}

#[test]
fn test_write_results_are_reported() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");
    harness.drain_events();

    harness.radio_event(RadioEvent::CharacteristicWritten {
        handle,
        characteristic: TX_UUID,
        value: b"ok".to_vec(),
        status: 0,
    });
    harness.radio_event(RadioEvent::CharacteristicWritten {
        handle,
        characteristic: TX_UUID,
        value: b"bad".to_vec(),
        status: 0x85,
    });

    let events = harness.drain_events();
    assert!(matches!(
        &events[0],
        TransportEvent::DataSent { error: None, .. }
    ));
    assert!(matches!(
        &events[1],
        TransportEvent::DataSent {
            error: Some(CentralError::WriteRejected { status: 0x85, .. }),
            ..
        }
    ));
}

#[test]
fn test_inbound_data_only_from_subscribed_characteristics() {
    let mut harness = Harness::with_notify();
    harness.manager.start();
    let handle = harness.connect_ready("X");
    harness.drain_events();

    harness.radio_event(RadioEvent::CharacteristicChanged {
        handle,
        characteristic: RX_UUID,
        value: vec![1, 2, 3],
    });
    harness.radio_event(RadioEvent::CharacteristicChanged {
        handle,
        characteristic: TX_UUID,
        value: vec![9],
    });

    assert_eq!(
        harness.drain_events(),
        vec![TransportEvent::DataReceived {
            role: blemesh_central::DeviceRole::Central,
            data: vec![1, 2, 3],
            address: DeviceAddress::from("X"),
        }]
    );
}

#[test]
fn test_notify_registry_snapshot_per_connection() {
    let mut harness = Harness::new(CentralConfig::default());
    harness.manager.start();
    harness.advertise("X", 5);
    harness.pump_dispatch();
    let handle = HandleId(1);
    harness.radio_event(RadioEvent::Connected { handle });
    harness.radio_event(RadioEvent::ServicesDiscovered {
        handle,
        services: vec![mesh_service(vec![rx(), tx()])],
    });

    // Registered after discovery: this connection is unaffected
    harness.manager.register_notify_characteristic(RX_UUID);
    harness.radio_event(RadioEvent::UnitSizeChanged {
        handle,
        size: 185,
        success: true,
    });

    assert!(harness.manager.is_connected_to(&DeviceAddress::from("X")));
    assert_eq!(
        harness
            .radio
            .count(|c| matches!(c, RadioCall::WriteDescriptor { .. })),
        0
    );
}

// ----------------------------------------------------------------------------
// Driver Task
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_driver_task_runs_full_lifecycle() {
    let radio = Arc::new(SimulatedRadio::new());
    let config = CentralConfig::new().with_notify_characteristic(RX_UUID);
    let (manager, mut events) = CentralManager::new(radio.clone(), config);
    manager.set_local_advertise_nonce(3);

    let (radio_tx, radio_rx) = mpsc::unbounded_channel();
    let task = CentralTask::new(manager.clone(), radio_rx).unwrap();
    let driver = tokio::spawn(task.run());

    manager.start();
    radio_tx
        .send(RadioEvent::Advertisement {
            address: DeviceAddress::from("X"),
            data: advertisement(5),
        })
        .unwrap();

    // Wait for the dispatched connect to reach the radio
    tokio::time::timeout(Duration::from_secs(1), async {
        while radio.connect_attempts().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("connect was never issued");

    let handle = HandleId(1);
    for event in [
        RadioEvent::Connected { handle },
        RadioEvent::ServicesDiscovered {
            handle,
            services: vec![mesh_service(vec![rx(), tx()])],
        },
        RadioEvent::DescriptorWritten {
            handle,
            characteristic: RX_UUID,
            value: vec![0x02, 0x00],
            success: true,
        },
        RadioEvent::UnitSizeChanged {
            handle,
            size: 185,
            success: true,
        },
    ] {
        radio_tx.send(event).unwrap();
    }

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no transport event")
        .unwrap();
    assert!(matches!(
        event,
        TransportEvent::IdentifierUpdated {
            status: ConnectionStatus::Connected,
            metadata: Some(PeerMetadata {
                unit_size: Some(185)
            }),
            ..
        }
    ));

    drop(radio_tx);
    driver.await.unwrap();
}
