//! Broker-profile loading and the negotiation flow across a session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use starlingcam::app::ports::keys;
use starlingcam::app::CancelToken;
use starlingcam::config::CaptureSchedule;
use starlingcam::link::mqtt::SimTransport;
use starlingcam::link::{BrokerProfile, HandshakeClient, TransportEvent};

use crate::mock_ports::MemStorage;

fn seed_profile(storage: &Arc<Mutex<Box<dyn starlingcam::app::ports::StoragePort>>>) {
    let mut guard = storage.lock().unwrap();
    for (key, value) in [
        (keys::MQTT_ADDRESS, "mqtts://broker.example:8883"),
        (keys::MQTT_USER, "capture-node-07"),
        (keys::MQTT_PASSWORD, "s3cret"),
        (keys::CONFIG_TOPIC, "starling/07/config"),
        (keys::HEALTH_TOPIC, "starling/07/health"),
        (keys::IMAGE_ACK_TOPIC, "starling/07/ack"),
        (keys::IMAGE_TOPIC, "starling/07/image"),
        (keys::LOG_TOPIC, "starling/07/log"),
    ] {
        guard.write(key, value.as_bytes()).unwrap();
    }
}

#[test]
fn broker_profile_loads_every_field_from_storage() {
    let storage = MemStorage::shared();
    seed_profile(&storage);

    let guard = storage.lock().unwrap();
    let profile = BrokerProfile::from_storage(&**guard).unwrap();
    assert_eq!(profile.uri, "mqtts://broker.example:8883");
    assert_eq!(profile.username, "capture-node-07");
    assert_eq!(profile.topics.config, "starling/07/config");
    assert_eq!(profile.topics.image_ack, "starling/07/ack");
}

#[test]
fn broker_profile_requires_every_key() {
    let storage = MemStorage::shared();
    seed_profile(&storage);
    storage.lock().unwrap().delete(keys::IMAGE_TOPIC).unwrap();

    let guard = storage.lock().unwrap();
    assert!(BrokerProfile::from_storage(&**guard).is_err());
}

#[test]
fn reconnect_is_attempted_while_session_is_live() {
    let storage = MemStorage::shared();
    seed_profile(&storage);
    let profile = {
        let guard = storage.lock().unwrap();
        BrokerProfile::from_storage(&**guard).unwrap()
    };

    let schedule = Arc::new(Mutex::new(CaptureSchedule::new()));
    let link = HandshakeClient::new(profile.topics, schedule, storage);
    let transport = Arc::new(SimTransport::new());
    link.attach_transport(transport.clone());

    link.on_transport_event(TransportEvent::Connected);
    link.on_transport_event(TransportEvent::Disconnected);
    assert_eq!(transport.reconnect_count(), 1);
}

#[test]
fn two_negotiations_in_one_session_use_fresh_rendezvous() {
    let storage = MemStorage::shared();
    seed_profile(&storage);
    let schedule = Arc::new(Mutex::new(CaptureSchedule::new()));
    let link = HandshakeClient::new(
        {
            let guard = storage.lock().unwrap();
            BrokerProfile::from_storage(&**guard).unwrap().topics
        },
        schedule,
        storage,
    );
    link.attach_transport(Arc::new(SimTransport::new()));

    // First negotiation is answered late — after its waiter gave up.
    assert!(!link.wait_for_config(150, &CancelToken::new()));
    link.on_transport_event(TransportEvent::Data {
        topic: "starling/07/config",
        payload: b"\"config-ok\"",
    });

    // The stale answer must not satisfy the second negotiation.
    let l = link.clone();
    let answered = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        l.on_transport_event(TransportEvent::Data {
            topic: "starling/07/config",
            payload: b"\"config-ok\"",
        });
    });
    assert!(link.wait_for_config(1000, &CancelToken::new()));
    answered.join().unwrap();
}
