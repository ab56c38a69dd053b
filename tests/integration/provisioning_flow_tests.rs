//! QR onboarding flow against scripted decoder and server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use starlingcam::adapters::camera::SimCamera;
use starlingcam::adapters::http::SimConfigServer;
use starlingcam::adapters::wifi::{StationCredentials, WifiLink};
use starlingcam::app::ports::{keys, ServerError};
use starlingcam::app::provisioning::{ProvisioningApp, ProvisioningContext};
use starlingcam::app::CancelToken;
use starlingcam::drivers::indicator::Pattern;
use starlingcam::error::Error;

use crate::mock_ports::{MemStorage, MockIndicator, ScriptedQr};

fn empty_credentials() -> StationCredentials {
    StationCredentials {
        ssid: heapless::String::new(),
        password: heapless::String::new(),
    }
}

fn server_doc() -> serde_json::Value {
    json!({
        "mqttAddress": "mqtts://broker.example:8883",
        "mqttUser": "capture-node-07",
        "mqttPassword": "s3cret",
        "configTopic": "starling/07/config",
        "healthRepTopic": "starling/07/health",
        "imageAckTopic": "starling/07/ack",
        "imageTopic": "starling/07/image",
        "logTopic": "starling/07/log"
    })
}

fn make_ctx(
    qr: ScriptedQr,
    server: SimConfigServer,
) -> (ProvisioningContext, Arc<MockIndicator>, Arc<std::sync::Mutex<Box<dyn starlingcam::app::ports::StoragePort>>>) {
    let storage = MemStorage::shared();
    let indicator = MockIndicator::new();
    let ctx = ProvisioningContext {
        imaging: Box::new(SimCamera::new()),
        qr: Box::new(qr),
        network: Box::new(WifiLink::new(empty_credentials())),
        server: Box::new(server),
        storage: storage.clone(),
        indicator: indicator.clone(),
    };
    (ctx, indicator, storage)
}

#[test]
fn full_onboarding_persists_credentials_and_static_config() {
    let qr = ScriptedQr::new(2, "nest-net|hunter22|https://cfg.example/dev07");
    let server = SimConfigServer::new(Ok(server_doc()));
    let (mut ctx, indicator, storage) = make_ctx(qr, server);

    let done = ProvisioningApp::run(&mut ctx, &CancelToken::new()).unwrap();
    assert!(done);

    let guard = storage.lock().unwrap();
    assert_eq!(guard.read_str(keys::SSID).unwrap(), "nest-net");
    assert_eq!(guard.read_str(keys::PASSWORD).unwrap(), "hunter22");
    assert_eq!(
        guard.read_str(keys::SERVER_URL).unwrap(),
        "https://cfg.example/dev07"
    );
    assert_eq!(
        guard.read_str(keys::MQTT_ADDRESS).unwrap(),
        "mqtts://broker.example:8883"
    );
    assert_eq!(guard.read_str(keys::IMAGE_ACK_TOPIC).unwrap(), "starling/07/ack");
    assert_eq!(guard.read_str(keys::MODE).unwrap(), "cam");
    drop(guard);

    assert!(indicator.saw(Pattern::ConfigSavedBlink));
}

#[test]
fn incomplete_server_document_fails_without_flipping_mode() {
    let qr = ScriptedQr::new(0, "nest-net|hunter22|https://cfg.example/dev07");
    let mut doc = server_doc();
    doc.as_object_mut().unwrap().remove(keys::IMAGE_TOPIC);
    let server = SimConfigServer::new(Ok(doc));
    let (mut ctx, _, storage) = make_ctx(qr, server);

    let err = ProvisioningApp::run(&mut ctx, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Server(ServerError::MalformedResponse)));

    let guard = storage.lock().unwrap();
    // Credentials were taken, but the boot mode must not change and
    // no partial broker profile may land.
    assert!(!guard.exists(keys::MODE));
    assert!(!guard.exists(keys::MQTT_ADDRESS));
}

#[test]
fn unregistered_device_error_propagates() {
    let qr = ScriptedQr::new(0, "nest-net|hunter22|https://cfg.example/dev07");
    let server = SimConfigServer::new(Err(ServerError::NotRegistered));
    let (mut ctx, _, _) = make_ctx(qr, server);

    let err = ProvisioningApp::run(&mut ctx, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Server(ServerError::NotRegistered)));
}

#[test]
fn undecodable_frames_keep_looping_until_cancelled() {
    let (mut ctx, _, _) = make_ctx(ScriptedQr::blind(), SimConfigServer::new(Ok(server_doc())));

    let cancel = CancelToken::new();
    let c = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        c.cancel();
    });

    let start = Instant::now();
    let done = ProvisioningApp::run(&mut ctx, &cancel).unwrap();
    assert!(!done, "cancelled hunt must not report success");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn malformed_qr_payload_is_skipped_not_fatal() {
    // First decode yields garbage, second a valid payload.
    struct TwoPhaseQr {
        calls: u32,
    }
    impl starlingcam::app::ports::QrPort for TwoPhaseQr {
        fn decode(&mut self, _f: &[u8], _w: u32, _h: u32) -> Option<String> {
            self.calls += 1;
            match self.calls {
                1 => Some("no-delimiters-here".to_string()),
                _ => Some("nest-net|pw|https://cfg.example".to_string()),
            }
        }
    }

    let storage = MemStorage::shared();
    let mut ctx = ProvisioningContext {
        imaging: Box::new(SimCamera::new()),
        qr: Box::new(TwoPhaseQr { calls: 0 }),
        network: Box::new(WifiLink::new(empty_credentials())),
        server: Box::new(SimConfigServer::new(Ok(server_doc()))),
        storage: storage.clone(),
        indicator: MockIndicator::new(),
    };

    let done = ProvisioningApp::run(&mut ctx, &CancelToken::new()).unwrap();
    assert!(done);
    assert_eq!(storage.lock().unwrap().read_str(keys::SSID).unwrap(), "nest-net");
}
