//! End-to-end capture duty cycle against a scripted broker.
//!
//! A responder thread plays the server side: it watches the sim
//! transport for the health report and the image header and feeds the
//! matching answers back through the transport callback — the same
//! path the real MQTT client uses.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use starlingcam::adapters::camera::SimCamera;
use starlingcam::adapters::wifi::{StationCredentials, WifiLink};
use starlingcam::app::capture::{CaptureApp, CaptureContext, CycleEnd};
use starlingcam::app::ports::{keys, StoragePort};
use starlingcam::app::CancelToken;
use starlingcam::config::CaptureSchedule;
use starlingcam::drivers::indicator::Pattern;
use starlingcam::error::Error;
use starlingcam::events::{Event, EventBroker};
use starlingcam::link::mqtt::SimTransport;
use starlingcam::link::{HandshakeClient, TopicSet, TransportEvent};
use starlingcam::sensors::SensorHub;

use crate::mock_ports::{MemStorage, MockClock, MockIndicator};

fn topics() -> TopicSet {
    TopicSet {
        config: "starling/config".into(),
        health_report: "starling/health".into(),
        image_ack: "starling/ack".into(),
        image: "starling/image".into(),
        log: "starling/log".into(),
    }
}

struct Rig {
    ctx: CaptureContext,
    link: Arc<HandshakeClient>,
    transport: Arc<SimTransport>,
    storage: Arc<Mutex<Box<dyn StoragePort>>>,
    schedule: Arc<Mutex<CaptureSchedule>>,
    indicator: Arc<MockIndicator>,
    clock: Arc<MockClock>,
}

/// Assemble a full capture context over the simulation backends.
/// `time_of_day` drives window resolution; the stored schedule is a
/// plain all-day window with a 40 s period unless a test overwrites
/// the `dynamic_config` key first.
fn make_rig(time_of_day: &str) -> Rig {
    let storage = MemStorage::shared();
    let schedule = Arc::new(Mutex::new(CaptureSchedule::new()));
    let clock = MockClock::new(time_of_day);
    let indicator = MockIndicator::new();

    let link = HandshakeClient::new(topics(), schedule.clone(), storage.clone());
    let transport = Arc::new(SimTransport::new());
    link.attach_transport(transport.clone());

    let credentials = StationCredentials {
        ssid: heapless::String::try_from("nest-net").unwrap(),
        password: heapless::String::try_from("hunter22").unwrap(),
    };

    // Budget = period(40 s) − uptime − overhead; pin uptime so waits
    // stay ~2 s and tests fail fast instead of hanging a full period.
    clock.set_uptime_ms(40_000 - 2_000 - 700);

    let ctx = CaptureContext {
        network: Box::new(WifiLink::new(credentials)),
        imaging: Box::new(SimCamera::new()),
        sensors: Box::new(SensorHub::new()),
        clock: clock.clone(),
        indicator: indicator.clone(),
        storage: storage.clone(),
        schedule: schedule.clone(),
        link: link.clone(),
        connect_transport: None,
    };

    Rig {
        ctx,
        link,
        transport,
        storage,
        schedule,
        indicator,
        clock,
    }
}

/// Server side of the handshake: answer the health report with
/// `config_answer`, answer the image header with its own timestamp.
fn spawn_responder(
    link: Arc<HandshakeClient>,
    transport: Arc<SimTransport>,
    config_answer: &'static str,
) {
    std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut config_answered = false;
        let mut ack_sent = false;

        while Instant::now() < deadline && !(config_answered && ack_sent) {
            if !config_answered && !transport.published_to("starling/health").is_empty() {
                link.on_transport_event(TransportEvent::Data {
                    topic: "starling/config",
                    payload: config_answer.as_bytes(),
                });
                config_answered = true;
            }

            if !ack_sent {
                // The image header is the first JSON object on the
                // image topic; echo its timestamp on the ack topic.
                if let Some(header) = transport.published_to("starling/image").first() {
                    let doc: Value = serde_json::from_slice(header).unwrap();
                    let token = doc["timestamp"].as_str().unwrap().to_string();
                    link.on_transport_event(TransportEvent::Data {
                        topic: "starling/ack",
                        payload: token.as_bytes(),
                    });
                    ack_sent = true;
                }
            }

            std::thread::sleep(Duration::from_millis(10));
        }
    });
}

// ── Full happy path ───────────────────────────────────────────

#[test]
fn full_cycle_reports_negotiates_captures_and_transmits() {
    let mut rig = make_rig("10:00:00");
    spawn_responder(rig.link.clone(), rig.transport.clone(), "\"config-ok\"");

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::NextPeriod), "got {end:?}");

    // Health report went out with the full document shape.
    let health = rig.transport.published_to("starling/health");
    assert_eq!(health.len(), 1);
    let doc: Value = serde_json::from_slice(&health[0]).unwrap();
    for key in [
        "timestamp",
        "configurationId",
        "period",
        "cpuTemp",
        "batteryCharge",
        "luminosity",
        "chargeCurrent",
    ] {
        assert!(doc.get(key).is_some(), "health report missing {key}");
    }

    // Header then payload on the image topic.
    let image_msgs = rig.transport.published_to("starling/image");
    assert_eq!(image_msgs.len(), 2, "expected header + payload");

    let header: Value = serde_json::from_slice(&image_msgs[0]).unwrap();
    assert_eq!(header["mode"], "grayscale");
    assert_eq!(header["size"].as_u64().unwrap() as usize, image_msgs[1].len());

    // The transmitted frame is the second capture: the first is the
    // stale-buffer flush (SimCamera stamps the ordinal in byte 0).
    assert_eq!(image_msgs[1][0], 2);

    assert!(rig.indicator.saw(Pattern::ConnectedBlink));
}

#[test]
fn promoted_config_is_used_for_the_rest_of_the_cycle() {
    let mut rig = make_rig("10:00:00");
    spawn_responder(
        rig.link.clone(),
        rig.transport.clone(),
        r#"{ "configurationId": "pushed-by-server",
             "windows": [ { "period": 45, "start": "00:00:00", "end": "23:59:59" } ] }"#,
    );

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::NextPeriod), "got {end:?}");

    let schedule = rig.schedule.lock().unwrap();
    assert_eq!(schedule.uuid(), "pushed-by-server");
    assert_eq!(schedule.period(), 45);
    drop(schedule);

    // And it was persisted before being promoted.
    assert!(rig.storage.lock().unwrap().exists(keys::DYNAMIC_CONFIG));
}

// ── Abort paths ───────────────────────────────────────────────

#[test]
fn sleep_window_skips_the_workflow_entirely() {
    let mut rig = make_rig("03:00:00");
    rig.storage
        .lock()
        .unwrap()
        .write(
            keys::DYNAMIC_CONFIG,
            br#"{ "configurationId": "night-sleeper",
                  "windows": [ { "period": -1, "start": "00:00:00", "end": "07:00:00" },
                               { "period": 30, "start": "07:00:01", "end": "23:59:59" } ] }"#,
        )
        .unwrap();

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::NextWindow), "got {end:?}");

    // Nothing was reported or transmitted this wake.
    assert!(rig.transport.published_to("starling/health").is_empty());
    assert!(rig.transport.published_to("starling/image").is_empty());
}

#[test]
fn config_timeout_aborts_to_next_period() {
    let mut rig = make_rig("10:00:00");
    // Nobody answers. Tighten the budget so the wait is short.
    rig.clock.set_uptime_ms(40_000 - 300 - 700);

    let start = Instant::now();
    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::NextPeriod), "got {end:?}");
    assert!(start.elapsed() < Duration::from_secs(3));

    // The header was never sent.
    assert!(rig.transport.published_to("starling/image").is_empty());
}

#[test]
fn missing_header_ack_withholds_the_image() {
    let mut rig = make_rig("10:00:00");
    rig.clock.set_uptime_ms(40_000 - 500 - 700);

    // Answer only the config step.
    let link = rig.link.clone();
    let transport = rig.transport.clone();
    std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if !transport.published_to("starling/health").is_empty() {
                link.on_transport_event(TransportEvent::Data {
                    topic: "starling/config",
                    payload: b"\"config-ok\"",
                });
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::NextPeriod), "got {end:?}");

    // Header only — the payload was withheld.
    assert_eq!(rig.transport.published_to("starling/image").len(), 1);
}

#[test]
fn publish_failure_aborts_the_cycle() {
    let mut rig = make_rig("10:00:00");
    rig.transport.set_fail_publish(true);

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::NextPeriod), "got {end:?}");
    assert!(rig.transport.published().is_empty());
}

#[test]
fn network_failure_is_a_fault() {
    let mut rig = make_rig("10:00:00");
    let credentials = StationCredentials {
        ssid: heapless::String::new(),
        password: heapless::String::new(),
    };
    let mut wifi = WifiLink::new(credentials);
    wifi.connect_succeeds = false;
    rig.ctx.network = Box::new(wifi);

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::Fault(Error::Network(_))), "got {end:?}");
}

#[test]
fn unsynced_clock_is_a_fault() {
    let mut rig = make_rig("10:00:00");
    rig.ctx.clock = MockClock::unsynced();

    let end = CaptureApp::run_cycle(&mut rig.ctx, &CancelToken::new());
    assert!(matches!(end, CycleEnd::Fault(Error::Init(_))), "got {end:?}");
}

// ── Cancellation ──────────────────────────────────────────────

#[test]
fn stop_cancels_a_waiting_cycle_without_a_terminal_event() {
    let rig = make_rig("10:00:00");
    let broker = Arc::new(EventBroker::new());
    let app = CaptureApp::new(broker.clone());

    // Nobody answers the config step; the cycle parks in the wait.
    app.start(rig.ctx);
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    app.stop();
    assert!(start.elapsed() < Duration::from_secs(1), "stop should not wait out the budget");

    // The stopped cycle must not have published a sleep event.
    assert!(!broker.process_next());
}

#[test]
fn stop_twice_is_a_no_op() {
    let rig = make_rig("10:00:00");
    let broker = Arc::new(EventBroker::new());
    let app = CaptureApp::new(broker);
    app.start(rig.ctx);
    std::thread::sleep(Duration::from_millis(100));
    app.stop();
    app.stop();
}

// ── Terminal events drive the dispatcher ──────────────────────

#[test]
fn completed_cycle_publishes_sleep_until_next_period() {
    let rig = make_rig("10:00:00");
    spawn_responder(rig.link.clone(), rig.transport.clone(), "\"config-ok\"");

    let broker = Arc::new(EventBroker::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        broker
            .subscribe(Event::SleepUntilNextPeriod, move |e| {
                seen.lock().unwrap().push(e);
            })
            .unwrap();
    }

    let app = CaptureApp::new(broker.clone());
    app.start(rig.ctx);

    // Drain until the terminal event lands (bounded by process_next's
    // own timeout).
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        broker.process_next();
    }
    assert_eq!(*seen.lock().unwrap(), vec![Event::SleepUntilNextPeriod]);
    app.stop();
}
