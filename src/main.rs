//! Starlingcam firmware — main entry point.
//!
//! ```text
//! ISR ─▶ button mailbox ─▶ button task ──┐
//!                                        ▼
//! capture task ──▶ Event Broker ──▶ dispatch loop
//!      ▲                                 │
//!      └── handshake client ◀── MQTT     ├─ stop tasks
//!                                        ├─ sleep policy (timer / pin wake)
//!                                        └─ factory reset
//! ```
//!
//! Boot mode comes from storage: `"cam"` runs one capture duty cycle,
//! anything else runs QR provisioning. Either way the main task ends
//! up in the dispatch loop, and every path out of it is a deep sleep
//! or a restart.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use esp_idf_svc::hal::gpio::{IOPin, OutputPin};
use log::{info, warn};

use starlingcam::adapters::camera::OvCamera;
use starlingcam::adapters::http::HttpConfigClient;
use starlingcam::adapters::nvs::NvsStore;
use starlingcam::adapters::time::SystemClock;
use starlingcam::adapters::wifi::{StationCredentials, WifiLink};
use starlingcam::app::capture::{CaptureApp, CaptureContext};
use starlingcam::app::ports::{
    keys, ClockPort, IndicatorPort, QrPort, StoragePort,
};
use starlingcam::app::provisioning::{ProvisioningApp, ProvisioningContext};
use starlingcam::config::CaptureSchedule;
use starlingcam::drivers::button::ButtonInput;
use starlingcam::drivers::indicator::{Indicator, Pattern};
use starlingcam::events::{Event, EventBroker};
use starlingcam::link::mqtt::EspMqttLink;
use starlingcam::link::{BrokerProfile, HandshakeClient, Transport};
use starlingcam::power::{self, SleepTarget, WakeSource};
use starlingcam::sensors::SensorHub;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("starlingcam v{}", env!("CARGO_PKG_VERSION"));

    let peripherals = esp_idf_svc::hal::peripherals::Peripherals::take()?;
    let sys_loop = esp_idf_svc::eventloop::EspSystemEventLoop::take()?;

    let storage: Arc<Mutex<Box<dyn StoragePort>>> = Arc::new(Mutex::new(Box::new(
        NvsStore::new().map_err(|e| anyhow::anyhow!("NVS init failed: {e}"))?,
    )));

    let mode = storage
        .lock()
        .unwrap()
        .read_str(keys::MODE)
        .unwrap_or_default();

    let broker = Arc::new(EventBroker::new());
    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());

    let indicator = Arc::new(Indicator::start(peripherals.pins.gpio21.downgrade_output()));

    let button = Arc::new(ButtonInput::new(broker.clone()));
    button.start_on_gpio(peripherals.pins.gpio48.downgrade());

    if mode == "cam" {
        info!("Starting the starling detection mode");
        indicator.set_pattern(Pattern::On);
        run_capture_mode(
            broker,
            storage,
            clock,
            indicator,
            button,
            peripherals.modem,
            sys_loop,
        );
    } else {
        info!("Starting the QR provisioning mode");
        indicator.set_pattern(Pattern::SearchingBlink);
        run_provisioning_mode(
            broker,
            storage,
            indicator,
            button,
            peripherals.modem,
            sys_loop,
        );
    }
}

/// Capture mode: wire the duty cycle, subscribe the terminal
/// handlers, run the dispatch loop.
fn run_capture_mode(
    broker: Arc<EventBroker>,
    storage: Arc<Mutex<Box<dyn StoragePort>>>,
    clock: Arc<dyn ClockPort>,
    indicator: Arc<Indicator>,
    button: Arc<ButtonInput>,
    modem: esp_idf_svc::hal::modem::Modem,
    sys_loop: esp_idf_svc::eventloop::EspSystemEventLoop,
) -> ! {
    let schedule = Arc::new(Mutex::new(CaptureSchedule::new()));

    let profile = {
        let guard = storage.lock().unwrap();
        match BrokerProfile::from_storage(&**guard) {
            Ok(profile) => profile,
            Err(e) => {
                // Unprovisioned or corrupted: only the ladder helps.
                log::error!("Failed to read broker profile from storage: {e}");
                drop(guard);
                let action = power::escalate(storage.lock().unwrap().as_mut());
                power::apply_escalation(action);
            }
        }
    };

    let credentials = {
        let guard = storage.lock().unwrap();
        match StationCredentials::from_storage(&**guard) {
            Ok(credentials) => credentials,
            Err(e) => {
                log::error!("Failed to read WiFi credentials from storage: {e}");
                drop(guard);
                let action = power::escalate(storage.lock().unwrap().as_mut());
                power::apply_escalation(action);
            }
        }
    };

    let link = HandshakeClient::new(profile.topics.clone(), schedule.clone(), storage.clone());
    {
        let storage = storage.clone();
        link.set_escalation_hook(move || {
            let action = power::escalate(storage.lock().unwrap().as_mut());
            power::apply_escalation(action);
        });
    }

    let app = Arc::new(CaptureApp::new(broker.clone()));

    // -- Terminal event handlers --------------------------------------

    {
        let app = app.clone();
        broker
            .subscribe(Event::InputPressed, move |_| app.stop())
            .expect("broker registry available at startup");
    }
    {
        let (button, indicator) = (button.clone(), indicator.clone());
        let (schedule, clock, storage) = (schedule.clone(), clock.clone(), storage.clone());
        broker
            .subscribe(Event::SleepUntilNextPeriod, move |_| {
                warn!("Device going to sleep until next period");
                button.stop();
                indicator.stop();
                let period = schedule.lock().unwrap().period().max(0) as u64;
                sleep_or_escalate(SleepTarget::For(period), &clock, &storage);
            })
            .expect("broker registry available at startup");
    }
    {
        let (button, indicator) = (button.clone(), indicator.clone());
        let (schedule, clock, storage) = (schedule.clone(), clock.clone(), storage.clone());
        broker
            .subscribe(Event::SleepUntilNextWindow, move |_| {
                warn!("Device going to sleep until next window");
                button.stop();
                indicator.stop();
                let window_end = schedule.lock().unwrap().active_window().end;
                sleep_or_escalate(SleepTarget::Until(window_end), &clock, &storage);
            })
            .expect("broker registry available at startup");
    }
    {
        let indicator = indicator.clone();
        broker
            .subscribe(Event::SleepUntilInput, move |_| {
                warn!("Device going to sleep until button press");
                indicator.stop();
                power::enter_deep_sleep(WakeSource::ButtonEdge);
            })
            .expect("broker registry available at startup");
    }
    {
        let (indicator, storage) = (indicator.clone(), storage.clone());
        broker
            .subscribe(Event::Reset, move |_| {
                indicator.stop();
                power::factory_reset(storage.lock().unwrap().as_mut());
            })
            .expect("broker registry available at startup");
    }

    // -- Launch the cycle ---------------------------------------------

    let connect_link = {
        let link = link.clone();
        let profile = profile.clone();
        Box::new(move || {
            EspMqttLink::start(&profile, link).map(|t| t as Arc<dyn Transport>)
        })
    };

    let wifi = match WifiLink::new(modem, sys_loop, credentials) {
        Ok(wifi) => wifi,
        Err(e) => {
            log::error!("WiFi stack init failed: {e}");
            let action = power::escalate(storage.lock().unwrap().as_mut());
            power::apply_escalation(action);
        }
    };

    app.start(CaptureContext {
        network: Box::new(wifi),
        imaging: Box::new(OvCamera::new()),
        sensors: Box::new(SensorHub::new()),
        clock,
        indicator,
        storage,
        schedule,
        link,
        connect_transport: Some(connect_link),
    });

    dispatch_forever(&broker);
}

/// Provisioning mode: QR onboarding, then restart into capture mode.
fn run_provisioning_mode(
    broker: Arc<EventBroker>,
    storage: Arc<Mutex<Box<dyn StoragePort>>>,
    indicator: Arc<Indicator>,
    button: Arc<ButtonInput>,
    modem: esp_idf_svc::hal::modem::Modem,
    sys_loop: esp_idf_svc::eventloop::EspSystemEventLoop,
) -> ! {
    let app = Arc::new(ProvisioningApp::new(broker.clone()));

    {
        let app = app.clone();
        broker
            .subscribe(Event::InputPressed, move |_| app.stop())
            .expect("broker registry available at startup");
    }
    {
        let button = button.clone();
        broker
            .subscribe(Event::StopInput, move |_| button.stop())
            .expect("broker registry available at startup");
    }
    {
        let indicator = indicator.clone();
        broker
            .subscribe(Event::SleepUntilInput, move |_| {
                warn!("Device going to sleep until button press");
                indicator.stop();
                power::enter_deep_sleep(WakeSource::ButtonEdge);
            })
            .expect("broker registry available at startup");
    }
    {
        let (indicator, storage) = (indicator.clone(), storage.clone());
        broker
            .subscribe(Event::Reset, move |_| {
                indicator.stop();
                power::factory_reset(storage.lock().unwrap().as_mut());
            })
            .expect("broker registry available at startup");
    }

    let credentials = StationCredentials::from_storage(&**storage.lock().unwrap())
        .unwrap_or_else(|_| {
            // First boot: the QR flow writes these before connecting.
            StationCredentials {
                ssid: heapless::String::new(),
                password: heapless::String::new(),
            }
        });

    let wifi = match WifiLink::new(modem, sys_loop, credentials) {
        Ok(wifi) => wifi,
        Err(e) => {
            log::error!("WiFi stack init failed: {e}");
            let action = power::escalate(storage.lock().unwrap().as_mut());
            power::apply_escalation(action);
        }
    };

    app.start(ProvisioningContext {
        imaging: Box::new(OvCamera::new()),
        qr: Box::new(QuircDecoder::new()),
        network: Box::new(wifi),
        server: Box::new(HttpConfigClient::new()),
        storage,
        indicator,
    });

    dispatch_forever(&broker);
}

/// The single authoritative dispatcher. `process_next` returning
/// `false` is just the heartbeat timeout.
fn dispatch_forever(broker: &EventBroker) -> ! {
    info!("Entering event dispatch loop");
    loop {
        broker.process_next();
    }
}

/// Plan and enter a timer-wake deep sleep; a below-minimum plan is a
/// configuration error and climbs the ladder instead.
fn sleep_or_escalate(
    target: SleepTarget,
    clock: &Arc<dyn ClockPort>,
    storage: &Arc<Mutex<Box<dyn StoragePort>>>,
) -> ! {
    let now = clock.time_of_day().unwrap_or_else(|| {
        // Unsynced clock this late in the cycle means time sync was
        // lost; treat midnight as "now" and let the plan bound it.
        starlingcam::config::TimeOfDay::new(0, 0, 0).unwrap()
    });

    match power::plan_sleep(target, now, clock.uptime_us()) {
        Ok(duration_us) => power::enter_deep_sleep(WakeSource::Timer { duration_us }),
        Err(e) => {
            log::error!("Sleep planning failed: {e}");
            let action = power::escalate(storage.lock().unwrap().as_mut());
            power::apply_escalation(action);
        }
    }
}

// ---------------------------------------------------------------------------
// QR decoder binding
// ---------------------------------------------------------------------------

/// quirc-based QR decoder (the `espressif/quirc` component, bound via
/// esp-idf-sys); kept behind [`QrPort`] so the provisioning flow stays
/// host-testable.
struct QuircDecoder;

impl QuircDecoder {
    fn new() -> Self {
        Self
    }

    /// # Safety
    ///
    /// `qr` must be a live handle from `quirc_new`.
    unsafe fn decode_with(
        qr: *mut esp_idf_svc::sys::quirc,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Option<String> {
        use esp_idf_svc::sys;

        unsafe {
            if sys::quirc_resize(qr, width as i32, height as i32) < 0 {
                return None;
            }
            let mut w = 0i32;
            let mut h = 0i32;
            let buf = sys::quirc_begin(qr, &mut w, &mut h);
            if buf.is_null() || w as u32 != width || h as u32 != height {
                sys::quirc_end(qr);
                return None;
            }
            core::ptr::copy_nonoverlapping(frame.as_ptr(), buf, (w * h) as usize);
            sys::quirc_end(qr);

            for i in 0..sys::quirc_count(qr) {
                let mut code: sys::quirc_code = core::mem::zeroed();
                let mut data: sys::quirc_data = core::mem::zeroed();
                sys::quirc_extract(qr, i, &mut code);
                sys::quirc_flip(&mut code);
                if sys::quirc_decode(&code, &mut data) == 0 {
                    let payload = &data.payload[..data.payload_len as usize];
                    if let Ok(text) = core::str::from_utf8(payload) {
                        return Some(text.to_string());
                    }
                }
            }
            None
        }
    }
}

impl QrPort for QuircDecoder {
    fn decode(&mut self, frame: &[u8], width: u32, height: u32) -> Option<String> {
        use esp_idf_svc::sys;

        unsafe {
            let qr = sys::quirc_new();
            if qr.is_null() {
                return None;
            }
            let result = Self::decode_with(qr, frame, width, height);
            sys::quirc_destroy(qr);
            result
        }
    }
}
