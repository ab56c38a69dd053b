//! QR provisioning flow.
//!
//! A factory-fresh (or factory-reset) device knows nothing. The
//! operator shows it a QR code containing `ssid|password|server-url`;
//! the device then:
//!
//! 1. captures frames until a code decodes,
//! 2. persists the credentials,
//! 3. joins the network,
//! 4. fetches its static configuration (broker address, credentials,
//!    topic names) from the provisioning server over HTTPS,
//! 5. persists it, flips the boot mode to capture, and restarts.
//!
//! Decode failures just keep the frame loop going; network and server
//! failures escalate through the restart ladder like any other
//! bring-up failure.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::Value;

use crate::app::ports::{
    keys, ImagingPort, IndicatorPort, NetworkPort, ProvisioningServerPort, QrPort, StoragePort,
};
use crate::app::CancelToken;
use crate::drivers::indicator::Pattern;
use crate::error::Error;
use crate::events::{Event, EventBroker};
use crate::power;

const PROVISIONING_TASK_PRIORITY: u8 = 5;
const PROVISIONING_TASK_STACK_KB: usize = 24;

/// Pause between capture attempts while hunting for a code.
const FRAME_INTERVAL_MS: u64 = 500;

/// Keys the server's static configuration document must carry, each a
/// string, persisted under the same name.
const STATIC_CONFIG_KEYS: [&str; 8] = [
    keys::MQTT_ADDRESS,
    keys::MQTT_USER,
    keys::MQTT_PASSWORD,
    keys::CONFIG_TOPIC,
    keys::HEALTH_TOPIC,
    keys::IMAGE_ACK_TOPIC,
    keys::IMAGE_TOPIC,
    keys::LOG_TOPIC,
];

// ---------------------------------------------------------------------------
// QR payload
// ---------------------------------------------------------------------------

/// Credentials decoded from the onboarding QR code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCredentials {
    pub ssid: String,
    pub password: String,
    pub server_url: String,
}

impl QrCredentials {
    /// Parse the `ssid|password|server-url` payload. The password may
    /// be empty (open network); ssid and server must not be.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.splitn(3, '|');
        let ssid = parts.next()?;
        let password = parts.next()?;
        let server_url = parts.next()?;
        if ssid.is_empty() || server_url.is_empty() {
            return None;
        }
        Some(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            server_url: server_url.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Context and app
// ---------------------------------------------------------------------------

pub struct ProvisioningContext {
    pub imaging: Box<dyn ImagingPort>,
    pub qr: Box<dyn QrPort>,
    pub network: Box<dyn NetworkPort>,
    pub server: Box<dyn ProvisioningServerPort>,
    pub storage: Arc<Mutex<Box<dyn StoragePort>>>,
    pub indicator: Arc<dyn IndicatorPort>,
}

pub struct ProvisioningApp {
    broker: Arc<EventBroker>,
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProvisioningApp {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self {
            broker,
            cancel: CancelToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self, ctx: ProvisioningContext) {
        let broker = self.broker.clone();
        let cancel = self.cancel.clone();

        let handle = crate::drivers::task_spawn::spawn(
            "provisioning\0",
            PROVISIONING_TASK_PRIORITY,
            PROVISIONING_TASK_STACK_KB,
            move || {
                let mut ctx = ctx;
                match Self::run(&mut ctx, &cancel) {
                    Ok(true) => {
                        info!("Provisioning complete, restarting into capture mode");
                        broker.publish(Event::StopInput);
                        power::restart();
                    }
                    Ok(false) => {
                        info!("Provisioning stopped from outside");
                    }
                    Err(e) => {
                        error!("Provisioning failed: {e}");
                        ctx.indicator.set_pattern(Pattern::ErrorBlink);
                        let action = {
                            let mut storage =
                                ctx.storage.lock().unwrap_or_else(|p| p.into_inner());
                            power::escalate(storage.as_mut())
                        };
                        power::apply_escalation(action);
                    }
                }
            },
        );
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Cancel the flow and wait for the task. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Provisioning task panicked before stop");
            }
            info!("Stopped provisioning task");
        }
    }

    // -----------------------------------------------------------------------
    // Flow (host-testable)
    // -----------------------------------------------------------------------

    /// Run the onboarding flow. `Ok(true)` means fully provisioned,
    /// `Ok(false)` means cancelled.
    pub fn run(ctx: &mut ProvisioningContext, cancel: &CancelToken) -> Result<bool, Error> {
        ctx.imaging.start()?;

        let Some(credentials) = Self::hunt_qr_code(ctx, cancel)? else {
            return Ok(false);
        };
        info!("QR decoded: ssid '{}'", credentials.ssid);

        {
            let mut storage = ctx.storage.lock().unwrap_or_else(|p| p.into_inner());
            storage.write(keys::SSID, credentials.ssid.as_bytes())?;
            storage.write(keys::PASSWORD, credentials.password.as_bytes())?;
            storage.write(keys::SERVER_URL, credentials.server_url.as_bytes())?;
        }

        ctx.network.connect()?;

        let doc = ctx.server.fetch_config(&credentials.server_url)?;
        Self::apply_static_config(ctx, &doc)?;

        ctx.indicator.set_pattern(Pattern::ConfigSavedBlink);
        Ok(true)
    }

    /// Capture-and-decode loop; runs until a payload parses, the flow
    /// is cancelled, or the camera fails.
    fn hunt_qr_code(
        ctx: &mut ProvisioningContext,
        cancel: &CancelToken,
    ) -> Result<Option<QrCredentials>, Error> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            ctx.imaging.capture()?;
            let decoded = {
                let frame = ctx.imaging.frame()?;
                ctx.qr.decode(frame.bytes, frame.width, frame.height)
            };
            ctx.imaging.release_frame();

            if let Some(payload) = decoded {
                match QrCredentials::parse(&payload) {
                    Some(credentials) => return Ok(Some(credentials)),
                    None => warn!("QR payload did not contain the expected delimiters"),
                }
            }

            std::thread::sleep(Duration::from_millis(FRAME_INTERVAL_MS));
        }
    }

    /// Persist the server's static configuration and flip the boot
    /// mode. Every expected key must be present as a string; nothing
    /// is written until the whole document checks out.
    fn apply_static_config(ctx: &mut ProvisioningContext, doc: &Value) -> Result<(), Error> {
        let mut values = Vec::with_capacity(STATIC_CONFIG_KEYS.len());
        for key in STATIC_CONFIG_KEYS {
            let value = doc.get(key).and_then(Value::as_str).ok_or_else(|| {
                error!("Static config is missing '{key}'");
                Error::Server(crate::app::ports::ServerError::MalformedResponse)
            })?;
            values.push((key, value));
        }

        let mut storage = ctx.storage.lock().unwrap_or_else(|p| p.into_inner());
        for (key, value) in values {
            storage.write(key, value.as_bytes())?;
        }
        storage.write(keys::MODE, b"cam")?;
        info!("Static configuration saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_parses_three_fields() {
        let c = QrCredentials::parse("nest-net|hunter22|https://cfg.example/dev42").unwrap();
        assert_eq!(c.ssid, "nest-net");
        assert_eq!(c.password, "hunter22");
        assert_eq!(c.server_url, "https://cfg.example/dev42");
    }

    #[test]
    fn open_network_password_may_be_empty() {
        let c = QrCredentials::parse("nest-net||https://cfg.example").unwrap();
        assert_eq!(c.password, "");
    }

    #[test]
    fn url_may_contain_further_pipes() {
        let c = QrCredentials::parse("a|b|https://cfg.example/x|y").unwrap();
        assert_eq!(c.server_url, "https://cfg.example/x|y");
    }

    #[test]
    fn missing_delimiters_reject() {
        assert!(QrCredentials::parse("just-an-ssid").is_none());
        assert!(QrCredentials::parse("ssid|password").is_none());
    }

    #[test]
    fn empty_ssid_or_server_rejects() {
        assert!(QrCredentials::parse("|pw|https://cfg.example").is_none());
        assert!(QrCredentials::parse("ssid|pw|").is_none());
    }
}
