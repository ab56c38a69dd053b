//! MQTT transport backends.
//!
//! - **`target_os = "espidf"`** — wraps `esp_idf_svc`'s MQTT client
//!   (MQTT 5, QoS 2) and forwards its event stream into
//!   [`HandshakeClient::on_transport_event`].
//! - **all other targets** — [`SimTransport`] records publishes and
//!   subscriptions for host-side tests.
//!
//! [`HandshakeClient::on_transport_event`]: super::HandshakeClient::on_transport_event

use super::{LinkError, Transport};

#[cfg(target_os = "espidf")]
pub use esp_impl::EspMqttLink;

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp_impl {
    use std::sync::{Arc, Mutex};

    use esp_idf_svc::mqtt::client::{
        EspMqttClient, EventPayload, MqttClientConfiguration, MqttProtocolVersion, QoS,
    };
    use log::{error, info, warn};

    use crate::link::{BrokerProfile, HandshakeClient, LinkError, Transport, TransportEvent};

    /// QoS for every protocol topic. Exactly-once matches the
    /// at-most-once local delivery contract: the transport retries,
    /// the application never sees duplicates.
    const QOS: QoS = QoS::ExactlyOnce;

    pub struct EspMqttLink {
        client: Mutex<EspMqttClient<'static>>,
    }

    impl EspMqttLink {
        /// Start the MQTT session and route its events into the
        /// handshake client. Call after the station is associated.
        pub fn start(
            profile: &BrokerProfile,
            handshake: Arc<HandshakeClient>,
        ) -> Result<Arc<Self>, LinkError> {
            let conf = MqttClientConfiguration {
                protocol_version: Some(MqttProtocolVersion::V5),
                username: Some(&profile.username),
                password: Some(&profile.password),
                ..Default::default()
            };

            let callback_handshake = handshake.clone();
            let client = EspMqttClient::new_cb(&profile.uri, &conf, move |event| {
                let handshake = &callback_handshake;
                match event.payload() {
                    EventPayload::Connected(_) => {
                        handshake.on_transport_event(TransportEvent::Connected);
                    }
                    EventPayload::Disconnected => {
                        handshake.on_transport_event(TransportEvent::Disconnected);
                    }
                    EventPayload::Received { topic, data, .. } => {
                        if let Some(topic) = topic {
                            handshake.on_transport_event(TransportEvent::Data {
                                topic,
                                payload: data,
                            });
                        } else {
                            // Fragmented delivery carries no topic; the
                            // protocol's payloads all fit one frame.
                            warn!("MQTT: dropping fragmented message");
                        }
                    }
                    EventPayload::Error(e) => {
                        error!("MQTT: transport error: {e:?}");
                        handshake.on_transport_event(TransportEvent::Error);
                    }
                    _ => {}
                }
            })
            .map_err(|e| {
                error!("MQTT: client start failed: {e}");
                LinkError::NotConnected
            })?;

            info!("MQTT: client started for {}", profile.uri);
            let link = Arc::new(Self {
                client: Mutex::new(client),
            });
            // Attach before returning so a fast Connected event finds
            // the transport in place for its topic subscriptions.
            handshake.attach_transport(link.clone());
            Ok(link)
        }
    }

    impl Transport for EspMqttLink {
        fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
            self.client
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .enqueue(topic, QOS, false, payload)
                .map(|_| ())
                .map_err(|e| {
                    error!("MQTT: publish to {topic} failed: {e}");
                    LinkError::PublishFailed
                })
        }

        fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
            self.client
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .subscribe(topic, QOS)
                .map(|_| ())
                .map_err(|e| {
                    error!("MQTT: subscribe to {topic} failed: {e}");
                    LinkError::SubscribeFailed
                })
        }

        fn reconnect(&self) -> Result<(), LinkError> {
            // esp-mqtt re-establishes the session itself; this hook
            // exists for transports without that behaviour.
            warn!("MQTT: waiting for automatic session re-establishment");
            Ok(())
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Recording transport for host-side tests: remembers every publish
/// and subscription, and can be told to fail sends.
pub struct SimTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscribed: Mutex<Vec<String>>,
    reconnects: Mutex<u32>,
    fail_publish: AtomicBool,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            reconnects: Mutex::new(0),
            fail_publish: AtomicBool::new(false),
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Relaxed);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads published to one topic, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn reconnect_count(&self) -> u32 {
        *self.reconnects.lock().unwrap()
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(LinkError::PublishFailed);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    fn reconnect(&self) -> Result<(), LinkError> {
        *self.reconnects.lock().unwrap() += 1;
        Ok(())
    }
}
