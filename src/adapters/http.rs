//! Provisioning server HTTP client.
//!
//! One HTTPS GET fetches the device's static configuration (broker
//! address, credentials, topic names) after QR onboarding. An HTTP
//! 400 means the device's id is not registered with the server —
//! surfaced as its own error because the operator can fix it without
//! touching the device.

use crate::app::ports::{ProvisioningServerPort, ServerError};

#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const REQUEST_TIMEOUT_MS: u64 = 15_000;

#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const MAX_RESPONSE_BYTES: usize = 4096;

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct HttpConfigClient;

#[cfg(target_os = "espidf")]
impl HttpConfigClient {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "espidf")]
impl ProvisioningServerPort for HttpConfigClient {
    fn fetch_config(&mut self, url: &str) -> Result<serde_json::Value, ServerError> {
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
        use esp_idf_svc::http::Method;
        use log::{error, info};

        let mut conn = EspHttpConnection::new(&Configuration {
            timeout: Some(std::time::Duration::from_millis(REQUEST_TIMEOUT_MS)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(|_| ServerError::RequestFailed)?;

        conn.initiate_request(Method::Get, url, &[])
            .map_err(|e| {
                error!("HTTP: request failed: {e}");
                ServerError::RequestFailed
            })?;
        conn.initiate_response()
            .map_err(|_| ServerError::RequestFailed)?;

        let status = conn.status();
        if status == 400 {
            error!("HTTP: server returned 400 - device not registered");
            return Err(ServerError::NotRegistered);
        }
        if !(200..300).contains(&status) {
            error!("HTTP: unexpected status {status}");
            return Err(ServerError::RequestFailed);
        }

        let mut body = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let read = conn.read(&mut chunk).map_err(|_| ServerError::RequestFailed)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_RESPONSE_BYTES {
                error!("HTTP: response exceeds {MAX_RESPONSE_BYTES} bytes");
                return Err(ServerError::MalformedResponse);
            }
            body.extend_from_slice(&chunk[..read]);
        }

        info!("HTTP: received {} config bytes", body.len());
        serde_json::from_slice(&body).map_err(|e| {
            error!("HTTP: failed to parse config JSON: {e}");
            ServerError::MalformedResponse
        })
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

/// Scripted provisioning server for host tests.
pub struct SimConfigServer {
    pub response: Result<serde_json::Value, ServerError>,
    pub requested_urls: Vec<String>,
}

impl SimConfigServer {
    pub fn new(response: Result<serde_json::Value, ServerError>) -> Self {
        Self {
            response,
            requested_urls: Vec::new(),
        }
    }
}

impl ProvisioningServerPort for SimConfigServer {
    fn fetch_config(&mut self, url: &str) -> Result<serde_json::Value, ServerError> {
        self.requested_urls.push(url.to_string());
        self.response.clone()
    }
}
