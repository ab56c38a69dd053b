//! WiFi station adapter.
//!
//! Implements [`NetworkPort`]: blocking association bounded at 15 s,
//! then SNTP sync bounded at 15 s. Credentials are read from storage
//! once at startup into an immutable [`StationCredentials`] — no
//! global buffers with an implicit "storage was read first" contract.
//!
//! The simulation backend is flag-driven for host tests.

use core::fmt;

use heapless::String as FixedString;
use log::info;

use crate::app::ports::{keys, NetworkError, NetworkPort, StorageError, StoragePort};

/// Association and SNTP bounds.
#[cfg_attr(target_os = "espidf", allow(dead_code))]
const CONNECT_TIMEOUT_MS: u64 = 15_000;
#[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
const SNTP_TIMEOUT_MS: u64 = 15_000;

/// Immutable station credentials, constructed once at startup.
#[derive(Clone)]
pub struct StationCredentials {
    pub ssid: FixedString<32>,
    pub password: FixedString<64>,
}

impl fmt::Debug for StationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the password.
        f.debug_struct("StationCredentials")
            .field("ssid", &self.ssid.as_str())
            .finish_non_exhaustive()
    }
}

impl StationCredentials {
    pub fn from_storage(storage: &dyn StoragePort) -> Result<Self, StorageError> {
        let ssid_raw = storage.read_str(keys::SSID)?;
        let password_raw = storage.read_str(keys::PASSWORD)?;

        let mut ssid = FixedString::new();
        ssid.push_str(&ssid_raw).map_err(|()| StorageError::IoError)?;
        let mut password = FixedString::new();
        password
            .push_str(&password_raw)
            .map_err(|()| StorageError::IoError)?;

        Ok(Self { ssid, password })
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct WifiLink {
    credentials: StationCredentials,
    wifi: esp_idf_svc::wifi::BlockingWifi<esp_idf_svc::wifi::EspWifi<'static>>,
    sntp: Option<esp_idf_svc::sntp::EspSntp<'static>>,
}

#[cfg(target_os = "espidf")]
impl WifiLink {
    pub fn new(
        modem: esp_idf_svc::hal::modem::Modem,
        sys_loop: esp_idf_svc::eventloop::EspSystemEventLoop,
        credentials: StationCredentials,
    ) -> Result<Self, NetworkError> {
        let wifi = esp_idf_svc::wifi::EspWifi::new(modem, sys_loop.clone(), None)
            .map_err(|_| NetworkError::ConnectFailed)?;
        let wifi = esp_idf_svc::wifi::BlockingWifi::wrap(wifi, sys_loop)
            .map_err(|_| NetworkError::ConnectFailed)?;
        Ok(Self {
            credentials,
            wifi,
            sntp: None,
        })
    }
}

#[cfg(target_os = "espidf")]
impl NetworkPort for WifiLink {
    fn connect(&mut self) -> Result<(), NetworkError> {
        use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};

        let config = Configuration::Client(ClientConfiguration {
            ssid: self.credentials.ssid.clone(),
            password: self.credentials.password.clone(),
            auth_method: if self.credentials.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });

        self.wifi
            .set_configuration(&config)
            .map_err(|_| NetworkError::ConnectFailed)?;
        self.wifi.start().map_err(|_| NetworkError::ConnectFailed)?;

        info!("WiFi: waiting for connection...");
        self.wifi.connect().map_err(|e| {
            log::error!("WiFi: couldn't connect: {e}");
            NetworkError::ConnectFailed
        })?;
        self.wifi
            .wait_netif_up()
            .map_err(|_| NetworkError::ConnectFailed)?;
        info!("WiFi: connected");
        Ok(())
    }

    fn sync_time(&mut self) -> Result<(), NetworkError> {
        use esp_idf_svc::sntp::{EspSntp, SyncStatus};

        info!("WiFi: syncing time with NTP...");
        let sntp = EspSntp::new_default().map_err(|_| NetworkError::TimeSyncFailed)?;

        let deadline =
            std::time::Instant::now() + std::time::Duration::from_millis(SNTP_TIMEOUT_MS);
        while sntp.get_sync_status() != SyncStatus::Completed {
            if std::time::Instant::now() >= deadline {
                log::error!("WiFi: NTP sync timed out");
                return Err(NetworkError::TimeSyncFailed);
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        info!("WiFi: time synced");
        // Keep the SNTP service alive for the rest of the wake cycle.
        self.sntp = Some(sntp);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
pub struct WifiLink {
    credentials: StationCredentials,
    pub connect_succeeds: bool,
    pub sync_succeeds: bool,
    pub connect_calls: u32,
}

#[cfg(not(target_os = "espidf"))]
impl WifiLink {
    pub fn new(credentials: StationCredentials) -> Self {
        Self {
            credentials,
            connect_succeeds: true,
            sync_succeeds: true,
            connect_calls: 0,
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl NetworkPort for WifiLink {
    fn connect(&mut self) -> Result<(), NetworkError> {
        self.connect_calls += 1;
        info!(
            "WiFi (sim): connect to '{}' ({} ms bound)",
            self.credentials.ssid, CONNECT_TIMEOUT_MS
        );
        if self.connect_succeeds {
            Ok(())
        } else {
            Err(NetworkError::ConnectFailed)
        }
    }

    fn sync_time(&mut self) -> Result<(), NetworkError> {
        if self.sync_succeeds {
            Ok(())
        } else {
            Err(NetworkError::TimeSyncFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsStore;

    #[test]
    fn credentials_load_from_storage() {
        let mut nvs = NvsStore::new().unwrap();
        nvs.write(keys::SSID, b"nest-net").unwrap();
        nvs.write(keys::PASSWORD, b"hunter22").unwrap();

        let creds = StationCredentials::from_storage(&nvs).unwrap();
        assert_eq!(creds.ssid.as_str(), "nest-net");
        assert_eq!(creds.password.as_str(), "hunter22");
    }

    #[test]
    fn missing_credentials_are_an_error() {
        let nvs = NvsStore::new().unwrap();
        assert!(StationCredentials::from_storage(&nvs).is_err());
    }

    #[test]
    fn debug_format_hides_password() {
        let mut nvs = NvsStore::new().unwrap();
        nvs.write(keys::SSID, b"nest-net").unwrap();
        nvs.write(keys::PASSWORD, b"secret123").unwrap();
        let creds = StationCredentials::from_storage(&nvs).unwrap();
        let formatted = format!("{creds:?}");
        assert!(!formatted.contains("secret123"));
    }

    #[test]
    fn sim_link_reports_configured_failures() {
        let creds = StationCredentials {
            ssid: FixedString::new(),
            password: FixedString::new(),
        };
        let mut wifi = WifiLink::new(creds);
        wifi.connect_succeeds = false;
        assert_eq!(wifi.connect(), Err(NetworkError::ConnectFailed));
        assert_eq!(wifi.connect_calls, 1);
    }
}
