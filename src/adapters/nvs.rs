//! NVS (non-volatile storage) adapter.
//!
//! Single `starlingcam` namespace holding provisioning credentials,
//! broker topics, the dynamic schedule document and the failure
//! counter. Writes commit atomically (ESP-IDF NVS semantics); the
//! simulation backend is an in-memory map for host tests.
//!
//! Factory reset erases the whole flash partition, not just the
//! namespace — credentials must not survive a reset.

use log::info;

use crate::app::ports::{keys, StorageError, StoragePort};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const NAMESPACE: &str = "starlingcam";

/// NVS blob values are small documents and credential strings; cap
/// reads well below the partition page budget.
const MAX_BLOB_SIZE: usize = 4000;

pub struct NvsStore {
    #[cfg(not(target_os = "espidf"))]
    map: HashMap<String, Vec<u8>>,
}

impl NvsStore {
    /// Initialise NVS flash. On first boot or after a version
    /// mismatch the partition is erased and re-initialised.
    pub fn new() -> Result<Self, StorageError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: called once from the main task before any other
            // NVS access exists.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                log::warn!("NVS: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != ESP_OK {
                    return Err(StorageError::IoError);
                }
                if unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(StorageError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(StorageError::IoError);
            }
            info!("NvsStore: flash initialised");
            Ok(Self {})
        }

        #[cfg(not(target_os = "espidf"))]
        {
            info!("NvsStore: simulation backend");
            Ok(Self {
                map: HashMap::new(),
            })
        }
    }

    /// Open the namespace, run `f` with the handle, close it again.
    #[cfg(target_os = "espidf")]
    fn with_handle<F, T>(write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns = NAMESPACE.as_bytes();
        ns_buf[..ns.len()].copy_from_slice(ns);

        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let mut handle: nvs_handle_t = 0;
        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }

    /// NVS keys are limited to 15 characters plus the terminator.
    #[cfg(target_os = "espidf")]
    fn key_buf(key: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let kb = key.as_bytes();
        let len = kb.len().min(15);
        buf[..len].copy_from_slice(&kb[..len]);
        buf
    }
}

impl StoragePort for NvsStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map.get(key).cloned().ok_or(StorageError::NotFound)
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_handle(false, |handle| {
                let key_buf = Self::key_buf(key);
                let mut size: usize = 0;

                // First call sizes the blob.
                let ret = unsafe {
                    nvs_get_blob(
                        handle,
                        key_buf.as_ptr() as *const _,
                        core::ptr::null_mut(),
                        &mut size,
                    )
                };
                if ret != ESP_OK || size == 0 || size > MAX_BLOB_SIZE {
                    return Err(ret);
                }

                let mut buf = vec![0u8; size];
                let ret = unsafe {
                    nvs_get_blob(
                        handle,
                        key_buf.as_ptr() as *const _,
                        buf.as_mut_ptr() as *mut _,
                        &mut size,
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(buf)
            });
            result.map_err(|e| {
                if e == ESP_ERR_NVS_NOT_FOUND {
                    StorageError::NotFound
                } else {
                    StorageError::IoError
                }
            })
        }
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map.insert(key.to_string(), data.to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_handle(true, |handle| {
                let key_buf = Self::key_buf(key);
                let ret = unsafe {
                    nvs_set_blob(
                        handle,
                        key_buf.as_ptr() as *const _,
                        data.as_ptr() as *const _,
                        data.len(),
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|e| {
                if e == ESP_ERR_NVS_NOT_ENOUGH_SPACE {
                    StorageError::Full
                } else {
                    StorageError::IoError
                }
            })
        }
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map.remove(key);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_handle(true, |handle| {
                let key_buf = Self::key_buf(key);
                let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr() as *const _) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)
        }
    }

    fn exists(&self, key: &str) -> bool {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map.contains_key(key)
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(false, |handle| {
                let key_buf = Self::key_buf(key);
                let ret = unsafe {
                    nvs_find_key(handle, key_buf.as_ptr() as *const _, core::ptr::null_mut())
                };
                Ok(ret == ESP_OK)
            })
            .unwrap_or(false)
        }
    }

    fn read_failure_count(&self) -> u32 {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map
                .get(keys::ERROR_COUNT)
                .and_then(|b| b.as_slice().try_into().ok())
                .map(u32::from_le_bytes)
                .unwrap_or(0)
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(false, |handle| {
                let key_buf = Self::key_buf(keys::ERROR_COUNT);
                let mut value: u32 = 0;
                let ret = unsafe { nvs_get_u32(handle, key_buf.as_ptr() as *const _, &mut value) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(value)
            })
            .unwrap_or(0)
        }
    }

    fn write_failure_count(&mut self, count: u32) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map
                .insert(keys::ERROR_COUNT.to_string(), count.to_le_bytes().to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_handle(true, |handle| {
                let key_buf = Self::key_buf(keys::ERROR_COUNT);
                let ret = unsafe { nvs_set_u32(handle, key_buf.as_ptr() as *const _, count) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)
        }
    }

    fn erase_all(&mut self) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.map.clear();
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            log::warn!("NvsStore: erasing entire flash partition");
            if unsafe { nvs_flash_erase() } != ESP_OK {
                return Err(StorageError::IoError);
            }
            if unsafe { nvs_flash_init() } != ESP_OK {
                return Err(StorageError::IoError);
            }
            Ok(())
        }
    }
}
