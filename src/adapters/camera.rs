//! Camera adapter.
//!
//! - **`target_os = "espidf"`** — binds the `espressif/esp32-camera`
//!   component (OV5640, grayscale VGA) through the generated sys
//!   bindings; see `[package.metadata.esp-idf-sys]` in Cargo.toml.
//! - **all other targets** — [`SimCamera`] produces a deterministic
//!   gradient frame so the full transmit path runs in host tests.
//!
//! The driver may hold one frame queued behind the most recent
//! acquisition request; the workflow flushes one stale capture before
//! the capture it transmits.

use crate::app::ports::{Frame, ImagingError, ImagingPort};

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use esp_impl::OvCamera;

#[cfg(target_os = "espidf")]
mod esp_impl {
    use super::{Frame, ImagingError, ImagingPort};
    use esp_idf_svc::sys;
    use log::{error, info};

    pub struct OvCamera {
        fb: *mut sys::camera_fb_t,
        started: bool,
    }

    // SAFETY: the frame-buffer pointer is only touched from the
    // capture task that owns this adapter.
    unsafe impl Send for OvCamera {}

    impl OvCamera {
        pub fn new() -> Self {
            Self {
                fb: core::ptr::null_mut(),
                started: false,
            }
        }

        fn camera_config() -> sys::camera_config_t {
            use crate::pins;
            // Grayscale VGA keeps a full frame under one MQTT payload.
            let mut config: sys::camera_config_t = unsafe { core::mem::zeroed() };
            config.pin_pwdn = pins::CAM_PIN_PWDN;
            config.pin_reset = -1;
            config.pin_xclk = pins::CAM_PIN_XCLK;
            config.__bindgen_anon_1.pin_sccb_sda = pins::CAM_PIN_SIOD;
            config.__bindgen_anon_2.pin_sccb_scl = pins::CAM_PIN_SIOC;
            config.pin_d7 = pins::CAM_PIN_D7;
            config.pin_d6 = pins::CAM_PIN_D6;
            config.pin_d5 = pins::CAM_PIN_D5;
            config.pin_d4 = pins::CAM_PIN_D4;
            config.pin_d3 = pins::CAM_PIN_D3;
            config.pin_d2 = pins::CAM_PIN_D2;
            config.pin_d1 = pins::CAM_PIN_D1;
            config.pin_d0 = pins::CAM_PIN_D0;
            config.pin_vsync = pins::CAM_PIN_VSYNC;
            config.pin_href = pins::CAM_PIN_HREF;
            config.pin_pclk = pins::CAM_PIN_PCLK;
            config.xclk_freq_hz = 20_000_000;
            config.ledc_timer = sys::ledc_timer_t_LEDC_TIMER_0;
            config.ledc_channel = sys::ledc_channel_t_LEDC_CHANNEL_0;
            config.pixel_format = sys::pixformat_t_PIXFORMAT_GRAYSCALE;
            config.frame_size = sys::framesize_t_FRAMESIZE_VGA;
            config.fb_count = 1;
            config
        }
    }

    impl ImagingPort for OvCamera {
        fn start(&mut self) -> Result<(), ImagingError> {
            if self.started {
                return Ok(());
            }
            let config = Self::camera_config();
            let ret = unsafe { sys::esp_camera_init(&config) };
            if ret != sys::ESP_OK {
                error!("Camera: init failed ({ret})");
                return Err(ImagingError::InitFailed);
            }
            self.started = true;
            info!("Camera: initialised");
            Ok(())
        }

        fn capture(&mut self) -> Result<(), ImagingError> {
            self.release_frame();
            let fb = unsafe { sys::esp_camera_fb_get() };
            if fb.is_null() {
                error!("Camera: failed to get frame buffer");
                return Err(ImagingError::CaptureFailed);
            }
            self.fb = fb;
            Ok(())
        }

        fn frame(&self) -> Result<Frame<'_>, ImagingError> {
            if self.fb.is_null() {
                return Err(ImagingError::NoFrame);
            }
            // SAFETY: fb stays valid until release_frame().
            let fb = unsafe { &*self.fb };
            Ok(Frame {
                bytes: unsafe { core::slice::from_raw_parts(fb.buf, fb.len) },
                mode: "grayscale",
                width: fb.width as u32,
                height: fb.height as u32,
            })
        }

        fn release_frame(&mut self) {
            if !self.fb.is_null() {
                unsafe { sys::esp_camera_fb_return(self.fb) };
                self.fb = core::ptr::null_mut();
            }
        }
    }

    impl Drop for OvCamera {
        fn drop(&mut self) {
            self.release_frame();
            if self.started {
                unsafe { sys::esp_camera_deinit() };
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

const SIM_WIDTH: u32 = 160;
const SIM_HEIGHT: u32 = 120;

/// Deterministic camera for host tests: every capture produces a
/// gradient frame stamped with the capture ordinal, so tests can tell
/// a stale flush from the transmitted frame.
pub struct SimCamera {
    frame: Option<Vec<u8>>,
    captures: u8,
    pub fail_start: bool,
    pub fail_capture: bool,
}

impl SimCamera {
    pub fn new() -> Self {
        Self {
            frame: None,
            captures: 0,
            fail_start: false,
            fail_capture: false,
        }
    }

    pub fn capture_count(&self) -> u8 {
        self.captures
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl ImagingPort for SimCamera {
    fn start(&mut self) -> Result<(), ImagingError> {
        if self.fail_start {
            return Err(ImagingError::InitFailed);
        }
        Ok(())
    }

    fn capture(&mut self) -> Result<(), ImagingError> {
        if self.fail_capture {
            return Err(ImagingError::CaptureFailed);
        }
        self.captures = self.captures.wrapping_add(1);
        let mut bytes = vec![0u8; (SIM_WIDTH * SIM_HEIGHT) as usize];
        for (i, px) in bytes.iter_mut().enumerate() {
            *px = (i % 251) as u8;
        }
        bytes[0] = self.captures;
        self.frame = Some(bytes);
        Ok(())
    }

    fn frame(&self) -> Result<Frame<'_>, ImagingError> {
        let bytes = self.frame.as_deref().ok_or(ImagingError::NoFrame)?;
        Ok(Frame {
            bytes,
            mode: "grayscale",
            width: SIM_WIDTH,
            height: SIM_HEIGHT,
        })
    }

    fn release_frame(&mut self) {
        self.frame = None;
    }
}
