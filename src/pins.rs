//! GPIO assignments for the ESP32-S3 capture node board.

/// User button (momentary, active low, external pull-up, RTC-capable).
pub const BUTTON_GPIO: i32 = 48;

/// Status LED.
pub const LED_GPIO: i32 = 21;

// ── OV5640 camera pin map ─────────────────────────────────────

pub const CAM_PIN_PWDN: i32 = 14;
pub const CAM_PIN_XCLK: i32 = 7;
pub const CAM_PIN_SIOD: i32 = 4;
pub const CAM_PIN_SIOC: i32 = 5;

pub const CAM_PIN_D7: i32 = 10;
pub const CAM_PIN_D6: i32 = 16;
pub const CAM_PIN_D5: i32 = 11;
pub const CAM_PIN_D4: i32 = 17;
pub const CAM_PIN_D3: i32 = 12;
pub const CAM_PIN_D2: i32 = 18;
pub const CAM_PIN_D1: i32 = 13;
pub const CAM_PIN_D0: i32 = 8;

pub const CAM_PIN_VSYNC: i32 = 15;
pub const CAM_PIN_HREF: i32 = 6;
pub const CAM_PIN_PCLK: i32 = 9;

/// Camera pins isolated before deep sleep so the sensor cannot
/// back-power through the data lines and drain the battery.
pub const CAM_ISOLATE_PINS: [i32; 15] = [
    CAM_PIN_PWDN,
    CAM_PIN_XCLK,
    CAM_PIN_SIOD,
    CAM_PIN_SIOC,
    CAM_PIN_D7,
    CAM_PIN_D6,
    CAM_PIN_D5,
    CAM_PIN_D4,
    CAM_PIN_D3,
    CAM_PIN_D2,
    CAM_PIN_D1,
    CAM_PIN_D0,
    CAM_PIN_VSYNC,
    CAM_PIN_HREF,
    CAM_PIN_PCLK,
];
