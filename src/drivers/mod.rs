//! Task-backed drivers: button input and the status LED, plus the
//! FreeRTOS-aware thread spawn helper they share.

pub mod button;
pub mod indicator;
pub mod task_spawn;
