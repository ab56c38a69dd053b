//! FreeRTOS-aware thread spawning.
//!
//! ESP-IDF implements `std::thread` via pthreads, which are thin
//! wrappers around FreeRTOS tasks. `esp_pthread_set_cfg()` sets
//! thread-local configuration applied to the *next* `pthread_create`
//! from the calling thread, so the config→spawn pair must not be
//! interleaved with other spawns on the same thread.
//!
//! Task layout for this firmware: dispatcher 15, button 13, capture
//! workflow 5, indicator 2.

/// Spawn a thread with an explicit FreeRTOS priority and stack size.
///
/// `name` must be null-terminated (e.g. `"button\0"`). On non-ESP
/// targets priority is ignored and only the stack size applies.
#[cfg(target_os = "espidf")]
pub fn spawn(
    name: &'static str,
    priority: u8,
    stack_kb: usize,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    unsafe {
        let mut cfg = esp_idf_svc::sys::esp_pthread_get_default_config();
        cfg.prio = i32::from(priority);
        cfg.stack_size = stack_kb * 1024;
        cfg.thread_name = name.as_ptr() as *const _;
        let ret = esp_idf_svc::sys::esp_pthread_set_cfg(&cfg);
        assert!(
            ret == esp_idf_svc::sys::ESP_OK,
            "esp_pthread_set_cfg failed: {ret}"
        );
    }

    let display_name = name.trim_end_matches('\0');
    log::debug!(
        "Spawning '{}' (pri={}, stack={}KB)",
        display_name,
        priority,
        stack_kb
    );

    std::thread::Builder::new()
        .name(display_name.into())
        .spawn(f)
        .expect("thread creation failed")
}

/// Simulation fallback — plain thread, priority ignored.
#[cfg(not(target_os = "espidf"))]
pub fn spawn(
    name: &'static str,
    _priority: u8,
    stack_kb: usize,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    let display_name = name.trim_end_matches('\0');
    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size(stack_kb.max(64) * 1024)
        .spawn(f)
        .expect("thread creation failed")
}
