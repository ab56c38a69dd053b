fn main() {
    // No-op on host builds; emits ESP-IDF link/cfg metadata when the
    // esp-idf environment is present (device builds).
    embuild::espidf::sysenv::output();
}
