//! Host-side integration tests: full workflows driven through the
//! simulation backends, no hardware.

mod mock_ports;

mod capture_flow_tests;
mod handshake_tests;
mod provisioning_flow_tests;
