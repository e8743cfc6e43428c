//! Application Layer - Use cases and port definitions.
//!
//! Ports describe how the feed client reaches the network and who it
//! notifies; the gateway service wires the components together and owns
//! their lifecycle.

/// Port interfaces for the upstream transport and record listeners.
pub mod ports;

/// The gateway service object.
pub mod services;
