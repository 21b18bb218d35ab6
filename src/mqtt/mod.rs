//! # MQTT Integration Module
//!
//! Subscribe-only client for the water quality sensor topic. Readings arrive as
//! JSON over MQTT-over-WebSocket and are handed to a single downstream channel.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker dial parameters and session options
//! ├── payload.rs       - Decode and validate inbound sensor payloads
//! ├── backoff.rs       - Capped exponential retry delays
//! ├── machine.rs       - Connection lifecycle state machine (pure)
//! └── mqtt_handler.rs  - ConnectionManager driving the machine with rumqttc
//! ```
//!
//! ## Failure Handling
//!
//! Transport errors never leave this module as errors. Connect failures and
//! post-connect losses share one retry budget and show up only as
//! [`ConnectionState`] transitions. Malformed payloads are logged and dropped.

pub mod backoff;
pub mod config;
pub mod machine;
pub mod mqtt_handler;
pub mod payload;

pub use backoff::BackoffPolicy;
pub use config::{BrokerOptions, ConnectionConfig};
pub use machine::ConnectionState;
pub use mqtt_handler::ConnectionManager;
