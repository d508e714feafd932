//! Energomera meter to MQTT bridge
//!
//! Reads Energomera CE301/CE303 meters over IEC 62056-21 and publishes the
//! readings as Home Assistant MQTT discovery entities.

pub mod config;
pub mod cycle;
pub mod metering_62056;
pub mod mqtt;
pub mod sensors;

// Re-export common types for easier access
pub use config::{Config, ConfigError};
pub use cycle::{CycleError, CycleManager};
pub use metering_62056::{Iec62056Client, MeterError, MeterTransport};
pub use mqtt::{MessageBus, MqttBus};
