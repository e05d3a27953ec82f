//! PacketViz Core - event types and configuration
//!
//! This crate provides the types shared by the capture pipeline and the
//! real-time transport:
//!
//! - **Events**: the normalized packet summary every backend emits
//! - **Config**: TOML configuration with environment overrides

pub mod config;
pub mod events;

pub use config::{ConfigLoader, PacketVizConfig};
pub use events::{NormalizedPacketEvent, PortPair, TransportProtocol};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
