//! Packet summary events
//!
//! A [`NormalizedPacketEvent`] is the only thing the capture pipeline emits.
//! Every backend, whether it decodes raw frames or samples the connection
//! table, produces this same shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Placeholder address for backends that cannot decode an endpoint
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Address that is never allowed in an emitted event
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Transport protocol of an observed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    #[serde(rename = "TCP")]
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Source and destination ports, each optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<u16>,
}

impl PortPair {
    pub fn new(src: u16, dest: u16) -> Self {
        Self {
            src: Some(src),
            dest: Some(dest),
        }
    }
}

/// One observed (or, for the polling backend, inferred) TCP exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPacketEvent {
    /// Dotted-quad source address, or [`UNKNOWN_ADDRESS`]
    pub source_address: String,

    /// Dotted-quad destination address, or [`UNKNOWN_ADDRESS`]
    pub dest_address: String,

    pub transport_protocol: TransportProtocol,

    /// Capture time
    pub observed_at: DateTime<Utc>,

    /// Full raw frame length when a frame was actually observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortPair>,
}

impl NormalizedPacketEvent {
    /// Build a TCP event from two IPv4 endpoints.
    ///
    /// Returns `None` when either side is the loopback address, so callers
    /// can never construct an event that violates the loopback exclusion.
    pub fn tcp(
        source: Ipv4Addr,
        dest: Ipv4Addr,
        observed_at: DateTime<Utc>,
        byte_length: Option<u64>,
        ports: Option<PortPair>,
    ) -> Option<Self> {
        if source.is_loopback() || dest.is_loopback() {
            return None;
        }

        Some(Self {
            source_address: source.to_string(),
            dest_address: dest.to_string(),
            transport_protocol: TransportProtocol::Tcp,
            observed_at,
            byte_length,
            ports,
        })
    }

    /// True if either endpoint is the loopback address
    pub fn touches_loopback(&self) -> bool {
        self.source_address == LOOPBACK_ADDRESS || self.dest_address == LOOPBACK_ADDRESS
    }
}
