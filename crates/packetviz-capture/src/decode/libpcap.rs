//! Decoder for frames delivered by libpcap / Npcap

use super::{DecodeError, DecodeResult};
use chrono::{DateTime, Utc};
use etherparse::{IpNumber, NetSlice, SlicedPacket, TransportSlice};
use packetviz_core::{NormalizedPacketEvent, PortPair};

const ETHERNET_HEADER_LEN: usize = 14;

/// Decode one Ethernet II frame captured through libpcap
pub fn decode_frame(frame: &[u8], observed_at: DateTime<Utc>) -> DecodeResult {
    if frame.len() < ETHERNET_HEADER_LEN {
        return Err(DecodeError::Truncated {
            layer: "ethernet",
            len: frame.len(),
        });
    }

    let packet =
        SlicedPacket::from_ethernet(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let ipv4 = match packet.net {
        Some(NetSlice::Ipv4(ipv4)) => ipv4,
        _ => return Ok(None),
    };

    let header = ipv4.header();
    if header.protocol() != IpNumber::TCP {
        return Ok(None);
    }

    // Non-first fragments carry no TCP header
    let ports = match packet.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            Some(PortPair::new(tcp.source_port(), tcp.destination_port()))
        }
        _ => None,
    };

    Ok(NormalizedPacketEvent::tcp(
        header.source_addr(),
        header.destination_addr(),
        observed_at,
        Some(frame.len() as u64),
        ports,
    ))
}
