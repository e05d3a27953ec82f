//! Decoder for frames read from a raw link-layer channel

use super::{DecodeError, DecodeResult};
use chrono::{DateTime, Utc};
use packetviz_core::{NormalizedPacketEvent, PortPair};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;

const IPV4_MIN_HEADER_LEN: usize = 20;
const MAX_VLAN_TAGS: usize = 2;

fn is_vlan(ethertype: EtherType) -> bool {
    ethertype == EtherTypes::Vlan
        || ethertype == EtherTypes::PBridge
        || ethertype == EtherTypes::QinQ
}

/// Decode one Ethernet II frame read from a datalink channel
pub fn decode_frame(frame: &[u8], observed_at: DateTime<Utc>) -> DecodeResult {
    let ethernet = EthernetPacket::new(frame).ok_or(DecodeError::Truncated {
        layer: "ethernet",
        len: frame.len(),
    })?;

    // Up to two 802.1Q / 802.1ad tags may precede the network layer
    let mut ethertype = ethernet.get_ethertype();
    let mut ip_bytes = ethernet.payload();
    for _ in 0..MAX_VLAN_TAGS {
        if !is_vlan(ethertype) {
            break;
        }
        let tag = VlanPacket::new(ip_bytes).ok_or(DecodeError::Truncated {
            layer: "vlan",
            len: ip_bytes.len(),
        })?;
        ethertype = tag.get_ethertype();
        ip_bytes = &ip_bytes[VlanPacket::minimum_packet_size()..];
    }

    if ethertype != EtherTypes::Ipv4 {
        return Ok(None);
    }

    let ipv4 = Ipv4Packet::new(ip_bytes).ok_or(DecodeError::Truncated {
        layer: "ipv4",
        len: ip_bytes.len(),
    })?;

    if ipv4.get_version() != 4 {
        return Err(DecodeError::Malformed(format!(
            "ethertype IPv4 with IP version {}",
            ipv4.get_version()
        )));
    }

    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > ip_bytes.len() {
        return Err(DecodeError::Malformed(format!(
            "IPv4 header length {} with {} bytes available",
            header_len,
            ip_bytes.len()
        )));
    }

    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return Ok(None);
    }

    let ports = if ipv4.get_fragment_offset() != 0 {
        None
    } else {
        // Ethernet padding may follow the datagram
        let total_len = (ipv4.get_total_length() as usize).clamp(header_len, ip_bytes.len());
        let segment = &ip_bytes[header_len..total_len];
        let tcp = TcpPacket::new(segment).ok_or(DecodeError::Truncated {
            layer: "tcp",
            len: segment.len(),
        })?;
        Some(PortPair::new(tcp.get_source(), tcp.get_destination()))
    };

    Ok(NormalizedPacketEvent::tcp(
        ipv4.get_source(),
        ipv4.get_destination(),
        observed_at,
        Some(frame.len() as u64),
        ports,
    ))
}
