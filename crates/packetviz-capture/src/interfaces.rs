//! Local interface enumeration
//!
//! Every call asks the OS again; nothing here is cached.

use crate::error::{CaptureError, CaptureResult};
use pnet::datalink;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

/// An IPv4 address bound to a non-loopback interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterfaceInfo {
    pub name: String,
    pub address: Ipv4Addr,
}

/// All IPv4 addresses on non-loopback interfaces, in OS-reported order
pub fn list_interfaces() -> Vec<NetworkInterfaceInfo> {
    collect_external(datalink::interfaces().into_iter().map(|iface| {
        let loopback = iface.is_loopback();
        let ips = iface.ips.iter().map(|net| net.ip()).collect();
        (iface.name, loopback, ips)
    }))
}

/// The first external IPv4 address on this host
pub fn primary_address() -> CaptureResult<Ipv4Addr> {
    list_interfaces()
        .first()
        .map(|iface| iface.address)
        .ok_or(CaptureError::NoExternalAddress)
}

fn collect_external<I>(entries: I) -> Vec<NetworkInterfaceInfo>
where
    I: IntoIterator<Item = (String, bool, Vec<IpAddr>)>,
{
    let mut interfaces = Vec::new();

    for (name, loopback, ips) in entries {
        if loopback {
            continue;
        }
        for ip in ips {
            if let IpAddr::V4(address) = ip {
                if !address.is_loopback() {
                    interfaces.push(NetworkInterfaceInfo {
                        name: name.clone(),
                        address,
                    });
                }
            }
        }
    }

    interfaces
}
