//! Raw link-layer capture through `pnet` (AF_PACKET on Linux, BPF on BSD/macOS)

use super::{BackendKind, FrameSource, NativeBackend, NativeSettings};
use crate::device::CaptureDevice;
use crate::error::{CaptureError, CaptureResult};
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};
use std::io::ErrorKind;
use tracing::info;

pub struct DatalinkBackend {
    settings: NativeSettings,
}

impl DatalinkBackend {
    pub fn new(settings: NativeSettings) -> Self {
        Self { settings }
    }
}

impl NativeBackend for DatalinkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Datalink
    }

    /// Opens and drops a channel so missing privileges fail here rather
    /// than at `open`
    fn probe(&self) -> CaptureResult<()> {
        let interfaces = datalink::interfaces();
        let interface = interfaces
            .iter()
            .find(|iface| iface.is_up() && !iface.is_loopback())
            .or_else(|| interfaces.first())
            .ok_or_else(|| {
                CaptureError::BackendUnavailable("datalink: no interfaces reported".to_string())
            })?;

        self.channel(interface).map(drop)
    }

    fn devices(&self) -> CaptureResult<Vec<CaptureDevice>> {
        Ok(datalink::interfaces()
            .iter()
            .map(|iface| CaptureDevice::new(iface.name.clone(), Some(describe(iface))))
            .collect())
    }

    fn open(&self, device: &CaptureDevice) -> CaptureResult<Box<dyn FrameSource>> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == device.name)
            .ok_or_else(|| {
                CaptureError::BackendUnavailable(format!("datalink: {} disappeared", device.name))
            })?;

        let rx = self.channel(&interface)?;

        info!("datalink capture opened on {}", device.name);
        Ok(Box::new(DatalinkSource { rx }))
    }
}

impl DatalinkBackend {
    fn channel(&self, interface: &NetworkInterface) -> CaptureResult<Box<dyn DataLinkReceiver>> {
        let config = Config {
            read_timeout: Some(self.settings.read_timeout),
            read_buffer_size: self.settings.buffer_size,
            promiscuous: false,
            ..Default::default()
        };

        match datalink::channel(interface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
            Ok(_) => Err(CaptureError::BackendUnavailable(format!(
                "datalink: {} is not an Ethernet channel",
                interface.name
            ))),
            Err(e) => Err(channel_error(&interface.name, &e)),
        }
    }
}

fn channel_error(name: &str, e: &std::io::Error) -> CaptureError {
    if e.kind() == ErrorKind::PermissionDenied {
        CaptureError::BackendUnavailable(format!(
            "datalink: permission denied on {} (needs CAP_NET_RAW or root)",
            name
        ))
    } else {
        CaptureError::BackendUnavailable(format!("datalink: {}: {}", name, e))
    }
}

struct DatalinkSource {
    rx: Box<dyn DataLinkReceiver>,
}

impl FrameSource for DatalinkSource {
    fn next_frame(&mut self) -> CaptureResult<Option<Vec<u8>>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e) if is_idle(e.kind()) => Ok(None),
            Err(e) => Err(CaptureError::BackendRuntimeError(format!("datalink: {}", e))),
        }
    }
}

fn is_idle(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Description fed to the device picker.
///
/// pnet only reports a description on Windows, so elsewhere one is derived
/// from the interface flags and sysfs.
fn describe(iface: &NetworkInterface) -> String {
    if !iface.description.is_empty() {
        return iface.description.clone();
    }
    if iface.is_loopback() {
        return "Loopback".to_string();
    }
    sysfs_kind(&iface.name).to_string()
}

#[cfg(target_os = "linux")]
fn sysfs_kind(name: &str) -> &'static str {
    let base = std::path::Path::new("/sys/class/net").join(name);
    if base.join("wireless").exists() {
        "Wireless adapter"
    } else if base.join("device").exists() {
        "Ethernet adapter"
    } else {
        "Virtual interface"
    }
}

#[cfg(not(target_os = "linux"))]
fn sysfs_kind(name: &str) -> &'static str {
    if name.starts_with("en") || name.starts_with("eth") {
        "Ethernet adapter"
    } else if name.starts_with("wl") {
        "Wireless adapter"
    } else {
        "Virtual interface"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_errors_are_not_fatal() {
        assert!(is_idle(ErrorKind::TimedOut));
        assert!(is_idle(ErrorKind::WouldBlock));
        assert!(is_idle(ErrorKind::Interrupted));
        assert!(!is_idle(ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_channel_errors_name_the_interface() {
        let denied = std::io::Error::from(ErrorKind::PermissionDenied);
        let msg = channel_error("eth0", &denied).to_string();
        assert!(msg.contains("permission denied on eth0"));
        assert!(msg.contains("CAP_NET_RAW"));

        let other = std::io::Error::new(ErrorKind::Other, "no such device");
        let msg = channel_error("eth9", &other).to_string();
        assert!(msg.contains("eth9: no such device"));
        assert!(!msg.contains("permission denied"));
    }

    #[test]
    fn test_missing_privileges_fail_availability_check() {
        let backend = DatalinkBackend::new(NativeSettings::from(
            &packetviz_core::config::CaptureSettings::default(),
        ));
        // without raw socket rights the check itself must refuse
        if let Err(e) = backend.probe() {
            assert!(matches!(e, CaptureError::BackendUnavailable(_)));
        }
    }

    #[test]
    fn test_devices_describe_every_interface() {
        let backend = DatalinkBackend::new(NativeSettings::from(
            &packetviz_core::config::CaptureSettings::default(),
        ));
        let devices = backend.devices().unwrap();
        assert_eq!(devices.len(), datalink::interfaces().len());
        assert!(devices.iter().all(|d| d.description.is_some()));
    }
}
