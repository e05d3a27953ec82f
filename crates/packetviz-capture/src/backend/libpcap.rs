//! libpcap / Npcap capture backend
//!
//! Built only with the `libpcap` cargo feature, since it links against the
//! system library. Without the feature the backend still exists but every
//! probe reports it unavailable, so selection moves on to the next one.

use super::{BackendKind, FrameSource, NativeBackend, NativeSettings};
use crate::device::CaptureDevice;
use crate::error::{CaptureError, CaptureResult};

#[cfg(feature = "libpcap")]
use tracing::{debug, info, warn};

pub struct LibpcapBackend {
    #[cfg_attr(not(feature = "libpcap"), allow(dead_code))]
    settings: NativeSettings,
}

impl LibpcapBackend {
    pub fn new(settings: NativeSettings) -> Self {
        Self { settings }
    }
}

#[cfg(feature = "libpcap")]
impl NativeBackend for LibpcapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Libpcap
    }

    fn probe(&self) -> CaptureResult<()> {
        // Listing devices forces the library to load
        pcap::Device::list()
            .map(|_| ())
            .map_err(|e| CaptureError::BackendUnavailable(format!("libpcap: {}", e)))
    }

    fn devices(&self) -> CaptureResult<Vec<CaptureDevice>> {
        let devices = pcap::Device::list()
            .map_err(|e| CaptureError::BackendUnavailable(format!("libpcap: {}", e)))?;

        Ok(devices
            .into_iter()
            .map(|d| CaptureDevice::new(d.name, d.desc))
            .collect())
    }

    fn open(&self, device: &CaptureDevice) -> CaptureResult<Box<dyn FrameSource>> {
        let unavailable = |e: pcap::Error| {
            CaptureError::BackendUnavailable(format!("libpcap open {}: {}", device.name, e))
        };

        let timeout_ms = i32::try_from(self.settings.read_timeout.as_millis()).unwrap_or(i32::MAX);
        let mut capture = pcap::Capture::from_device(device.name.as_str())
            .map_err(unavailable)?
            .promisc(false)
            .snaplen(i32::try_from(self.settings.snaplen).unwrap_or(i32::MAX))
            .buffer_size(i32::try_from(self.settings.buffer_size).unwrap_or(i32::MAX))
            .timeout(timeout_ms)
            .immediate_mode(true)
            .open()
            .map_err(unavailable)?;

        // The filter only saves work; the decoder enforces the same rules
        if !self.settings.bpf_filter.is_empty() {
            match capture.filter(&self.settings.bpf_filter, true) {
                Ok(()) => debug!("Applied BPF filter: {}", self.settings.bpf_filter),
                Err(e) => warn!("Failed to apply BPF filter on {}: {}", device.name, e),
            }
        }

        info!(
            "libpcap capture opened on {} (buffer {} bytes, timeout {} ms)",
            device.name, self.settings.buffer_size, timeout_ms
        );

        Ok(Box::new(PcapSource { capture }))
    }
}

#[cfg(feature = "libpcap")]
struct PcapSource {
    capture: pcap::Capture<pcap::Active>,
}

#[cfg(feature = "libpcap")]
impl FrameSource for PcapSource {
    fn next_frame(&mut self) -> CaptureResult<Option<Vec<u8>>> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::BackendRuntimeError(format!("libpcap: {}", e))),
        }
    }
}

#[cfg(not(feature = "libpcap"))]
const NOT_BUILT: &str = "built without libpcap support (enable the `libpcap` feature)";

#[cfg(not(feature = "libpcap"))]
impl NativeBackend for LibpcapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Libpcap
    }

    fn probe(&self) -> CaptureResult<()> {
        Err(CaptureError::BackendUnavailable(NOT_BUILT.to_string()))
    }

    fn devices(&self) -> CaptureResult<Vec<CaptureDevice>> {
        Err(CaptureError::BackendUnavailable(NOT_BUILT.to_string()))
    }

    fn open(&self, _device: &CaptureDevice) -> CaptureResult<Box<dyn FrameSource>> {
        Err(CaptureError::BackendUnavailable(NOT_BUILT.to_string()))
    }
}
