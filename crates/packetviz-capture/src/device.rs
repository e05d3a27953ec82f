//! Capture device selection

use crate::error::{CaptureError, CaptureResult};
use serde::Serialize;

/// Names or descriptions that mark an adapter as unlikely to carry real traffic
const DEPRIORITIZED: [&str; 5] = ["loopback", "vmware", "virtualbox", "hyper-v", "npcap"];

/// Descriptions that mark a physical adapter
const PRIORITIZED: [&str; 3] = ["ethernet", "wireless", "wi-fi"];

/// A capture target as reported by a native backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureDevice {
    pub name: String,
    pub description: Option<String>,
}

impl CaptureDevice {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            description,
        }
    }

    fn description_lower(&self) -> String {
        self.description
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default()
    }

    /// Loopback or virtual adapter
    pub fn is_deprioritized(&self) -> bool {
        let name = self.name.to_lowercase();
        let desc = self.description_lower();
        DEPRIORITIZED
            .iter()
            .any(|marker| name.contains(marker) || desc.contains(marker))
    }

    /// Wired or wireless adapter
    pub fn is_prioritized(&self) -> bool {
        let desc = self.description_lower();
        PRIORITIZED.iter().any(|marker| desc.contains(marker))
    }
}

/// Pick the most plausible real network device.
///
/// Returns the first device that is prioritized and not deprioritized. When
/// nothing qualifies the first device is returned as-is, even a loopback one.
pub fn pick_device(devices: &[CaptureDevice]) -> CaptureResult<&CaptureDevice> {
    let first = devices.first().ok_or(CaptureError::NoDevicesFound)?;

    Ok(devices
        .iter()
        .find(|d| !d.is_deprioritized() && d.is_prioritized())
        .unwrap_or(first))
}
