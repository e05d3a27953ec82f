//! Capture backends
//!
//! A native backend gives raw frame access through some OS facility. Every
//! native backend is probed in priority order when a session starts and the
//! first one that initializes wins. Connection polling has no raw frames and
//! is not a `NativeBackend`; it is always available and always last.

pub mod datalink;
pub mod libpcap;

use crate::decode::{self, DecodeFn};
use crate::device::CaptureDevice;
use crate::error::{CaptureError, CaptureResult};
use packetviz_core::config::CaptureSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which capture strategy a session is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// libpcap / Npcap
    Libpcap,
    /// OS raw link-layer channel
    Datalink,
    /// Sampling of the OS connection table
    ConnectionPoll,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Libpcap => "libpcap",
            BackendKind::Datalink => "datalink",
            BackendKind::ConnectionPoll => "connection_poll",
        }
    }

    /// True for backends with raw frame access
    pub fn is_native(&self) -> bool {
        !matches!(self, BackendKind::ConnectionPoll)
    }

    /// The frame decoder bound to this backend
    pub fn decoder(&self) -> Option<DecodeFn> {
        match self {
            BackendKind::Libpcap => Some(decode::libpcap::decode_frame as DecodeFn),
            BackendKind::Datalink => Some(decode::datalink::decode_frame as DecodeFn),
            BackendKind::ConnectionPoll => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "libpcap" => Ok(BackendKind::Libpcap),
            "datalink" => Ok(BackendKind::Datalink),
            "connection_poll" => Ok(BackendKind::ConnectionPoll),
            other => Err(CaptureError::BackendUnavailable(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

/// A source of raw frames from an opened device
pub trait FrameSource: Send {
    /// Read the next frame.
    ///
    /// `Ok(None)` means the read timed out with nothing captured; the caller
    /// should check for cancellation and call again. `Err` is fatal for this
    /// source.
    fn next_frame(&mut self) -> CaptureResult<Option<Vec<u8>>>;
}

/// A capture facility with raw frame access
pub trait NativeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Check that the facility can be loaded or initialized on this host
    fn probe(&self) -> CaptureResult<()>;

    /// Devices the facility can capture on, in enumeration order
    fn devices(&self) -> CaptureResult<Vec<CaptureDevice>>;

    /// Open `device` for capture
    fn open(&self, device: &CaptureDevice) -> CaptureResult<Box<dyn FrameSource>>;
}

/// One failed attempt to bring up a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendAttempt {
    pub kind: BackendKind,
    pub error: String,
}

impl BackendAttempt {
    pub fn new(kind: BackendKind, error: &CaptureError) -> Self {
        Self {
            kind,
            error: error.to_string(),
        }
    }
}

/// Result of probing the native backends
pub struct Selection {
    /// First backend whose probe succeeded, if any
    pub backend: Option<Arc<dyn NativeBackend>>,
    /// Every probe that failed before the winner
    pub attempts: Vec<BackendAttempt>,
}

impl Selection {
    /// The kind the session will run on; polling when no native backend won
    pub fn kind(&self) -> BackendKind {
        self.backend
            .as_ref()
            .map(|b| b.kind())
            .unwrap_or(BackendKind::ConnectionPoll)
    }
}

/// Probe `backends` in order and commit to the first that initializes
pub fn select_backend(backends: &[Arc<dyn NativeBackend>]) -> Selection {
    let mut attempts = Vec::new();

    for backend in backends {
        match backend.probe() {
            Ok(()) => {
                info!("Capture backend {} available", backend.kind());
                return Selection {
                    backend: Some(Arc::clone(backend)),
                    attempts,
                };
            }
            Err(e) => {
                debug!("Capture backend {} unavailable: {}", backend.kind(), e);
                attempts.push(BackendAttempt::new(backend.kind(), &e));
            }
        }
    }

    warn!("{}, using connection polling", CaptureError::NoCaptureBackendAvailable);
    Selection {
        backend: None,
        attempts,
    }
}

/// Tuning shared by the native backends
#[derive(Debug, Clone)]
pub struct NativeSettings {
    pub bpf_filter: String,
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub snaplen: u32,
}

impl From<&CaptureSettings> for NativeSettings {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            bpf_filter: settings.bpf_filter.clone(),
            buffer_size: settings.buffer_size,
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            snaplen: settings.snaplen,
        }
    }
}

/// Build the native backends named in `settings`, in configured order
pub fn native_backends(settings: &CaptureSettings) -> Vec<Arc<dyn NativeBackend>> {
    let native = NativeSettings::from(settings);
    let mut backends: Vec<Arc<dyn NativeBackend>> = Vec::new();

    for name in &settings.backends {
        match name.parse::<BackendKind>() {
            Ok(BackendKind::Libpcap) => {
                backends.push(Arc::new(libpcap::LibpcapBackend::new(native.clone())))
            }
            Ok(BackendKind::Datalink) => {
                backends.push(Arc::new(datalink::DatalinkBackend::new(native.clone())))
            }
            // polling is always the implicit terminal fallback
            Ok(BackendKind::ConnectionPoll) => {}
            Err(e) => warn!("Ignoring configured backend: {}", e),
        }
    }

    backends
}
