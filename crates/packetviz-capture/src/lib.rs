//! PacketViz capture pipeline
//!
//! Turns live TCP traffic into [`NormalizedPacketEvent`]s. A session probes
//! the native backends in priority order, picks the most plausible network
//! device, decodes frames with the decoder bound to the winning backend, and
//! falls back to sampling the OS connection table when no native backend is
//! usable or the active one fails.
//!
//! [`NormalizedPacketEvent`]: packetviz_core::NormalizedPacketEvent

pub mod backend;
pub mod decode;
pub mod device;
pub mod emitter;
pub mod error;
pub mod interfaces;
mod native;
pub mod netstat;
pub mod poller;
pub mod session;

pub use backend::{BackendAttempt, BackendKind, FrameSource, NativeBackend};
pub use device::{pick_device, CaptureDevice};
pub use emitter::{CaptureStats, EventCallback};
pub use error::{CaptureError, CaptureResult};
pub use interfaces::{list_interfaces, primary_address, NetworkInterfaceInfo};
pub use netstat::{ConnectionRow, ConnectionTable, NetstatTable};
pub use poller::{sample_connection, PollerConfig};
pub use session::{CaptureSession, SessionState};
