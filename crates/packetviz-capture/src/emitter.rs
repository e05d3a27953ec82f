//! Delivery of events to the session's single consumer

use packetviz_core::NormalizedPacketEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Consumer callback. `None` marks a frame that failed to decode.
pub type EventCallback = Arc<dyn Fn(Option<NormalizedPacketEvent>) + Send + Sync>;

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Events handed to the consumer
    pub events_emitted: u64,
    /// Frames dropped by the decoder filters (non-TCP, non-IPv4, loopback)
    pub frames_filtered: u64,
    /// Frames that failed to decode
    pub decode_failures: u64,
    /// Connection table queries that failed
    pub poll_failures: u64,
}

#[derive(Default)]
pub(crate) struct CaptureCounters {
    events_emitted: AtomicU64,
    frames_filtered: AtomicU64,
    decode_failures: AtomicU64,
    poll_failures: AtomicU64,
}

impl CaptureCounters {
    pub(crate) fn frame_filtered(&self) {
        self.frames_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn poll_failed(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            frames_filtered: self.frames_filtered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
        }
    }
}

/// Gated handle on the consumer callback.
///
/// Clones share one gate. The callback runs while the gate is held, so once
/// `close` returns no clone can deliver anything.
#[derive(Clone)]
pub(crate) struct Emitter {
    callback: EventCallback,
    open: Arc<Mutex<bool>>,
    counters: Arc<CaptureCounters>,
}

impl Emitter {
    pub(crate) fn new(callback: EventCallback, counters: Arc<CaptureCounters>) -> Self {
        Self {
            callback,
            open: Arc::new(Mutex::new(true)),
            counters,
        }
    }

    /// Deliver an event, or a decode-failure marker for `None`.
    ///
    /// Returns false once the emitter is closed.
    pub(crate) fn emit(&self, event: Option<NormalizedPacketEvent>) -> bool {
        let open = self.open.lock();
        if !*open {
            return false;
        }

        match event {
            Some(_) => self.counters.events_emitted.fetch_add(1, Ordering::Relaxed),
            None => self.counters.decode_failures.fetch_add(1, Ordering::Relaxed),
        };
        (self.callback)(event);
        true
    }

    pub(crate) fn counters(&self) -> &CaptureCounters {
        &self.counters
    }

    pub(crate) fn close(&self) {
        *self.open.lock() = false;
    }
}
