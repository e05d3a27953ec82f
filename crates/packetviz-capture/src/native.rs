//! Native capture loop on a dedicated thread

use crate::backend::{BackendKind, FrameSource};
use crate::decode::DecodeFn;
use crate::emitter::Emitter;
use crate::error::{CaptureError, CaptureResult};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Fatal error raised by a running frame source
#[derive(Debug)]
pub(crate) struct CaptureFault {
    pub kind: BackendKind,
    pub error: CaptureError,
}

/// A running native capture thread
pub(crate) struct NativeCapture {
    kind: BackendKind,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NativeCapture {
    /// Start reading `source` on its own thread.
    ///
    /// Each frame goes through the decoder bound to `kind`. A source error ends
    /// the thread and is reported once on `faults`.
    pub(crate) fn spawn(
        kind: BackendKind,
        mut source: Box<dyn FrameSource>,
        emitter: Emitter,
        faults: mpsc::UnboundedSender<CaptureFault>,
    ) -> CaptureResult<Self> {
        let decoder: DecodeFn = kind.decoder().ok_or_else(|| {
            CaptureError::BackendUnavailable(format!("{} has no frame decoder", kind))
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name(format!("packetviz-{}", kind))
            .spawn(move || {
                info!("{} capture thread started", kind);

                while thread_running.load(Ordering::SeqCst) {
                    let frame = match source.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            if thread_running.load(Ordering::SeqCst) {
                                error!("{} capture failed: {}", kind, e);
                                let _ = faults.send(CaptureFault { kind, error: e });
                            }
                            break;
                        }
                    };

                    let delivered = match decoder(&frame, Utc::now()) {
                        Ok(Some(event)) => emitter.emit(Some(event)),
                        Ok(None) => {
                            emitter.counters().frame_filtered();
                            true
                        }
                        Err(e) => {
                            debug!("Failed to decode {}-byte frame: {}", frame.len(), e);
                            emitter.emit(None)
                        }
                    };

                    if !delivered {
                        break;
                    }
                }

                info!("{} capture thread stopped", kind);
            })?;

        Ok(Self {
            kind,
            running,
            thread: Some(thread),
        })
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Signal the thread and wait for it to exit.
    ///
    /// Returns within one read timeout of the frame source.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} capture thread panicked", self.kind);
            }
        }
    }
}

impl Drop for NativeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::frames;
    use crate::emitter::CaptureCounters;
    use packetviz_core::NormalizedPacketEvent;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Scripted(VecDeque<CaptureResult<Option<Vec<u8>>>>);

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> CaptureResult<Option<Vec<u8>>> {
            match self.0.pop_front() {
                Some(next) => next,
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        }
    }

    fn collecting() -> (Emitter, Arc<Mutex<Vec<Option<NormalizedPacketEvent>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let emitter = Emitter::new(
            Arc::new(move |e| sink.lock().push(e)),
            Arc::new(CaptureCounters::default()),
        );
        (emitter, seen)
    }

    #[tokio::test]
    async fn test_frames_are_decoded_in_order() {
        let script = VecDeque::from(vec![
            Ok(Some(frames::tcp([10, 0, 0, 5], [1, 1, 1, 1], 1000, 443, b""))),
            Ok(None),
            Ok(Some(frames::udp([10, 0, 0, 5], [8, 8, 8, 8], 5353, 53))),
            Ok(Some(vec![0u8; 8])),
            Ok(Some(frames::tcp([10, 0, 0, 5], [2, 2, 2, 2], 1001, 80, b""))),
        ]);
        let (emitter, seen) = collecting();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut capture =
            NativeCapture::spawn(BackendKind::Datalink, Box::new(Scripted(script)), emitter.clone(), tx)
                .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        capture.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].as_ref().unwrap().dest_address, "1.1.1.1");
        assert!(seen[1].is_none());
        assert_eq!(seen[2].as_ref().unwrap().dest_address, "2.2.2.2");

        let stats = emitter.counters().snapshot();
        assert_eq!(stats.frames_filtered, 1);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.events_emitted, 2);
    }

    #[tokio::test]
    async fn test_source_error_is_reported_once() {
        let script = VecDeque::from(vec![Err(CaptureError::BackendRuntimeError(
            "device unplugged".into(),
        ))]);
        let (emitter, _seen) = collecting();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut capture =
            NativeCapture::spawn(BackendKind::Libpcap, Box::new(Scripted(script)), emitter, tx)
                .unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.kind, BackendKind::Libpcap);
        assert!(matches!(fault.error, CaptureError::BackendRuntimeError(_)));

        capture.stop();
        assert!(rx.recv().await.is_none());
    }
}
