//! Capture session lifecycle
//!
//! A `CaptureSession` owns whichever backend won selection and feeds one
//! consumer callback. It moves through these states:
//!
//! ```text
//! Idle -> Initializing -> Running -> Error -> Downgrading -> Initializing -> Running
//!   any state -> Stopped
//! ```
//!
//! A native backend that fails at runtime is torn down and replaced by the
//! connection poller. The other native backends are not retried, and the
//! downgrade is never reversed within one run. `stop` can be called from any
//! thread; once it returns nothing more is delivered.

use crate::backend::{self, BackendAttempt, BackendKind, NativeBackend};
use crate::device::pick_device;
use crate::emitter::{CaptureCounters, CaptureStats, Emitter};
use crate::error::{CaptureError, CaptureResult};
use crate::interfaces::{list_interfaces, primary_address};
use crate::native::{CaptureFault, NativeCapture};
use crate::netstat::{ConnectionTable, NetstatTable};
use crate::poller::{spawn_poller, PollHandle, PollerConfig};
use packetviz_core::config::CaptureSettings;
use packetviz_core::NormalizedPacketEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "backend", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Running(BackendKind),
    Error,
    Downgrading,
    Stopped,
}

enum RunningBackend {
    Native {
        capture: NativeCapture,
        supervisor: JoinHandle<()>,
    },
    Poll(PollHandle),
}

impl RunningBackend {
    fn kind(&self) -> BackendKind {
        match self {
            RunningBackend::Native { capture, .. } => capture.kind(),
            RunningBackend::Poll(_) => BackendKind::ConnectionPoll,
        }
    }
}

struct ActiveRun {
    runtime: Handle,
    emitter: Emitter,
    backend: RunningBackend,
}

#[derive(Default)]
struct Inner {
    /// Bumped on every start and stop so stale supervisors stand down
    generation: u64,
    active: Option<ActiveRun>,
    attempts: Vec<BackendAttempt>,
    last_error: Option<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
    table: Arc<dyn ConnectionTable>,
    poller: PollerConfig,
    counters: Arc<CaptureCounters>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        debug!("Capture session -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Replace a failed native backend with the connection poller
    fn downgrade(&self, generation: u64, fault: CaptureFault) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.generation != generation {
            return;
        }
        let Some(run) = inner.active.as_mut() else {
            return;
        };
        let RunningBackend::Native { capture, .. } = &mut run.backend else {
            return;
        };

        self.set_state(SessionState::Error);
        warn!(
            "{} capture failed at runtime ({}), switching to connection polling",
            fault.kind, fault.error
        );
        inner.last_error = Some(fault.error.to_string());
        inner
            .attempts
            .push(BackendAttempt::new(fault.kind, &fault.error));

        self.set_state(SessionState::Downgrading);
        capture.stop();

        self.set_state(SessionState::Initializing);
        let poll = spawn_poller(
            &run.runtime,
            Arc::clone(&self.table),
            self.poller,
            run.emitter.clone(),
        );
        run.backend = RunningBackend::Poll(poll);

        self.set_state(SessionState::Running(BackendKind::ConnectionPoll));
    }
}

/// A cancellable capture run feeding one consumer
pub struct CaptureSession {
    backends: Vec<Arc<dyn NativeBackend>>,
    shared: Arc<Shared>,
}

impl CaptureSession {
    /// Create a session over `backends` (probed in order), falling back to
    /// polling `table`.
    pub fn new(
        backends: Vec<Arc<dyn NativeBackend>>,
        table: Arc<dyn ConnectionTable>,
        poller: PollerConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            backends,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                state,
                table,
                poller,
                counters: Arc::new(CaptureCounters::default()),
            }),
        }
    }

    /// Session over the configured native backends and `netstat -an`
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self::new(
            backend::native_backends(settings),
            Arc::new(NetstatTable),
            PollerConfig::from(settings),
        )
    }

    /// Start capturing and deliver events to `on_event`.
    ///
    /// Must be called inside a Tokio runtime. Returns the backend the session
    /// settled on. Fails with `SessionAlreadyActive` if already running.
    pub fn start<F>(&self, on_event: F) -> CaptureResult<BackendKind>
    where
        F: Fn(Option<NormalizedPacketEvent>) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| CaptureError::NoRuntime(e.to_string()))?;

        let mut inner = self.shared.inner.lock();
        if inner.active.is_some() {
            return Err(CaptureError::SessionAlreadyActive);
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.attempts.clear();
        inner.last_error = None;
        self.shared.set_state(SessionState::Initializing);

        let emitter = Emitter::new(Arc::new(on_event), Arc::clone(&self.shared.counters));
        let selection = backend::select_backend(&self.backends);
        inner.attempts.extend(selection.attempts.iter().cloned());

        let running = match &selection.backend {
            Some(native) => {
                match self.start_native(&runtime, native.as_ref(), &emitter, generation) {
                    Ok(running) => running,
                    Err(e) => {
                        warn!(
                            "{} capture could not start ({}), using connection polling",
                            native.kind(),
                            e
                        );
                        inner.attempts.push(BackendAttempt::new(native.kind(), &e));
                        self.start_polling(&runtime, &emitter)
                    }
                }
            }
            None => self.start_polling(&runtime, &emitter),
        };

        let kind = running.kind();
        inner.active = Some(ActiveRun {
            runtime,
            emitter,
            backend: running,
        });
        self.shared.set_state(SessionState::Running(kind));
        info!("Capture session running on {}", kind);

        Ok(kind)
    }

    fn start_native(
        &self,
        runtime: &Handle,
        native: &dyn NativeBackend,
        emitter: &Emitter,
        generation: u64,
    ) -> CaptureResult<RunningBackend> {
        log_host_addresses();

        let devices = native.devices()?;
        for device in &devices {
            debug!(
                "{} device: {} ({})",
                native.kind(),
                device.name,
                device.description.as_deref().unwrap_or("no description")
            );
        }

        let device = pick_device(&devices)?;
        info!(
            "Selected capture device {} ({})",
            device.name,
            device.description.as_deref().unwrap_or("no description")
        );

        let source = native.open(device)?;
        let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();
        let capture = NativeCapture::spawn(native.kind(), source, emitter.clone(), faults_tx)?;

        let shared = Arc::clone(&self.shared);
        let supervisor = runtime.spawn(async move {
            if let Some(fault) = faults_rx.recv().await {
                shared.downgrade(generation, fault);
            }
        });

        Ok(RunningBackend::Native {
            capture,
            supervisor,
        })
    }

    fn start_polling(&self, runtime: &Handle, emitter: &Emitter) -> RunningBackend {
        RunningBackend::Poll(spawn_poller(
            runtime,
            Arc::clone(&self.shared.table),
            self.shared.poller,
            emitter.clone(),
        ))
    }

    /// Stop capturing and release the backend. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;

        if let Some(run) = inner.active.take() {
            run.emitter.close();
            match run.backend {
                RunningBackend::Native {
                    mut capture,
                    supervisor,
                } => {
                    supervisor.abort();
                    capture.stop();
                }
                RunningBackend::Poll(poll) => poll.cancel(),
            }
            info!("Capture session stopped");
        }

        self.shared.set_state(SessionState::Stopped);
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// True while a backend is still producing events.
    ///
    /// A poller that halted on a failed query leaves the session running but
    /// not capturing; stop and start again to resume.
    pub fn is_capturing(&self) -> bool {
        match &self.shared.inner.lock().active {
            Some(ActiveRun {
                backend: RunningBackend::Poll(poll),
                ..
            }) => !poll.is_finished(),
            Some(_) => true,
            None => false,
        }
    }

    /// Counters accumulated across every run of this session
    pub fn stats(&self) -> CaptureStats {
        self.shared.counters.snapshot()
    }

    /// Backends that failed to come up during the current run
    pub fn attempts(&self) -> Vec<BackendAttempt> {
        self.shared.inner.lock().attempts.clone()
    }

    /// Runtime error that caused the last downgrade
    pub fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().last_error.clone()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_host_addresses() {
    match primary_address() {
        Ok(address) => info!("Local IPv4 address: {}", address),
        Err(e) => warn!("{}", e),
    }
    for iface in list_interfaces() {
        debug!("Interface {}: {}", iface.name, iface.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FrameSource;
    use crate::decode::frames;
    use crate::device::CaptureDevice;
    use crate::netstat::ConnectionRow;
    use async_trait::async_trait;
    use packetviz_core::PortPair;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::timeout;

    type Script = Arc<Mutex<VecDeque<CaptureResult<Option<Vec<u8>>>>>>;

    struct FakeBackend {
        kind: BackendKind,
        devices: Vec<CaptureDevice>,
        script: Script,
    }

    impl FakeBackend {
        fn new(frames: Vec<CaptureResult<Option<Vec<u8>>>>) -> Self {
            Self {
                kind: BackendKind::Datalink,
                devices: vec![
                    CaptureDevice::new("lo", Some("Loopback".into())),
                    CaptureDevice::new("eth0", Some("Ethernet adapter".into())),
                ],
                script: Arc::new(Mutex::new(frames.into())),
            }
        }
    }

    struct ScriptSource(Script);

    impl FrameSource for ScriptSource {
        fn next_frame(&mut self) -> CaptureResult<Option<Vec<u8>>> {
            let next = self.0.lock().pop_front();
            match next {
                Some(next) => next,
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        }
    }

    impl NativeBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn probe(&self) -> CaptureResult<()> {
            Ok(())
        }

        fn devices(&self) -> CaptureResult<Vec<CaptureDevice>> {
            Ok(self.devices.clone())
        }

        fn open(&self, device: &CaptureDevice) -> CaptureResult<Box<dyn FrameSource>> {
            assert_eq!(device.name, "eth0");
            Ok(Box::new(ScriptSource(Arc::clone(&self.script))))
        }
    }

    struct StaticTable(Vec<ConnectionRow>);

    #[async_trait]
    impl ConnectionTable for StaticTable {
        async fn query(&self) -> CaptureResult<Vec<ConnectionRow>> {
            Ok(self.0.clone())
        }
    }

    struct FailingTable;

    #[async_trait]
    impl ConnectionTable for FailingTable {
        async fn query(&self) -> CaptureResult<Vec<ConnectionRow>> {
            Err(CaptureError::PollQueryFailure("netstat exited with 1".into()))
        }
    }

    fn example_table() -> Arc<dyn ConnectionTable> {
        Arc::new(StaticTable(vec![ConnectionRow {
            local: "10.0.0.5:51000".parse().unwrap(),
            remote: "93.184.216.34:443".parse().unwrap(),
            state: "ESTABLISHED".into(),
        }]))
    }

    fn fast_poller() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(50),
            query_timeout: Duration::from_secs(1),
        }
    }

    type Events = mpsc::UnboundedReceiver<Option<NormalizedPacketEvent>>;

    fn start_collecting(session: &CaptureSession) -> (CaptureResult<BackendKind>, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = session.start(move |event| {
            let _ = tx.send(event);
        });
        (result, rx)
    }

    async fn next_event(rx: &mut Events) -> Option<NormalizedPacketEvent> {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event delivered in time")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_polling_session_emits_connection_event() {
        let config = PollerConfig::default();
        let session = CaptureSession::new(vec![], example_table(), config);

        let (kind, mut rx) = start_collecting(&session);
        assert_eq!(kind.unwrap(), BackendKind::ConnectionPoll);
        assert_eq!(session.state(), SessionState::Running(BackendKind::ConnectionPoll));

        let event = timeout(config.interval, rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.source_address, "10.0.0.5");
        assert_eq!(event.dest_address, "93.184.216.34");
        assert_eq!(event.ports, Some(PortPair::new(51000, 443)));
        assert!((64..=1563).contains(&event.byte_length.unwrap()));

        session.stop();
    }

    #[tokio::test]
    async fn test_stop_twice_is_quiet() {
        let session = CaptureSession::new(vec![], example_table(), fast_poller());
        let (_, mut rx) = start_collecting(&session);
        next_event(&mut rx).await;

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.is_capturing());

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let session = CaptureSession::new(vec![], example_table(), fast_poller());
        let (first, _rx) = start_collecting(&session);
        assert!(first.is_ok());

        let (second, _rx2) = start_collecting(&session);
        assert!(matches!(second, Err(CaptureError::SessionAlreadyActive)));
        session.stop();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let session = CaptureSession::new(vec![], example_table(), fast_poller());
        let (_, _rx) = start_collecting(&session);
        session.stop();

        let (again, mut rx) = start_collecting(&session);
        assert_eq!(again.unwrap(), BackendKind::ConnectionPoll);
        assert!(next_event(&mut rx).await.is_some());
        session.stop();
    }

    #[test]
    fn test_start_requires_runtime() {
        let session = CaptureSession::new(vec![], example_table(), fast_poller());
        let (result, _rx) = start_collecting(&session);
        assert!(matches!(result, Err(CaptureError::NoRuntime(_))));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_native_frames_reach_consumer_in_order() {
        let backend = FakeBackend::new(vec![
            Ok(Some(frames::tcp([10, 0, 0, 5], [1, 1, 1, 1], 50000, 443, b""))),
            Ok(Some(frames::udp([10, 0, 0, 5], [8, 8, 8, 8], 5353, 53))),
            Ok(Some(vec![0xde, 0xad])),
            Ok(Some(frames::tcp([10, 0, 0, 5], [2, 2, 2, 2], 50001, 443, b""))),
        ]);
        let session =
            CaptureSession::new(vec![Arc::new(backend)], example_table(), fast_poller());

        let (kind, mut rx) = start_collecting(&session);
        assert_eq!(kind.unwrap(), BackendKind::Datalink);

        assert_eq!(next_event(&mut rx).await.unwrap().dest_address, "1.1.1.1");
        assert!(next_event(&mut rx).await.is_none());
        assert_eq!(next_event(&mut rx).await.unwrap().dest_address, "2.2.2.2");

        session.stop();
        let stats = session.stats();
        assert_eq!(stats.events_emitted, 2);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.frames_filtered, 1);
    }

    #[tokio::test]
    async fn test_runtime_fault_downgrades_to_polling() {
        let backend = FakeBackend::new(vec![
            Ok(Some(frames::tcp([10, 0, 0, 5], [1, 1, 1, 1], 50000, 443, b""))),
            Err(CaptureError::BackendRuntimeError("interface went down".into())),
        ]);
        let session =
            CaptureSession::new(vec![Arc::new(backend)], example_table(), fast_poller());
        let mut states = session.subscribe_state();

        let (kind, mut rx) = start_collecting(&session);
        assert_eq!(kind.unwrap(), BackendKind::Datalink);

        assert_eq!(next_event(&mut rx).await.unwrap().dest_address, "1.1.1.1");

        let polled = timeout(
            fast_poller().interval * 4,
            next_event(&mut rx),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(polled.dest_address, "93.184.216.34");

        timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == SessionState::Running(BackendKind::ConnectionPoll)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(session.last_error().unwrap().contains("interface went down"));
        assert!(session
            .attempts()
            .iter()
            .any(|a| a.kind == BackendKind::Datalink));

        session.stop();
    }

    #[tokio::test]
    async fn test_missing_device_falls_back_to_polling() {
        let mut backend = FakeBackend::new(vec![]);
        backend.devices.clear();
        let session =
            CaptureSession::new(vec![Arc::new(backend)], example_table(), fast_poller());

        let (kind, mut rx) = start_collecting(&session);
        assert_eq!(kind.unwrap(), BackendKind::ConnectionPoll);
        assert!(next_event(&mut rx).await.is_some());

        let attempts = session.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error, CaptureError::NoDevicesFound.to_string());
        session.stop();
    }

    #[tokio::test]
    async fn test_failed_query_halts_poller() {
        let session = CaptureSession::new(vec![], Arc::new(FailingTable), fast_poller());
        let (kind, mut rx) = start_collecting(&session);
        assert_eq!(kind.unwrap(), BackendKind::ConnectionPoll);

        tokio::time::sleep(fast_poller().interval * 4).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.stats().poll_failures, 1);
        assert!(!session.is_capturing());
        assert_eq!(session.state(), SessionState::Running(BackendKind::ConnectionPoll));

        session.stop();
    }
}
