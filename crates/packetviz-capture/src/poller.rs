//! Fallback poller
//!
//! Without raw frame access, traffic is approximated by sampling one
//! established TCP connection from the OS connection table per tick.

use crate::emitter::Emitter;
use crate::error::CaptureError;
use crate::netstat::{ConnectionRow, ConnectionTable};
use chrono::{DateTime, Utc};
use packetviz_core::config::CaptureSettings;
use packetviz_core::{NormalizedPacketEvent, PortPair};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Range of the synthesized `byte_length`
pub const SYNTHETIC_SIZE: RangeInclusive<u64> = 64..=1563;

/// Poller timing
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub query_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            query_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&CaptureSettings> for PollerConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.poll_interval_ms),
            query_timeout: Duration::from_millis(settings.query_timeout_ms),
        }
    }
}

/// Pick one qualifying connection uniformly at random and turn it into an
/// event.
///
/// A row qualifies when it is `ESTABLISHED`, neither endpoint is a loopback
/// address, and both endpoints are IPv4 (IPv4-mapped IPv6 included).
pub fn sample_connection<R: Rng>(
    rows: &[ConnectionRow],
    rng: &mut R,
    observed_at: DateTime<Utc>,
) -> Option<NormalizedPacketEvent> {
    let candidates: Vec<(SocketAddr, Ipv4Addr, SocketAddr, Ipv4Addr)> = rows
        .iter()
        .filter(|row| row.is_established())
        .filter_map(|row| {
            let local_ip = ipv4_of(row.local.ip())?;
            let remote_ip = ipv4_of(row.remote.ip())?;
            // ::ffff:127.0.0.1 is only recognisable after conversion
            if local_ip.is_loopback() || remote_ip.is_loopback() {
                return None;
            }
            Some((row.local, local_ip, row.remote, remote_ip))
        })
        .collect();

    let (local, local_ip, remote, remote_ip) = candidates.choose(rng)?;
    let size = rng.gen_range(SYNTHETIC_SIZE);

    NormalizedPacketEvent::tcp(
        *local_ip,
        *remote_ip,
        observed_at,
        Some(size),
        Some(PortPair::new(local.port(), remote.port())),
    )
}

fn ipv4_of(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Cancellable handle on a running poller task
pub struct PollHandle {
    task: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl PollHandle {
    /// Stop the poller. No tick starts after this returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    /// True once the poller halted on its own or was cancelled
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Start polling `table` on `runtime`, delivering through `emitter`.
///
/// The first tick fires immediately. A failed or timed-out query halts the
/// poller for good.
pub(crate) fn spawn_poller(
    runtime: &Handle,
    table: Arc<dyn ConnectionTable>,
    config: PollerConfig,
    emitter: Emitter,
) -> PollHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let task_cancelled = Arc::clone(&cancelled);

    let task = runtime.spawn(async move {
        info!(
            "Connection polling started (interval {:?}, query timeout {:?})",
            config.interval, config.query_timeout
        );

        let mut rng = StdRng::from_entropy();
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if task_cancelled.load(Ordering::SeqCst) {
                break;
            }

            let rows = match tokio::time::timeout(config.query_timeout, table.query()).await {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    error!("{}, connection polling stopped", e);
                    emitter.counters().poll_failed();
                    break;
                }
                Err(_) => {
                    let e = CaptureError::PollQueryFailure(format!(
                        "query timed out after {:?}",
                        config.query_timeout
                    ));
                    error!("{}, connection polling stopped", e);
                    emitter.counters().poll_failed();
                    break;
                }
            };

            match sample_connection(&rows, &mut rng, Utc::now()) {
                Some(event) => {
                    if !emitter.emit(Some(event)) {
                        break;
                    }
                }
                None => debug!("No established external connections this tick"),
            }
        }
    });

    PollHandle { task, cancelled }
}
