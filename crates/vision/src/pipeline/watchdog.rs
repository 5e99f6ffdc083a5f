//! Heartbeat watchdogs.
//!
//! Each liveness source (one per camera) owns a [`Watchdog`]. The camera
//! thread calls [`Watchdog::heartbeat`] per published frame; a monitor thread
//! polls once a second and publishes a timeout event when the source goes
//! quiet. Firing resets the clock so one stall yields one event per timeout
//! period. Remediation is left to whoever consumes the event.

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::{error, info};
use video_ingest::{MachineId, sleep_while_running};

use crate::pipeline::{
    events::{EventBus, SystemEvent},
    telemetry::{self, WorkerHandle},
};

/// Sleep interval between health checks.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Component a watchdog is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchdogSource {
    pub machine_id: MachineId,
    pub component: &'static str,
}

impl fmt::Display for WatchdogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.component)
    }
}

pub struct Watchdog {
    source: WatchdogSource,
    timeout: Duration,
    origin: Instant,
    /// Milliseconds since `origin` of the last heartbeat.
    last_beat_ms: AtomicU64,
    running: AtomicBool,
}

impl Watchdog {
    pub fn new(source: WatchdogSource, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            origin: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    pub fn source(&self) -> WatchdogSource {
        self.source
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn heartbeat(&self) {
        self.last_beat_ms.store(self.now_ms(), Ordering::Release);
    }

    /// Time since the last heartbeat (or since creation).
    pub fn elapsed(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Returns the stall length and resets the clock when the timeout has
    /// been exceeded.
    pub fn check(&self) -> Option<Duration> {
        let elapsed = self.elapsed();
        if elapsed > self.timeout {
            self.heartbeat();
            Some(elapsed)
        } else {
            None
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Spawn the monitor thread for `watchdog`.
pub(crate) fn spawn_watchdog(
    watchdog: Arc<Watchdog>,
    poll: Duration,
    bus: EventBus,
) -> io::Result<WorkerHandle> {
    let source = watchdog.source();
    telemetry::spawn_worker(format!("watchdog-{}", source.machine_id.0), move || {
        info!(
            "{}: watchdog started for {} (timeout {:?})",
            source.machine_id,
            source.component,
            watchdog.timeout()
        );
        while sleep_while_running(&watchdog.running, poll) {
            if let Some(elapsed) = watchdog.check() {
                error!(
                    "{}: watchdog timeout for {}: {:.1}s",
                    source.machine_id,
                    source.component,
                    elapsed.as_secs_f32()
                );
                metrics::counter!("monitor_watchdog_timeouts_total").increment(1);
                bus.publish(SystemEvent::WatchdogTimeout { source, elapsed });
            }
        }
        info!("{}: watchdog stopped for {}", source.machine_id, source.component);
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn source() -> WatchdogSource {
        WatchdogSource {
            machine_id: MachineId(2),
            component: "camera",
        }
    }

    #[test]
    fn fires_once_per_stall_then_resets() {
        let watchdog = Watchdog::new(source(), Duration::from_millis(40));
        assert_eq!(watchdog.check(), None);
        thread::sleep(Duration::from_millis(60));
        assert!(watchdog.check().is_some());
        assert_eq!(watchdog.check(), None);
    }

    #[test]
    fn heartbeats_keep_it_quiet() {
        let watchdog = Watchdog::new(source(), Duration::from_millis(80));
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(30));
            watchdog.heartbeat();
            assert_eq!(watchdog.check(), None);
        }
    }

    #[test]
    fn monitor_thread_publishes_timeouts_and_stops() {
        let (bus, events) = EventBus::new(8, false);
        let watchdog = Arc::new(Watchdog::new(source(), Duration::from_millis(30)));
        let mut handle =
            spawn_watchdog(watchdog.clone(), Duration::from_millis(20), bus).unwrap();

        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            SystemEvent::WatchdogTimeout { source: fired, elapsed } => {
                assert_eq!(fired, source());
                assert!(elapsed > Duration::from_millis(30));
            }
            other => panic!("unexpected event {other:?}"),
        }

        watchdog.stop();
        assert!(handle.join_timeout(Duration::from_secs(1)));
    }
}
