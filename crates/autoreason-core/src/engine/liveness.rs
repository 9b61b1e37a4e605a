//! Cooperative liveness reporting.
//!
//! An engine signals activity at safe points (before each queued action and
//! wherever its rule chooses). [`NotRespondingMonitor`] polls a [`Watchdog`]
//! from its own thread to detect a stalled cycle; nothing here can
//! interrupt a running check.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, Utc};

pub trait Liveness: Send + Sync {
    /// Record that the caller is making progress.
    fn set_active(&self);
    /// Suspend stall detection around a known long operation.
    fn pause_check(&self);
    /// Resume stall detection after [`Liveness::pause_check`].
    fn resume_check(&self);
}

pub type SharedLiveness = Arc<dyn Liveness>;

/// Sink used when nobody supervises the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLiveness;

impl Liveness for NoopLiveness {
    fn set_active(&self) {}
    fn pause_check(&self) {}
    fn resume_check(&self) {}
}

/// Records the last activity instant so a host loop can detect a
/// non-responding engine.
#[derive(Debug)]
pub struct Watchdog {
    last_active_ms: AtomicI64,
    pause_depth: AtomicU32,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            pause_depth: AtomicU32::new(0),
        }
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        let ms = self.last_active_ms.load(Ordering::Acquire);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    pub fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::Acquire) > 0
    }

    /// False when the last activity is older than `timeout` at `now` and no
    /// pause is in effect.
    pub fn is_responding(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.is_paused() || now - self.last_active() <= timeout
    }
}

impl Liveness for Watchdog {
    fn set_active(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn pause_check(&self) {
        self.pause_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn resume_check(&self) {
        // Saturate at zero so an unbalanced resume cannot wrap around.
        let _ = self
            .pause_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
        self.set_active();
    }
}

// ---------------------------------------------------------------------------
// NotRespondingMonitor
// ---------------------------------------------------------------------------

/// Background thread polling a [`Watchdog`] while passes run.
///
/// Trips at most once: logs an error and calls `on_trip` the first time the
/// watchdog has been silent for longer than `timeout`. Stopped on drop.
pub struct NotRespondingMonitor {
    stop: Arc<AtomicBool>,
    tripped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NotRespondingMonitor {
    pub fn spawn<F>(
        watchdog: Arc<Watchdog>,
        timeout: Duration,
        poll: std::time::Duration,
        on_trip: F,
    ) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let tripped = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let tripped_flag = tripped.clone();
        let handle = thread::Builder::new()
            .name("autoreason-watchdog".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(poll);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    if watchdog.is_responding(timeout, Utc::now()) {
                        continue;
                    }
                    if !tripped_flag.swap(true, Ordering::AcqRel) {
                        tracing::error!(
                            last_active = %watchdog.last_active(),
                            timeout_ms = timeout.num_milliseconds(),
                            "engine not responding"
                        );
                        on_trip();
                    }
                }
            })?;
        Ok(Self {
            stop,
            tripped,
            handle: Some(handle),
        })
    }

    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Stop polling and wait for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NotRespondingMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
