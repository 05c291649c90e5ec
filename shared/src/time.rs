/*!
Time sources and cooperative polling.

Every wait in the acquisition core goes through a [`Poller`], which pairs a
[`TimeSource`] with the shared running flag. Production code uses
[`SystemClock`]; tests and the simulator drive a [`VirtualClock`] so that
multi-second acquisition runs complete instantly and deterministically.
*/

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Source of "now" in milliseconds since the Unix epoch (UTC)
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;

    /// Block for `duration`. Virtual clocks advance instead of blocking.
    fn sleep(&self, duration: Duration);
}

/// Host system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Manually driven clock; `sleep` advances time instead of blocking
#[derive(Debug)]
pub struct VirtualClock {
    now_ms: AtomicI64,
}

impl VirtualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as i64);
    }
}

/// Outcome of [`Poller::poll_until`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled<T> {
    Ready(T),
    Expired,
    Stopped,
}

/// Time source plus the cooperative running flag
#[derive(Clone)]
pub struct Poller {
    time: Arc<dyn TimeSource>,
    running: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(time: Arc<dyn TimeSource>, running: Arc<AtomicBool>) -> Self {
        Self { time, running }
    }

    /// Poller on the system clock with a fresh running flag
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(AtomicBool::new(true)))
    }

    pub fn now_ms(&self) -> i64 {
        self.time.now_ms()
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sleep unless a stop has been requested. Returns false when stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        self.time.sleep(duration);
        self.is_running()
    }

    /// Sleep in `slice` steps until `deadline_ms`. Returns false when stopped.
    pub fn sleep_until(&self, deadline_ms: i64, slice: Duration) -> bool {
        let slice_ms = (slice.as_millis() as i64).max(1);
        loop {
            if !self.is_running() {
                return false;
            }
            let remaining = deadline_ms - self.now_ms();
            if remaining <= 0 {
                return true;
            }
            self.time
                .sleep(Duration::from_millis(remaining.min(slice_ms) as u64));
        }
    }

    /// Call `attempt` every `interval` until it yields a value, the deadline
    /// passes or the running flag is cleared. `attempt` always runs at least
    /// once while running.
    pub fn poll_until<T, F>(&self, deadline_ms: i64, interval: Duration, mut attempt: F) -> Result<Polled<T>>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let interval_ms = (interval.as_millis() as i64).max(1);
        loop {
            if !self.is_running() {
                return Ok(Polled::Stopped);
            }
            if let Some(value) = attempt()? {
                return Ok(Polled::Ready(value));
            }
            let remaining = deadline_ms - self.now_ms();
            if remaining <= 0 {
                return Ok(Polled::Expired);
            }
            self.time
                .sleep(Duration::from_millis(remaining.min(interval_ms) as u64));
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("now_ms", &self.now_ms())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Render epoch milliseconds as `2008-04-06 16:49:03.000 UTC` for logs
pub fn format_millis(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("{} ms", ms),
    }
}
