use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of absolute wall-clock time in epoch milliseconds.
pub trait WallClock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Shared handles see the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now.fetch_add(secs * 1000, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    Running { remaining_secs: u64 },
    /// Fired once, on the first tick at or past the deadline.
    Expired,
    Stopped,
}

/// Countdown anchored to a persisted start timestamp.
///
/// Remaining time is always derived from `started_at_ms` and the wall clock,
/// never decremented, so a reload resumes exactly where the deadline says.
pub struct SessionClock {
    started_at_ms: i64,
    duration_secs: u64,
    wall: Arc<dyn WallClock>,
    stopped: bool,
}

impl SessionClock {
    pub fn new(started_at_ms: i64, duration_secs: u64, wall: Arc<dyn WallClock>) -> Self {
        Self {
            started_at_ms,
            duration_secs,
            wall,
            stopped: false,
        }
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn deadline_ms(&self) -> i64 {
        let duration_ms = i64::try_from(self.duration_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        self.started_at_ms.saturating_add(duration_ms)
    }

    pub fn remaining_ms(&self) -> i64 {
        self.deadline_ms().saturating_sub(self.wall.now_ms()).max(0)
    }

    /// Whole seconds left, rounded up.
    pub fn remaining_secs(&self) -> u64 {
        let ms = self.remaining_ms() as u64;
        ms.div_ceil(1000)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn tick(&mut self) -> ClockTick {
        if self.stopped {
            return ClockTick::Stopped;
        }
        match self.remaining_secs() {
            0 => {
                self.stopped = true;
                ClockTick::Expired
            }
            remaining_secs => ClockTick::Running { remaining_secs },
        }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}
