use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Configurable ticker interface
pub trait Ticker: Send + Sync + 'static {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Cadences of the two periodic callbacks that run while an attempt is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub tick_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// A periodic callback running as a task on the current runtime.
///
/// The first call happens one interval after spawning and missed ticks are
/// skipped, never burst. Stopping prevents further calls but lets a call
/// that is already running finish, so an in-flight request is never cut off.
#[derive(Debug)]
pub struct Periodic {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Periodic {
    pub fn spawn<T, F, Fut>(ticker: T, mut callback: F) -> Self
    where
        T: Ticker,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let period = ticker.interval();
        let stop = Arc::new(Notify::new());
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.notified() => break,
                    _ = interval.tick() => {}
                }
                if callback().await.is_break() {
                    break;
                }
            }
        });
        Self { stop, handle }
    }

    /// Idempotent. A stop requested mid-call takes effect once the call returns.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}
