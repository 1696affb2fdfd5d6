//! Repeating ticker owned by its caller and cancelled through its handle.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// What the ticker does after a tick callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    /// Keep ticking
    Continue,
    /// End the ticker
    Stop,
}

/// Runs a callback every `period`, first fire one period after spawning.
///
/// Dropping the ticker cancels it.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Spawn a ticker on the current runtime
    pub fn spawn<F, Fut>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if on_tick().await == TickControl::Stop {
                    debug!("Ticker with period {:?} stopped by its callback", period);
                    break;
                }
            }
        });

        Self { period, task }
    }

    /// Tick period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cancel any pending tick
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the ticker has ended (cancelled or stopped by its callback)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
