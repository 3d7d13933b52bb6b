//! Background sampling loop measuring timer lag on the host runtime
//!
//! The loop sleeps for one interval and measures how late the wakeup was.
//! The next sleep is armed from the instant the previous one fired, so one
//! slow tick is reported once instead of drifting into every later tick.

use crate::monitor::Shared;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::debug;

/// Commands delivered to a running sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Sample with this period; a new value re-arms the pending timer
    Run(Duration),
    Stop,
}

/// One tick's timing, alive only while the tick is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub scheduled_at: Instant,
    pub fired_at: Instant,
    pub interval: Duration,
}

impl Sample {
    /// How much later than `scheduled_at + interval` the tick fired, in ms.
    /// Early wakeups count as zero.
    pub fn raw_lag_ms(&self) -> f64 {
        let elapsed = self.fired_at.saturating_duration_since(self.scheduled_at);
        let late_by = elapsed.saturating_sub(self.interval);
        late_by.as_nanos() as f64 / 1_000_000.0
    }
}

pub(crate) async fn run(shared: Arc<Shared>, mut control: watch::Receiver<Control>) {
    let mut scheduled_at = Instant::now();

    loop {
        let interval = match *control.borrow_and_update() {
            Control::Run(interval) => interval,
            Control::Stop => break,
        };

        tokio::select! {
            biased;

            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                scheduled_at = Instant::now();
            }
            _ = time::sleep_until(scheduled_at + interval) => {
                let fired_at = Instant::now();
                let sample = Sample { scheduled_at, fired_at, interval };
                scheduled_at = fired_at;
                shared.on_sample(sample.interval, sample.raw_lag_ms());
            }
        }
    }

    debug!("Lag sampler stopped");
}
