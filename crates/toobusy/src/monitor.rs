//! Lag monitor: configuration, smoothed lag state, listeners and lifecycle
//!
//! A [`LagMonitor`] owns one sampler task on a Tokio runtime. Queries read the
//! latest smoothed value without waiting for a tick; setters validate and take
//! effect from the next tick on.

use crate::config::{
    self, millis_to_duration, LagConfig, SMOOTHING_FACTOR_ON_FALL, SMOOTHING_FACTOR_ON_RISE,
};
use crate::error::Result;
use crate::notifier::{panic_message, LagCallback, ListenerId, Notifier};
use crate::sampler::{self, Control};
use crate::smoother::{AsymmetricEma, LagFunction};
use atomic_float::AtomicF64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

thread_local! {
    // Address of the `Shared` whose evaluation pass this thread is running
    static IN_PASS: Cell<usize> = const { Cell::new(0) };
}

fn pass_key(shared: &Shared) -> usize {
    shared as *const Shared as usize
}

struct PassGuard {
    previous: usize,
}

impl PassGuard {
    fn enter(shared: &Shared) -> Self {
        let previous = IN_PASS.with(|f| f.replace(pass_key(shared)));
        PassGuard { previous }
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        IN_PASS.with(|f| f.set(self.previous));
    }
}

fn in_pass(shared: &Shared) -> bool {
    IN_PASS.with(|f| f.get() == pass_key(shared))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of a monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LagSnapshot {
    pub current_lag_ms: f64,
    pub max_lag_ms: f64,
    pub interval_ms: f64,
    pub smoothing_factor_on_rise: f64,
    pub smoothing_factor_on_fall: f64,
    pub busy: bool,
    pub started: bool,
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample_at: Option<String>,
}

#[derive(Debug, Default)]
struct LagState {
    current: f64,
    // Bumped by every reset so an in-flight sample can tell it is stale
    generation: u64,
    samples: u64,
    last_sample_at: Option<DateTime<Utc>>,
}

/// State shared between a monitor handle and its sampler task
pub(crate) struct Shared {
    config: RwLock<LagConfig>,
    lag_function: RwLock<Arc<dyn LagFunction>>,
    // Writes are serialized through `state`; `current_lag` mirrors it for
    // lock-free reads.
    state: Mutex<LagState>,
    current_lag: AtomicF64,
    notifier: Notifier,
    running: AtomicBool,
    pass: Mutex<()>,
}

impl Shared {
    pub(crate) fn new(config: LagConfig) -> Self {
        Self {
            config: RwLock::new(config),
            lag_function: RwLock::new(Arc::new(AsymmetricEma)),
            state: Mutex::new(LagState::default()),
            current_lag: AtomicF64::new(0.0),
            notifier: Notifier::new(),
            running: AtomicBool::new(true),
            pass: Mutex::new(()),
        }
    }

    pub(crate) fn config(&self) -> LagConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_config(&self, apply: impl FnOnce(&mut LagConfig)) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut config);
    }

    fn lag_function(&self) -> Arc<dyn LagFunction> {
        self.lag_function
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn current_lag(&self) -> f64 {
        self.current_lag.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drop the smoothed lag back to zero
    pub(crate) fn reset_lag(&self) {
        let mut state = lock(&self.state);
        state.current = 0.0;
        state.generation = state.generation.wrapping_add(1);
        state.samples = 0;
        state.last_sample_at = None;
        self.current_lag.store(0.0, Ordering::Release);
    }

    /// Fold one raw observation into the smoothed lag, then notify listeners.
    ///
    /// `interval` is the period the sample was measured against; a sample
    /// from a cadence that has since been replaced is dropped. A lag function
    /// that panics or yields a non-finite value loses only this tick and the
    /// previous smoothed value is kept. The lag function runs without any
    /// state lock held, so it may call back into its own monitor.
    pub(crate) fn on_sample(&self, interval: Duration, raw_lag: f64) {
        if !self.is_running() {
            return;
        }
        let _pass = lock(&self.pass);
        if !self.is_running() {
            return;
        }
        let _in_pass = PassGuard::enter(self);

        let config = self.config();
        if config.interval() != interval {
            debug!(raw_lag_ms = raw_lag, "Sample from a replaced interval dropped");
            return;
        }
        let lag_function = self.lag_function();
        let (current, generation) = {
            let state = lock(&self.state);
            (state.current, state.generation)
        };

        let next = panic::catch_unwind(AssertUnwindSafe(|| {
            lag_function.next_lag(
                raw_lag,
                current,
                config.smoothing_factor_on_rise,
                config.smoothing_factor_on_fall,
            )
        }));
        let lag = match next {
            Ok(next) if next.is_finite() => next,
            Ok(next) => {
                warn!(
                    raw_lag_ms = raw_lag,
                    result = next,
                    "Lag function returned a non-finite value; sample dropped"
                );
                return;
            }
            Err(payload) => {
                warn!(
                    raw_lag_ms = raw_lag,
                    panic = %panic_message(payload.as_ref()),
                    "Lag function panicked; sample dropped"
                );
                return;
            }
        };

        {
            let mut state = lock(&self.state);
            if state.generation != generation
                || !self.is_running()
                || self.config().interval() != interval
            {
                debug!(raw_lag_ms = raw_lag, "Lag reset while sampling; sample dropped");
                return;
            }
            state.current = lag;
            state.samples += 1;
            state.last_sample_at = Some(Utc::now());
            self.current_lag.store(lag, Ordering::Release);
        }

        debug!(raw_lag_ms = raw_lag, lag_ms = lag, "Lag sample");

        self.notifier
            .evaluate(lag, config.max_lag_ms, || self.is_running());
    }
}

/// Measures scheduling lag of the Tokio runtime it was spawned on.
///
/// Dropping the monitor stops its sampler.
pub struct LagMonitor {
    shared: Arc<Shared>,
    control: watch::Sender<Control>,
    // Held across every start and stop of the sampler task
    task: Mutex<Option<JoinHandle<()>>>,
    handle: Handle,
}

impl LagMonitor {
    /// Start a monitor on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside the context of a Tokio runtime, like
    /// `tokio::spawn`.
    pub fn spawn(config: LagConfig) -> Result<Self> {
        Self::spawn_on(config, &Handle::current())
    }

    /// Start a monitor whose sampler runs on `handle`'s runtime
    pub fn spawn_on(config: LagConfig, handle: &Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self::start(config, handle))
    }

    pub(crate) fn start(config: LagConfig, handle: &Handle) -> Self {
        let shared = Arc::new(Shared::new(config));
        let (control, rx) = watch::channel(Control::Run(config.interval()));
        let task = handle.spawn(sampler::run(shared.clone(), rx));

        info!(
            max_lag_ms = config.max_lag_ms,
            interval_ms = config.interval_ms,
            smoothing_factor_on_rise = config.smoothing_factor_on_rise,
            smoothing_factor_on_fall = config.smoothing_factor_on_fall,
            "Lag monitor started"
        );

        Self {
            shared,
            control,
            task: Mutex::new(Some(task)),
            handle: handle.clone(),
        }
    }

    pub fn config(&self) -> LagConfig {
        self.shared.config()
    }

    pub fn max_lag(&self) -> f64 {
        self.config().max_lag_ms
    }

    /// Set the busyness threshold (ms); must be at least 10
    pub fn set_max_lag(&self, max_lag_ms: f64) -> Result<f64> {
        let value = config::validate_max_lag(max_lag_ms)?;
        self.shared.update_config(|c| c.max_lag_ms = value);
        info!(max_lag_ms = value, "Max lag updated");
        Ok(value)
    }

    pub fn interval(&self) -> f64 {
        self.config().interval_ms
    }

    /// Set the sampling period (ms, at least 16).
    ///
    /// The pending timer is re-armed with the new period and the smoothed lag
    /// restarts from zero. On a monitor that was shut down this starts
    /// sampling again, with no listeners.
    pub fn set_interval(&self, interval_ms: f64) -> Result<f64> {
        let value = config::validate_interval(interval_ms)?;
        let interval = millis_to_duration(value);
        self.shared.update_config(|c| c.interval_ms = value);
        self.shared.reset_lag();

        let mut task = lock(&self.task);
        self.control.send_replace(Control::Run(interval));
        if !self.shared.running.swap(true, Ordering::AcqRel) {
            let rx = self.control.subscribe();
            *task = Some(self.handle.spawn(sampler::run(self.shared.clone(), rx)));
            info!(interval_ms = value, "Lag monitor restarted");
        } else {
            info!(interval_ms = value, "Sampling interval updated");
        }
        Ok(value)
    }

    pub fn smoothing_factor_on_rise(&self) -> f64 {
        self.config().smoothing_factor_on_rise
    }

    pub fn set_smoothing_factor_on_rise(&self, factor: f64) -> Result<f64> {
        let value = config::validate_smoothing_factor(SMOOTHING_FACTOR_ON_RISE, factor)?;
        self.shared
            .update_config(|c| c.smoothing_factor_on_rise = value);
        info!(smoothing_factor_on_rise = value, "Smoothing factor updated");
        Ok(value)
    }

    pub fn smoothing_factor_on_fall(&self) -> f64 {
        self.config().smoothing_factor_on_fall
    }

    pub fn set_smoothing_factor_on_fall(&self, factor: f64) -> Result<f64> {
        let value = config::validate_smoothing_factor(SMOOTHING_FACTOR_ON_FALL, factor)?;
        self.shared
            .update_config(|c| c.smoothing_factor_on_fall = value);
        info!(smoothing_factor_on_fall = value, "Smoothing factor updated");
        Ok(value)
    }

    /// Replace the smoothing strategy; used from the next tick on
    pub fn set_lag_function<F>(&self, lag_function: F)
    where
        F: LagFunction + 'static,
    {
        *self
            .shared
            .lag_function
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(lag_function);
        debug!("Lag function replaced");
    }

    /// Register a listener fired after every sample whose smoothed lag exceeds
    /// `threshold`, or the live max lag when `threshold` is `None`.
    ///
    /// There is no edge detection: a listener fires on every qualifying tick
    /// until it is removed or the monitor shuts down.
    pub fn on_lag<F>(&self, callback: F, threshold: Option<f64>) -> ListenerId
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        let callback: LagCallback = Arc::new(callback);
        let id = self.shared.notifier.register(callback, threshold);
        debug!(listener = %id, threshold_ms = ?threshold, "Lag listener registered");
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.notifier.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.notifier.len()
    }

    /// True when the smoothed lag exceeds the max lag. Never waits for a tick.
    pub fn is_busy(&self) -> bool {
        self.current_lag() > self.max_lag()
    }

    /// Latest smoothed lag in milliseconds
    pub fn current_lag(&self) -> f64 {
        self.shared.current_lag()
    }

    /// Latest smoothed lag rounded to whole milliseconds
    pub fn lag_ms(&self) -> u64 {
        self.current_lag().round() as u64
    }

    pub fn started(&self) -> bool {
        self.shared.is_running()
            && lock(&self.task)
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    pub fn snapshot(&self) -> LagSnapshot {
        let config = self.config();
        let (samples, last_sample_at) = {
            let state = lock(&self.shared.state);
            (state.samples, state.last_sample_at)
        };
        let current_lag_ms = self.current_lag();

        LagSnapshot {
            current_lag_ms,
            max_lag_ms: config.max_lag_ms,
            interval_ms: config.interval_ms,
            smoothing_factor_on_rise: config.smoothing_factor_on_rise,
            smoothing_factor_on_fall: config.smoothing_factor_on_fall,
            busy: current_lag_ms > config.max_lag_ms,
            started: self.started(),
            samples,
            last_sample_at: last_sample_at.map(|ts| ts.to_rfc3339()),
        }
    }

    /// Restart the smoothed lag from zero without touching the schedule
    pub fn reset(&self) {
        self.shared.reset_lag();
        debug!("Lag reset to baseline");
    }

    /// Stop sampling and drop every listener.
    ///
    /// Once this returns no listener fires again and the smoothed lag stays at
    /// its last value until [`set_interval`](Self::set_interval) restarts
    /// sampling. Safe to call repeatedly, including from a listener or a lag
    /// function.
    pub fn shutdown(&self) {
        let was_running = {
            let mut task = lock(&self.task);
            let was_running = self.shared.running.swap(false, Ordering::AcqRel);
            if was_running {
                self.control.send_replace(Control::Stop);
                if let Some(task) = task.take() {
                    task.abort();
                }
            }
            was_running
        };

        // Wait out a pass running on another thread
        if was_running && !in_pass(&self.shared) {
            drop(lock(&self.shared.pass));
        }

        let removed = self.shared.notifier.clear();
        if was_running {
            info!(
                lag_ms = self.current_lag(),
                listeners_removed = removed,
                "Lag monitor shut down"
            );
        }
    }
}

impl Drop for LagMonitor {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.control.send_replace(Control::Stop);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
