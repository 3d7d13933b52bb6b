//! Process-wide monitor and free-function facade
//!
//! The shared instance is created either explicitly at startup with [`init`]
//! or lazily, with default configuration, by the first call to [`global`] or
//! any free function below. Either way it starts sampling immediately; after
//! [`shutdown`] it stays stopped until [`set_interval`] starts it again.

use crate::config::LagConfig;
use crate::error::Result;
use crate::monitor::{LagMonitor, LagSnapshot};
use crate::notifier::ListenerId;
use crate::smoother::LagFunction;
use once_cell::sync::OnceCell;
use tokio::runtime::Handle;
use tracing::warn;

static GLOBAL: OnceCell<LagMonitor> = OnceCell::new();

/// Initialize the shared monitor with `config`, sampling on `handle`.
///
/// If the monitor already exists it is returned unchanged and `config` is
/// ignored.
pub fn init(config: LagConfig, handle: &Handle) -> Result<&'static LagMonitor> {
    config.validate()?;
    let mut created = false;
    let monitor = GLOBAL.get_or_init(|| {
        created = true;
        LagMonitor::start(config, handle)
    });
    if !created {
        warn!("Global lag monitor already initialized; ignoring new configuration");
    }
    Ok(monitor)
}

/// The shared monitor, created with defaults on first use.
///
/// # Panics
///
/// The first call panics if made outside the context of a Tokio runtime.
pub fn global() -> &'static LagMonitor {
    GLOBAL.get_or_init(|| LagMonitor::start(LagConfig::default(), &Handle::current()))
}

/// True when the process is too busy to take on more work
pub fn is_busy() -> bool {
    global().is_busy()
}

pub fn current_lag() -> f64 {
    global().current_lag()
}

pub fn lag_ms() -> u64 {
    global().lag_ms()
}

pub fn max_lag() -> f64 {
    global().max_lag()
}

pub fn set_max_lag(max_lag_ms: f64) -> Result<f64> {
    global().set_max_lag(max_lag_ms)
}

pub fn interval() -> f64 {
    global().interval()
}

pub fn set_interval(interval_ms: f64) -> Result<f64> {
    global().set_interval(interval_ms)
}

pub fn smoothing_factor_on_rise() -> f64 {
    global().smoothing_factor_on_rise()
}

pub fn set_smoothing_factor_on_rise(factor: f64) -> Result<f64> {
    global().set_smoothing_factor_on_rise(factor)
}

pub fn smoothing_factor_on_fall() -> f64 {
    global().smoothing_factor_on_fall()
}

pub fn set_smoothing_factor_on_fall(factor: f64) -> Result<f64> {
    global().set_smoothing_factor_on_fall(factor)
}

pub fn set_lag_function<F>(lag_function: F)
where
    F: LagFunction + 'static,
{
    global().set_lag_function(lag_function)
}

pub fn on_lag<F>(callback: F, threshold: Option<f64>) -> ListenerId
where
    F: Fn(f64) + Send + Sync + 'static,
{
    global().on_lag(callback, threshold)
}

pub fn remove_listener(id: ListenerId) -> bool {
    global().remove_listener(id)
}

pub fn started() -> bool {
    global().started()
}

pub fn snapshot() -> LagSnapshot {
    global().snapshot()
}

pub fn reset() {
    global().reset()
}

pub fn shutdown() {
    global().shutdown()
}
