//! toobusy - admission control driven by runtime scheduling lag
//!
//! A background task on the host Tokio runtime repeatedly sleeps for a fixed
//! interval and measures how late it wakes up. Those raw delays are smoothed
//! into a single busyness signal that callers query with [`is_busy`] before
//! accepting work, or subscribe to with [`on_lag`].
//!
//! ```no_run
//! # async fn handle() -> Result<(), &'static str> {
//! if toobusy::is_busy() {
//!     return Err("server too busy");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod global;
pub mod monitor;
pub mod notifier;
pub mod sampler;
pub mod smoother;

pub use config::{parse_number, LagConfig};
pub use error::{Result, ToobusyError};
pub use global::{
    current_lag, global, init, interval, is_busy, lag_ms, max_lag, on_lag, remove_listener,
    reset, set_interval, set_lag_function, set_max_lag, set_smoothing_factor_on_fall,
    set_smoothing_factor_on_rise, shutdown, smoothing_factor_on_fall, smoothing_factor_on_rise,
    snapshot, started,
};
pub use monitor::{LagMonitor, LagSnapshot};
pub use notifier::{LagCallback, ListenerId};
pub use sampler::Sample;
pub use smoother::{smooth, AsymmetricEma, LagFunction};
