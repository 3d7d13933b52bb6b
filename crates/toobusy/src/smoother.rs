//! Smoothing of raw per-tick lag into the busyness signal
//!
//! The default strategy is an exponential moving average with separate decay
//! factors for rising and falling lag. Embedders can swap in their own
//! [`LagFunction`] on a running monitor.

/// Strategy turning a raw lag observation into the next smoothed value
pub trait LagFunction: Send + Sync {
    /// Compute the next smoothed lag from the latest raw observation
    fn next_lag(
        &self,
        raw_lag: f64,
        current_lag: f64,
        factor_on_rise: f64,
        factor_on_fall: f64,
    ) -> f64;
}

impl<F> LagFunction for F
where
    F: Fn(f64, f64, f64, f64) -> f64 + Send + Sync,
{
    fn next_lag(
        &self,
        raw_lag: f64,
        current_lag: f64,
        factor_on_rise: f64,
        factor_on_fall: f64,
    ) -> f64 {
        self(raw_lag, current_lag, factor_on_rise, factor_on_fall)
    }
}

/// Default strategy: asymmetric exponential moving average
#[derive(Debug, Default, Clone, Copy)]
pub struct AsymmetricEma;

impl LagFunction for AsymmetricEma {
    fn next_lag(
        &self,
        raw_lag: f64,
        current_lag: f64,
        factor_on_rise: f64,
        factor_on_fall: f64,
    ) -> f64 {
        smooth(raw_lag, current_lag, factor_on_rise, factor_on_fall)
    }
}

/// A raw value above the current one is a rise; equal or lower is a fall.
pub fn smooth(raw_lag: f64, current_lag: f64, factor_on_rise: f64, factor_on_fall: f64) -> f64 {
    let factor = if raw_lag > current_lag {
        factor_on_rise
    } else {
        factor_on_fall
    };
    factor * raw_lag + (1.0 - factor) * current_lag
}
