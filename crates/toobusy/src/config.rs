//! Lag monitor tunables and their validation rules
//!
//! Every setter on the monitor funnels through the `validate_*` helpers here,
//! so a rejected value never replaces the last accepted one.

use crate::error::{Result, ToobusyError};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_MAX_LAG_MS: f64 = 70.0;
pub const MIN_MAX_LAG_MS: f64 = 10.0;
pub const DEFAULT_INTERVAL_MS: f64 = 500.0;
pub const MIN_INTERVAL_MS: f64 = 16.0;
pub const DEFAULT_SMOOTHING_FACTOR_ON_RISE: f64 = 1.0 / 3.0;
pub const DEFAULT_SMOOTHING_FACTOR_ON_FALL: f64 = 1.0 - 1.0 / 3.0;

pub(crate) const MAX_LAG: &str = "max_lag";
pub(crate) const INTERVAL: &str = "interval";
pub(crate) const SMOOTHING_FACTOR_ON_RISE: &str = "smoothing_factor_on_rise";
pub(crate) const SMOOTHING_FACTOR_ON_FALL: &str = "smoothing_factor_on_fall";

/// Configuration for the lag monitor (all times in milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LagConfig {
    pub max_lag_ms: f64,
    pub interval_ms: f64,
    pub smoothing_factor_on_rise: f64,
    pub smoothing_factor_on_fall: f64,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            max_lag_ms: DEFAULT_MAX_LAG_MS,
            interval_ms: DEFAULT_INTERVAL_MS,
            smoothing_factor_on_rise: DEFAULT_SMOOTHING_FACTOR_ON_RISE,
            smoothing_factor_on_fall: DEFAULT_SMOOTHING_FACTOR_ON_FALL,
        }
    }
}

impl LagConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; a variable that is set but does not
    /// hold an acceptable value is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = read_env("TOOBUSY_MAX_LAG_MS") {
            config.max_lag_ms = validate_max_lag(parse_number(MAX_LAG, &raw)?)?;
        }
        if let Some(raw) = read_env("TOOBUSY_INTERVAL_MS") {
            config.interval_ms = validate_interval(parse_number(INTERVAL, &raw)?)?;
        }
        if let Some(raw) = read_env("TOOBUSY_SMOOTHING_FACTOR_ON_RISE") {
            config.smoothing_factor_on_rise = validate_smoothing_factor(
                SMOOTHING_FACTOR_ON_RISE,
                parse_number(SMOOTHING_FACTOR_ON_RISE, &raw)?,
            )?;
        }
        if let Some(raw) = read_env("TOOBUSY_SMOOTHING_FACTOR_ON_FALL") {
            config.smoothing_factor_on_fall = validate_smoothing_factor(
                SMOOTHING_FACTOR_ON_FALL,
                parse_number(SMOOTHING_FACTOR_ON_FALL, &raw)?,
            )?;
        }

        Ok(config)
    }

    /// Check every field against the same rules the setters apply
    pub fn validate(&self) -> Result<()> {
        validate_max_lag(self.max_lag_ms)?;
        validate_interval(self.interval_ms)?;
        validate_smoothing_factor(SMOOTHING_FACTOR_ON_RISE, self.smoothing_factor_on_rise)?;
        validate_smoothing_factor(SMOOTHING_FACTOR_ON_FALL, self.smoothing_factor_on_fall)?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        millis_to_duration(self.interval_ms)
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Parse a textual setting value, failing with `InvalidArgument` when it is
/// not a finite number.
pub fn parse_number(setting: &'static str, raw: &str) -> Result<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ToobusyError::invalid(setting, raw))?;
    ensure_number(setting, value)
}

fn ensure_number(setting: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ToobusyError::invalid(setting, value))
    }
}

pub(crate) fn validate_max_lag(value: f64) -> Result<f64> {
    let value = ensure_number(MAX_LAG, value)?;
    if value < MIN_MAX_LAG_MS {
        return Err(ToobusyError::below_minimum(MAX_LAG, value, MIN_MAX_LAG_MS));
    }
    Ok(value)
}

pub(crate) fn validate_interval(value: f64) -> Result<f64> {
    let value = ensure_number(INTERVAL, value)?;
    if value < MIN_INTERVAL_MS {
        return Err(ToobusyError::below_minimum(INTERVAL, value, MIN_INTERVAL_MS));
    }
    Ok(value)
}

/// Factors live in (0, 1]; 1 disables smoothing in that direction.
pub(crate) fn validate_smoothing_factor(setting: &'static str, value: f64) -> Result<f64> {
    if value.is_nan() {
        return Err(ToobusyError::invalid(setting, value));
    }
    if value <= 0.0 || value > 1.0 {
        return Err(ToobusyError::OutOfRange {
            setting,
            value,
            expected: "should be in (0, 1]".to_string(),
        });
    }
    Ok(value)
}

pub(crate) fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_secs_f64(ms / 1000.0)
}
