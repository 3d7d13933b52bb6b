//! Errors raised synchronously by configuration setters

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToobusyError {
    #[error("{setting} must be a number (got {value:?})")]
    InvalidArgument { setting: &'static str, value: String },

    #[error("{setting} {expected} (got {value})")]
    OutOfRange {
        setting: &'static str,
        value: f64,
        expected: String,
    },
}

impl ToobusyError {
    pub(crate) fn invalid(setting: &'static str, value: impl ToString) -> Self {
        Self::InvalidArgument {
            setting,
            value: value.to_string(),
        }
    }

    pub(crate) fn below_minimum(setting: &'static str, value: f64, min: f64) -> Self {
        Self::OutOfRange {
            setting,
            value,
            expected: format!("should be greater than {}", min),
        }
    }

    /// Name of the setting the rejected value was meant for
    pub fn setting(&self) -> &'static str {
        match self {
            Self::InvalidArgument { setting, .. } | Self::OutOfRange { setting, .. } => setting,
        }
    }
}

pub type Result<T> = std::result::Result<T, ToobusyError>;
