//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition
//! pipeline. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the errors that can escape the pipeline, from
//! configuration issues to storage and device problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading the configuration file or
//!   environment overrides.
//! - **`Configuration`**: Semantic errors in the configuration, such as a reference
//!   exposure shorter than one native frame. These are caught during validation.
//! - **`Io`**: Wraps standard `std::io::Error` for cache and export files.
//! - **`Device`**: Non-transient failures reported by the spectrometer. Transient transfer
//!   failures never show up here; the frame reader retries them.
//! - **`Storage`**: Array file encoding or decoding failures.
//! - **`RetriesExhausted`** / **`Cancelled`**: Only produced when a bounded retry policy or a
//!   cancellation token is in effect. The default policy retries forever.
//!
//! Malformed operator input and a missing dark cache are recovered locally and never
//! surface as errors.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors surfaced by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-transient failure reported by the device.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Array file could not be encoded or decoded.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Two intensity arrays that must share a wavelength axis do not.
    #[error("Length mismatch: expected {expected} values, got {actual}")]
    LengthMismatch {
        /// Length of the wavelength axis.
        expected: usize,
        /// Length that was observed.
        actual: usize,
    },

    /// A bounded retry policy ran out of attempts.
    #[error("Frame read failed after {attempts} consecutive transient errors")]
    RetriesExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// The acquisition was cancelled between frame reads.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Functionality excluded at compile time.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<bincode::Error> for DaqError {
    fn from(err: bincode::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

/// Errors raised by a spectrometer device handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Recoverable USB transfer failure; the read may simply be repeated.
    #[error("transient transfer failure: {0}")]
    Transient(String),

    /// The device went away.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// The device rejected a setting.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

impl DeviceError {
    /// Whether the failed operation is worth repeating unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Transient(_))
    }
}

pub(crate) fn format_duration(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}
