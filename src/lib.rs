//! Core library for the spectro_daq application.
//!
//! Acquires dark-corrected spectra from a USB spectrometer that only exposes
//! a fixed native integration time. Longer exposures are synthesised by
//! averaging native frames, a dark reference is cached on disk, and a live
//! session controller applies operator commands between acquisitions.

pub mod acquisition;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod messages;
pub mod session;
pub mod tracing_init;
