//! Spectrometer device contract.
//!
//! A device handle is a raw, possibly flaky transport: it knows its
//! integration time and wavelength axis and can read one frame. Retrying,
//! averaging and dark correction all live above it in
//! [`crate::acquisition`].

use crate::core::{Frame, WavelengthAxis};
use crate::error::DeviceError;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;

/// Capability exposed by a connected spectrometer.
///
/// Implementations are owned by exactly one [`crate::acquisition::FrameReader`];
/// reads are never issued concurrently.
#[async_trait]
pub trait SpectrometerDevice: Send {
    /// Stable identity, used to key the dark cache.
    fn id(&self) -> &str;

    /// Sets the native per-frame integration time.
    async fn set_integration_time(&mut self, integration_time: Duration)
        -> Result<(), DeviceError>;

    /// Native per-frame integration time currently configured.
    fn integration_time(&self) -> Duration;

    /// Wavelength axis, fixed for the lifetime of the handle.
    fn wavelengths(&self) -> &WavelengthAxis;

    /// Reads one frame. USB transfer failures come back as [`DeviceError::Transient`].
    async fn read_frame(&mut self) -> Result<Frame, DeviceError>;
}
