//! Dark-corrected spectra for arbitrary requested exposures.

use super::{average_frames, DarkCalibrator, FrameReader};
use crate::core::{frame_count, DarkReference, Spectrum, WavelengthAxis};
use crate::error::{format_duration, AppResult};
use crate::instrument::SpectrometerDevice;
use std::time::Duration;
use tracing::{debug, info};

/// Composes a [`FrameReader`] with a dark reference.
///
/// A requested exposure is reached by averaging
/// `max(1, floor(requested / native))` native frames; the dark reference is
/// then subtracted index for index. Results are not clamped, so values near
/// the noise floor may be negative.
pub struct SpectrumAcquirer<D> {
    reader: FrameReader<D>,
    calibrator: DarkCalibrator,
    reference_exposure: Duration,
    dark: DarkReference,
}

impl<D: SpectrometerDevice> SpectrumAcquirer<D> {
    /// Obtains the dark reference (from cache unless `force_refresh`) and
    /// returns a ready acquirer.
    pub async fn new(
        mut reader: FrameReader<D>,
        calibrator: DarkCalibrator,
        reference_exposure: Duration,
        force_refresh: bool,
    ) -> AppResult<Self> {
        let dark = calibrator
            .get_reference(&mut reader, reference_exposure, force_refresh)
            .await?;
        Ok(Self {
            reader,
            calibrator,
            reference_exposure,
            dark,
        })
    }

    /// Averages native frames for `requested` and subtracts the dark reference.
    pub async fn acquire(&mut self, requested: Duration) -> AppResult<Spectrum> {
        let frames = frame_count(requested, self.reader.native_integration_time());
        debug!(
            frames,
            requested = %format_duration(requested),
            "Acquiring spectrum"
        );
        let raw = average_frames(&mut self.reader, frames, None).await?;
        raw.subtract(self.dark.spectrum())
    }

    /// Re-acquires the dark reference and overwrites the cache.
    pub async fn refresh_dark(&mut self) -> AppResult<()> {
        info!("Refreshing dark spectrum");
        self.dark = self
            .calibrator
            .get_reference(&mut self.reader, self.reference_exposure, true)
            .await?;
        Ok(())
    }

    /// Dark reference currently subtracted.
    pub fn dark(&self) -> &DarkReference {
        &self.dark
    }

    /// Wavelength axis shared by every returned spectrum.
    pub fn wavelengths(&self) -> &WavelengthAxis {
        self.reader.wavelengths()
    }

    /// Native per-frame integration time.
    pub fn native_integration_time(&self) -> Duration {
        self.reader.native_integration_time()
    }

    /// Underlying frame reader.
    pub fn reader(&self) -> &FrameReader<D> {
        &self.reader
    }
}
