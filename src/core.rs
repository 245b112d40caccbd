//! Core data types for spectrum acquisition.
//!
//! Every intensity array in the pipeline is indexed by the same
//! [`WavelengthAxis`], which is fixed for the lifetime of a device handle:
//!
//! ```text
//! Device --[Frame]--> FrameReader --[Frame]--> average --[Spectrum]--> minus dark --> Session
//! ```
//!
//! [`Frame`] is one raw read, [`Spectrum`] is an averaged (and usually
//! dark-corrected) measurement, and [`DarkReference`] is the averaged
//! no-signal baseline subtracted from every spectrum.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Wavelength axis
// =============================================================================

/// Immutable, ordered wavelengths in nanometres. Cheap to clone.
#[derive(Clone, Debug, PartialEq)]
pub struct WavelengthAxis(Arc<[f64]>);

impl WavelengthAxis {
    /// Wraps the wavelengths reported by a device.
    ///
    /// Fails when the axis is empty or not strictly increasing.
    pub fn new(wavelengths: Vec<f64>) -> AppResult<Self> {
        if wavelengths.is_empty() {
            return Err(DaqError::Configuration(
                "wavelength axis must not be empty".to_string(),
            ));
        }
        if wavelengths.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(DaqError::Configuration(
                "wavelength axis must be strictly increasing".to_string(),
            ));
        }
        Ok(Self(wavelengths.into()))
    }

    /// Evenly spaced axis from `start_nm` to `end_nm` inclusive.
    pub fn linear(start_nm: f64, end_nm: f64, pixels: usize) -> AppResult<Self> {
        if pixels < 2 {
            return Self::new(vec![start_nm; pixels]);
        }
        let step = (end_nm - start_nm) / (pixels - 1) as f64;
        Self::new((0..pixels).map(|i| start_nm + step * i as f64).collect())
    }

    /// Number of pixels, N.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed axis.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The wavelengths as a slice.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

// =============================================================================
// Frames and spectra
// =============================================================================

/// One raw intensity read from the device.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    intensities: Vec<f64>,
}

impl Frame {
    /// Wraps raw intensities.
    pub fn new(intensities: Vec<f64>) -> Self {
        Self { intensities }
    }

    /// Number of pixels in the frame.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// True when the device returned no pixels.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// The raw intensities.
    pub fn as_slice(&self) -> &[f64] {
        &self.intensities
    }
}

/// Averaged intensities, one per wavelength. May contain negative values after
/// dark subtraction; clamping is left to presentation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    intensities: Vec<f64>,
}

impl Spectrum {
    /// Wraps intensities.
    pub fn new(intensities: Vec<f64>) -> Self {
        Self { intensities }
    }

    /// All-zero spectrum of `len` pixels.
    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// True for a zero-length spectrum.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// The intensities.
    pub fn as_slice(&self) -> &[f64] {
        &self.intensities
    }

    /// Consumes the spectrum, returning its intensities.
    pub fn into_vec(self) -> Vec<f64> {
        self.intensities
    }

    /// Largest finite intensity, if any.
    pub fn max(&self) -> Option<f64> {
        self.intensities
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .reduce(f64::max)
    }

    /// Elementwise `self - reference`, index for index.
    pub fn subtract(&self, reference: &Spectrum) -> AppResult<Spectrum> {
        if reference.len() != self.len() {
            return Err(DaqError::LengthMismatch {
                expected: self.len(),
                actual: reference.len(),
            });
        }
        Ok(Spectrum::new(
            self.intensities
                .iter()
                .zip(&reference.intensities)
                .map(|(value, dark)| value - dark)
                .collect(),
        ))
    }
}

/// Running elementwise sum of frames.
#[derive(Debug)]
pub struct FrameAccumulator {
    sums: Vec<f64>,
    frames: u64,
}

impl FrameAccumulator {
    /// Empty accumulator for an axis of `len` pixels.
    pub fn new(len: usize) -> Self {
        Self {
            sums: vec![0.0; len],
            frames: 0,
        }
    }

    /// Adds one frame. The frame must match the axis length.
    pub fn add(&mut self, frame: &Frame) -> AppResult<()> {
        if frame.len() != self.sums.len() {
            return Err(DaqError::LengthMismatch {
                expected: self.sums.len(),
                actual: frame.len(),
            });
        }
        for (sum, value) in self.sums.iter_mut().zip(frame.as_slice()) {
            *sum += value;
        }
        self.frames += 1;
        Ok(())
    }

    /// Frames added so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Divides the sums by the frame count. An empty accumulator yields zeros.
    pub fn finish(self) -> Spectrum {
        if self.frames == 0 {
            return Spectrum::new(self.sums);
        }
        let count = self.frames as f64;
        Spectrum::new(self.sums.into_iter().map(|sum| sum / count).collect())
    }
}

// =============================================================================
// Dark reference
// =============================================================================

/// Averaged device response with no useful signal. Never mutated; a refresh
/// replaces it wholesale.
///
/// Averaging has no outlier rejection, so one noisy frame contaminates the
/// reference until the next refresh.
#[derive(Clone, Debug, PartialEq)]
pub struct DarkReference {
    spectrum: Spectrum,
    frames_averaged: Option<u64>,
}

impl DarkReference {
    /// Reference that was just averaged from `frames_averaged` frames.
    pub fn acquired(spectrum: Spectrum, frames_averaged: u64) -> Self {
        Self {
            spectrum,
            frames_averaged: Some(frames_averaged),
        }
    }

    /// Reference read back from the cache.
    pub fn cached(spectrum: Spectrum) -> Self {
        Self {
            spectrum,
            frames_averaged: None,
        }
    }

    /// The baseline intensities.
    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    /// Frames averaged, or `None` when loaded from cache.
    pub fn frames_averaged(&self) -> Option<u64> {
        self.frames_averaged
    }

    /// True when this reference came from the cache file.
    pub fn is_cached(&self) -> bool {
        self.frames_averaged.is_none()
    }
}

// =============================================================================
// Integration timing
// =============================================================================

/// Native frames to average for a requested exposure.
///
/// `floor(requested / native)`, never less than one frame. A zero native time
/// also yields one frame.
pub fn frame_count(requested: Duration, native: Duration) -> u64 {
    let native_ns = native.as_nanos();
    if native_ns == 0 {
        return 1;
    }
    let frames = requested.as_nanos() / native_ns;
    u64::try_from(frames).unwrap_or(u64::MAX).max(1)
}

/// Converts operator-entered seconds to a duration, rounding to the nanosecond.
///
/// Returns `None` for NaN, infinite, zero or negative values.
pub fn duration_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    let nanos = (secs * 1e9).round();
    if nanos < 1.0 || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count_floors() {
        let native = Duration::from_millis(10);
        assert_eq!(frame_count(Duration::from_millis(500), native), 50);
        assert_eq!(frame_count(Duration::from_millis(509), native), 50);
        assert_eq!(frame_count(Duration::from_secs(10), native), 1000);
    }

    #[test]
    fn test_frame_count_clamps_to_one() {
        let native = Duration::from_millis(200);
        assert_eq!(frame_count(Duration::from_millis(199), native), 1);
        assert_eq!(frame_count(Duration::ZERO, native), 1);
        assert_eq!(frame_count(Duration::from_millis(5), Duration::ZERO), 1);
    }

    #[test]
    fn test_duration_from_secs_avoids_float_floor_traps() {
        let requested = duration_from_secs(0.3).unwrap();
        assert_eq!(requested, Duration::from_millis(300));
        assert_eq!(frame_count(requested, Duration::from_millis(100)), 3);
    }

    #[test]
    fn test_duration_from_secs_rejects_invalid() {
        assert!(duration_from_secs(-1.0).is_none());
        assert!(duration_from_secs(0.0).is_none());
        assert!(duration_from_secs(f64::NAN).is_none());
        assert!(duration_from_secs(f64::INFINITY).is_none());
    }

    #[test]
    fn test_axis_validation() {
        assert!(WavelengthAxis::new(vec![]).is_err());
        assert!(WavelengthAxis::new(vec![400.0, 400.0]).is_err());
        let axis = WavelengthAxis::linear(400.0, 700.0, 4).unwrap();
        assert_eq!(axis.as_slice(), &[400.0, 500.0, 600.0, 700.0]);
    }

    #[test]
    fn test_accumulator_averages_and_checks_length() {
        let mut acc = FrameAccumulator::new(2);
        acc.add(&Frame::new(vec![1.0, 10.0])).unwrap();
        acc.add(&Frame::new(vec![3.0, 20.0])).unwrap();
        assert!(acc.add(&Frame::new(vec![1.0])).is_err());
        assert_eq!(acc.frames(), 2);
        assert_eq!(acc.finish().as_slice(), &[2.0, 15.0]);
    }

    #[test]
    fn test_subtract_keeps_negative_values() {
        let raw = Spectrum::new(vec![5.0, 1.0]);
        let dark = Spectrum::new(vec![2.0, 3.0]);
        assert_eq!(raw.subtract(&dark).unwrap().as_slice(), &[3.0, -2.0]);
    }

    #[test]
    fn test_max_ignores_non_finite() {
        let spectrum = Spectrum::new(vec![1.0, f64::NAN, 250.0, -4.0]);
        assert_eq!(spectrum.max(), Some(250.0));
        assert_eq!(Spectrum::new(vec![]).max(), None);
    }
}
