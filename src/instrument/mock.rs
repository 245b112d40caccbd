//! A simulated spectrometer that generates synthetic frames.
//!
//! Used by the tests and by the `run` command when no hardware is attached.
//! Frames can be constant, cycle through a scripted sequence, or be
//! synthesized from emission lines on top of a dark level with uniform noise.
//! Transient transfer failures can be scripted (`fail_next`) or drawn at a
//! fixed rate.
//!
//! # Example
//!
//! ```rust,ignore
//! let axis = WavelengthAxis::linear(400.0, 700.0, 512)?;
//! let mut device = MockSpectrometer::constant("mock", axis, 42.0);
//! let control = device.control();
//! control.fail_next(3);
//! device.read_frame().await.unwrap_err(); // transient
//! ```

use crate::core::{Frame, WavelengthAxis};
use crate::error::DeviceError;
use crate::instrument::SpectrometerDevice;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Gaussian emission line used by the synthetic frame source.
#[derive(Clone, Debug, PartialEq)]
pub struct EmissionLine {
    /// Centre wavelength in nm.
    pub center_nm: f64,
    /// Standard deviation in nm.
    pub width_nm: f64,
    /// Peak counts above the dark level.
    pub amplitude: f64,
}

#[derive(Debug)]
enum FrameSource {
    Constant(f64),
    Sequence { frames: Vec<Vec<f64>>, next: usize },
    Synthetic {
        lines: Vec<EmissionLine>,
        dark_level: f64,
        noise_amplitude: f64,
    },
}

/// Counters and failure injection shared between a mock and its test.
#[derive(Debug, Default)]
pub struct MockControl {
    read_attempts: AtomicU64,
    frames_returned: AtomicU64,
    transient_failures: AtomicU64,
    pending_failures: AtomicU32,
}

impl MockControl {
    /// Makes the next `count` reads fail transiently.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Total `read_frame` calls.
    pub fn read_attempts(&self) -> u64 {
        self.read_attempts.load(Ordering::SeqCst)
    }

    /// Reads that returned a frame.
    pub fn frames_returned(&self) -> u64 {
        self.frames_returned.load(Ordering::SeqCst)
    }

    /// Reads that failed transiently.
    pub fn transient_failures(&self) -> u64 {
        self.transient_failures.load(Ordering::SeqCst)
    }

    fn take_scripted_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Simulated spectrometer.
pub struct MockSpectrometer {
    id: String,
    axis: WavelengthAxis,
    integration_time: Duration,
    source: FrameSource,
    failure_rate: f64,
    simulate_timing: bool,
    rng: StdRng,
    control: Arc<MockControl>,
}

impl MockSpectrometer {
    fn with_source(id: impl Into<String>, axis: WavelengthAxis, source: FrameSource) -> Self {
        Self {
            id: id.into(),
            axis,
            integration_time: Duration::from_millis(200),
            source,
            failure_rate: 0.0,
            simulate_timing: false,
            rng: StdRng::seed_from_u64(0x5eed),
            control: Arc::new(MockControl::default()),
        }
    }

    /// Every pixel of every frame reads `value`.
    pub fn constant(id: impl Into<String>, axis: WavelengthAxis, value: f64) -> Self {
        Self::with_source(id, axis, FrameSource::Constant(value))
    }

    /// Cycles through `frames` in order. Each frame should match the axis length.
    pub fn sequence(id: impl Into<String>, axis: WavelengthAxis, frames: Vec<Vec<f64>>) -> Self {
        Self::with_source(id, axis, FrameSource::Sequence { frames, next: 0 })
    }

    /// Emission lines on a dark pedestal with uniform noise of `noise_amplitude`.
    pub fn synthetic(
        id: impl Into<String>,
        axis: WavelengthAxis,
        lines: Vec<EmissionLine>,
        dark_level: f64,
        noise_amplitude: f64,
    ) -> Self {
        Self::with_source(
            id,
            axis,
            FrameSource::Synthetic {
                lines,
                dark_level,
                noise_amplitude,
            },
        )
    }

    /// Probability that any read fails transiently.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sleep for the integration time on every read.
    pub fn with_simulated_timing(mut self, enabled: bool) -> Self {
        self.simulate_timing = enabled;
        self
    }

    /// Reseeds the noise and failure generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Shared counters and failure injection.
    pub fn control(&self) -> Arc<MockControl> {
        self.control.clone()
    }

    fn next_intensities(&mut self) -> Vec<f64> {
        let len = self.axis.len();
        match &mut self.source {
            FrameSource::Constant(value) => vec![*value; len],
            FrameSource::Sequence { frames, next } => {
                if frames.is_empty() {
                    return vec![0.0; len];
                }
                let frame = frames[*next % frames.len()].clone();
                *next += 1;
                frame
            }
            FrameSource::Synthetic {
                lines,
                dark_level,
                noise_amplitude,
            } => {
                // Longer integration collects proportionally more signal.
                let gain = self.integration_time.as_secs_f64() / 0.2;
                self.axis
                    .as_slice()
                    .iter()
                    .map(|&wavelength| {
                        let signal: f64 = lines
                            .iter()
                            .map(|line| {
                                let z = (wavelength - line.center_nm) / line.width_nm;
                                line.amplitude * (-0.5 * z * z).exp()
                            })
                            .sum();
                        let noise = if *noise_amplitude > 0.0 {
                            self.rng.gen_range(-*noise_amplitude..=*noise_amplitude)
                        } else {
                            0.0
                        };
                        *dark_level + signal * gain + noise
                    })
                    .collect()
            }
        }
    }
}

#[async_trait]
impl SpectrometerDevice for MockSpectrometer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_integration_time(
        &mut self,
        integration_time: Duration,
    ) -> Result<(), DeviceError> {
        if integration_time.is_zero() {
            return Err(DeviceError::InvalidSetting(
                "integration time must be positive".to_string(),
            ));
        }
        tracing::debug!(
            device = %self.id,
            integration_ms = integration_time.as_secs_f64() * 1e3,
            "Mock spectrometer integration time set"
        );
        self.integration_time = integration_time;
        Ok(())
    }

    fn integration_time(&self) -> Duration {
        self.integration_time
    }

    fn wavelengths(&self) -> &WavelengthAxis {
        &self.axis
    }

    async fn read_frame(&mut self) -> Result<Frame, DeviceError> {
        self.control.read_attempts.fetch_add(1, Ordering::SeqCst);

        if self.simulate_timing {
            sleep(self.integration_time).await;
        }

        let random_failure = self.failure_rate > 0.0 && self.rng.gen_bool(self.failure_rate);
        if self.control.take_scripted_failure() || random_failure {
            self.control.transient_failures.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Transient("simulated USB transfer error".to_string()));
        }

        let frame = Frame::new(self.next_intensities());
        self.control.frames_returned.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }
}
