//! Frame reading, dark calibration and spectrum averaging.
//!
//! - [`FrameReader`] wraps a device with retry-on-transient-failure.
//! - [`DarkCalibrator`] produces and caches the dark reference.
//! - [`SpectrumAcquirer`] averages native frames to reach a requested
//!   exposure and subtracts the dark reference.

pub mod dark;
pub mod frame_reader;
pub mod spectrum;

pub use dark::{DarkCacheKey, DarkCalibrator};
pub use frame_reader::{FrameReader, ReadStats};
pub use spectrum::SpectrumAcquirer;

use crate::core::{FrameAccumulator, Spectrum};
use crate::error::AppResult;
use crate::instrument::SpectrometerDevice;

/// Averages `count` frames read through `reader`.
///
/// When `progress_every` is set, a debug event is emitted every that many frames.
pub(crate) async fn average_frames<D: SpectrometerDevice>(
    reader: &mut FrameReader<D>,
    count: u64,
    progress_every: Option<u64>,
) -> AppResult<Spectrum> {
    let mut accumulator = FrameAccumulator::new(reader.wavelengths().len());
    for i in 1..=count {
        let frame = reader.read_one().await?;
        accumulator.add(&frame)?;
        if let Some(every) = progress_every {
            if every > 0 && i % every == 0 {
                tracing::debug!(frame = i, total = count, "{} / {}", i, count);
            }
        }
    }
    Ok(accumulator.finish())
}
