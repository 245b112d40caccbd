//! Dark reference calibration and caching.
//!
//! The dark reference is the averaged device response with no optical signal,
//! acquired at a fixed reference exposure (typically a minute). Because that
//! is slow, the result is cached in a single array file. The file records the
//! device id, native integration time and reference exposure it was taken
//! with; a cache written under a different key or for a different pixel count
//! is treated as absent and replaced.

use super::{average_frames, FrameReader};
use crate::core::{frame_count, DarkReference, Spectrum};
use crate::data::{ArrayFile, ArrayStore};
use crate::error::{format_duration, AppResult, DaqError};
use crate::instrument::SpectrometerDevice;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DARK_PROGRESS_INTERVAL: u64 = 5;

/// Identity of a cached dark reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DarkCacheKey {
    /// Device the reference was taken on.
    pub device_id: String,
    /// Native integration time in nanoseconds.
    pub native_integration_ns: u128,
    /// Reference exposure in nanoseconds.
    pub reference_exposure_ns: u128,
}

impl DarkCacheKey {
    /// Key for a device configuration.
    pub fn new(device_id: &str, native: Duration, reference_exposure: Duration) -> Self {
        Self {
            device_id: device_id.to_string(),
            native_integration_ns: native.as_nanos(),
            reference_exposure_ns: reference_exposure.as_nanos(),
        }
    }

    /// Records the key in `file` metadata.
    pub fn stamp(&self, file: ArrayFile) -> ArrayFile {
        file.with_metadata("device_id", &self.device_id)
            .with_metadata("native_integration_ns", self.native_integration_ns)
            .with_metadata("reference_exposure_ns", self.reference_exposure_ns)
    }

    /// Whether `file` was stamped with this key.
    pub fn matches(&self, file: &ArrayFile) -> bool {
        let field = |name: &str| file.metadata.get(name).map(String::as_str);
        field("device_id") == Some(self.device_id.as_str())
            && field("native_integration_ns") == Some(self.native_integration_ns.to_string().as_str())
            && field("reference_exposure_ns") == Some(self.reference_exposure_ns.to_string().as_str())
    }
}

/// Produces dark references, from cache when possible.
pub struct DarkCalibrator {
    store: Arc<dyn ArrayStore>,
    cache_path: PathBuf,
}

impl DarkCalibrator {
    /// Calibrator caching to `cache_path` through `store`.
    pub fn new(store: Arc<dyn ArrayStore>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            cache_path: cache_path.into(),
        }
    }

    /// Location of the cache file.
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Returns the dark reference for `reference_exposure`.
    ///
    /// Without `force_refresh` a matching cache file is returned with zero
    /// frame reads. Otherwise `floor(reference_exposure / native)` frames are
    /// averaged and the cache is overwritten before returning. A failed cache
    /// write is logged and the fresh reference is still returned.
    ///
    /// `reference_exposure` must be at least one native integration time.
    pub async fn get_reference<D: SpectrometerDevice>(
        &self,
        reader: &mut FrameReader<D>,
        reference_exposure: Duration,
        force_refresh: bool,
    ) -> AppResult<DarkReference> {
        let native = reader.native_integration_time();
        if reference_exposure < native {
            return Err(DaqError::Configuration(format!(
                "dark reference exposure {} is shorter than the native integration time {}",
                format_duration(reference_exposure),
                format_duration(native)
            )));
        }

        let key = DarkCacheKey::new(reader.device().id(), native, reference_exposure);
        let pixels = reader.wavelengths().len();

        if !force_refresh {
            if let Some(reference) = self.load_cached(&key, pixels)? {
                info!(path = %self.cache_path.display(), "Loaded dark spectrum from cache");
                return Ok(reference);
            }
        }

        let frames = frame_count(reference_exposure, native);
        info!(
            frames,
            reference_exposure = %format_duration(reference_exposure),
            "Acquiring fresh dark spectrum"
        );
        let spectrum = average_frames(reader, frames, Some(DARK_PROGRESS_INTERVAL)).await?;

        let file = key.stamp(ArrayFile::new(vec![spectrum.as_slice().to_vec()]));
        match self.store.save(&self.cache_path, &file) {
            Ok(()) => info!(path = %self.cache_path.display(), frames, "Dark spectrum cached"),
            Err(err) => warn!(
                path = %self.cache_path.display(),
                %err,
                "Failed to cache dark spectrum, continuing with the fresh reference"
            ),
        }

        Ok(DarkReference::acquired(spectrum, frames))
    }

    fn load_cached(&self, key: &DarkCacheKey, pixels: usize) -> AppResult<Option<DarkReference>> {
        let file = match self.store.load(&self.cache_path) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(None),
            Err(DaqError::Storage(reason)) => {
                warn!(path = %self.cache_path.display(), %reason, "Unreadable dark cache, re-acquiring");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if !key.matches(&file) {
            warn!(
                path = %self.cache_path.display(),
                device = %key.device_id,
                "Dark cache was taken with a different configuration, re-acquiring"
            );
            return Ok(None);
        }

        match file.rows.into_iter().next() {
            Some(row) if row.len() == pixels => Ok(Some(DarkReference::cached(Spectrum::new(row)))),
            _ => {
                warn!(path = %self.cache_path.display(), pixels, "Dark cache length mismatch, re-acquiring");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WavelengthAxis;
    use crate::data::BincodeArrayStore;
    use crate::error_recovery::RetryPolicy;
    use crate::instrument::mock::MockSpectrometer;
    use tracing_test::traced_test;

    async fn reader(value: f64) -> FrameReader<MockSpectrometer> {
        let device = MockSpectrometer::constant(
            "mock-01",
            WavelengthAxis::linear(400.0, 700.0, 16).unwrap(),
            value,
        );
        let mut reader = FrameReader::new(device, RetryPolicy::default());
        reader.configure(Duration::from_millis(10)).await.unwrap();
        reader
    }

    #[tokio::test]
    async fn test_fresh_acquisition_then_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = DarkCalibrator::new(Arc::new(BincodeArrayStore), dir.path().join("dark.bin"));

        let mut first = reader(4.0).await;
        let reference = calibrator
            .get_reference(&mut first, Duration::from_millis(100), false)
            .await
            .unwrap();
        assert_eq!(reference.frames_averaged(), Some(10));
        assert_eq!(first.device().control().read_attempts(), 10);

        let mut second = reader(99.0).await;
        let cached = calibrator
            .get_reference(&mut second, Duration::from_millis(100), false)
            .await
            .unwrap();
        assert!(cached.is_cached());
        assert_eq!(cached.spectrum().as_slice(), &[4.0; 16]);
        assert_eq!(second.device().control().read_attempts(), 0);
    }

    #[tokio::test]
    async fn test_key_change_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = DarkCalibrator::new(Arc::new(BincodeArrayStore), dir.path().join("dark.bin"));

        let mut reader_a = reader(4.0).await;
        calibrator
            .get_reference(&mut reader_a, Duration::from_millis(100), false)
            .await
            .unwrap();

        let mut reader_b = reader(6.0).await;
        let reference = calibrator
            .get_reference(&mut reader_b, Duration::from_millis(200), false)
            .await
            .unwrap();
        assert!(!reference.is_cached());
        assert_eq!(reader_b.device().control().read_attempts(), 20);
        assert_eq!(reference.spectrum().as_slice(), &[6.0; 16]);
    }

    #[tokio::test]
    async fn test_reference_shorter_than_native_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = DarkCalibrator::new(Arc::new(BincodeArrayStore), dir.path().join("dark.bin"));
        let mut reader = reader(1.0).await;
        let err = calibrator
            .get_reference(&mut reader, Duration::from_millis(5), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(reader.device().control().read_attempts(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dark.bin");
        std::fs::write(&path, b"not bincode").unwrap();
        let calibrator = DarkCalibrator::new(Arc::new(BincodeArrayStore), &path);

        let mut reader = reader(2.0).await;
        let reference = calibrator
            .get_reference(&mut reader, Duration::from_millis(30), false)
            .await
            .unwrap();
        assert_eq!(reference.frames_averaged(), Some(3));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_cache_write_keeps_fresh_reference() {
        let dir = tempfile::tempdir().unwrap();
        // Parent of the cache path is a regular file, so the write cannot succeed.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let calibrator =
            DarkCalibrator::new(Arc::new(BincodeArrayStore), blocker.join("dark.bin"));

        let mut reader = reader(4.0).await;
        let reference = calibrator
            .get_reference(&mut reader, Duration::from_millis(30), false)
            .await
            .unwrap();

        assert_eq!(reference.frames_averaged(), Some(3));
        assert_eq!(reference.spectrum().as_slice()[0], 4.0);
        assert!(logs_contain("Failed to cache dark spectrum"));
    }
}
