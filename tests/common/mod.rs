//! Shared fixtures for integration tests.
#![allow(dead_code)]

use spectro_daq::acquisition::{DarkCalibrator, FrameReader, SpectrumAcquirer};
use spectro_daq::core::WavelengthAxis;
use spectro_daq::data::{ArrayStore, BincodeArrayStore};
use spectro_daq::error_recovery::RetryPolicy;
use spectro_daq::instrument::mock::MockSpectrometer;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PIXELS: usize = 16;

pub fn axis() -> WavelengthAxis {
    WavelengthAxis::linear(340.0, 1030.0, PIXELS).unwrap()
}

pub fn constant(id: &str, value: f64) -> MockSpectrometer {
    MockSpectrometer::constant(id, axis(), value)
}

pub fn bincode_store() -> Arc<dyn ArrayStore> {
    Arc::new(BincodeArrayStore)
}

pub async fn reader(
    device: MockSpectrometer,
    native: Duration,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> FrameReader<MockSpectrometer> {
    let mut reader = FrameReader::new(device, policy).with_cancellation(cancel);
    reader.configure(native).await.unwrap();
    reader
}

pub async fn acquirer(
    device: MockSpectrometer,
    native: Duration,
    reference_exposure: Duration,
    cache_path: &Path,
    force_refresh: bool,
) -> SpectrumAcquirer<MockSpectrometer> {
    let reader = reader(device, native, RetryPolicy::default(), CancellationToken::new()).await;
    SpectrumAcquirer::new(
        reader,
        DarkCalibrator::new(bincode_store(), cache_path),
        reference_exposure,
        force_refresh,
    )
    .await
    .unwrap()
}
