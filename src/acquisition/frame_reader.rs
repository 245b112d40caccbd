//! Single-frame reads with bounded-or-unbounded retry.
//!
//! Transient transfer failures are retried with the same device state; no
//! reconfiguration happens between attempts, so the reader stays in step with
//! the device's internal frame timing. Once the consecutive failure count
//! passes the policy's diagnostic threshold, every further failure is logged
//! as a "Read error" without changing the retry behaviour.

use crate::core::{Frame, WavelengthAxis};
use crate::error::{AppResult, DaqError, DeviceError};
use crate::error_recovery::RetryPolicy;
use crate::instrument::SpectrometerDevice;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Counters kept by a [`FrameReader`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Underlying `read_frame` calls.
    pub attempts: u64,
    /// Good frames returned.
    pub frames: u64,
    /// Transient failures, including frames of the wrong length.
    pub transient_failures: u64,
    /// "Read error" diagnostics emitted.
    pub diagnostics: u64,
}

/// Exclusive owner of a device handle.
pub struct FrameReader<D> {
    device: D,
    policy: RetryPolicy,
    cancel: CancellationToken,
    stats: ReadStats,
}

impl<D: SpectrometerDevice> FrameReader<D> {
    /// Wraps `device` with `policy` and a fresh cancellation token.
    pub fn new(device: D, policy: RetryPolicy) -> Self {
        Self {
            device,
            policy,
            cancel: CancellationToken::new(),
            stats: ReadStats::default(),
        }
    }

    /// Uses `token` to abandon retries between attempts.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets the native integration time once at startup.
    pub async fn configure(&mut self, native_integration_time: Duration) -> AppResult<()> {
        self.device
            .set_integration_time(native_integration_time)
            .await?;
        debug!(
            device = self.device.id(),
            native_ms = native_integration_time.as_secs_f64() * 1e3,
            "Native integration time configured"
        );
        Ok(())
    }

    /// The wrapped device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Native per-frame integration time.
    pub fn native_integration_time(&self) -> Duration {
        self.device.integration_time()
    }

    /// Wavelength axis of the device.
    pub fn wavelengths(&self) -> &WavelengthAxis {
        self.device.wavelengths()
    }

    /// Token observed between attempts.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Counters since construction.
    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Reads one good frame, retrying transient failures per the policy.
    ///
    /// Under the default unbounded policy this only returns an error for a
    /// non-transient device failure or cancellation. A read in flight is never
    /// interrupted; cancellation is observed before each attempt and during
    /// backoff.
    pub async fn read_one(&mut self) -> AppResult<Frame> {
        let expected = self.device.wavelengths().len();
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DaqError::Cancelled);
            }

            self.stats.attempts += 1;
            let reason = match self.device.read_frame().await {
                Ok(frame) if frame.len() == expected => {
                    self.stats.frames += 1;
                    if failures > 0 {
                        debug!(failures, "Frame read recovered");
                    }
                    return Ok(frame);
                }
                Ok(frame) => format!("short frame: {} of {} pixels", frame.len(), expected),
                Err(DeviceError::Transient(reason)) => reason,
                Err(err) => return Err(err.into()),
            };

            failures = failures.saturating_add(1);
            self.stats.transient_failures += 1;

            if self.policy.should_report(failures) {
                self.stats.diagnostics += 1;
                warn!(
                    device = self.device.id(),
                    consecutive_failures = failures,
                    %reason,
                    "Read error"
                );
            } else {
                debug!(consecutive_failures = failures, %reason, "Transient read failure, retrying");
            }

            if self.policy.is_exhausted(failures) {
                return Err(DaqError::RetriesExhausted { attempts: failures });
            }

            let delay = self.policy.backoff.delay_for(failures);
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.cancel.cancelled() => return Err(DaqError::Cancelled),
                }
            }
        }
    }
}
