//! Live session controller.
//!
//! The controller is a single-owner actor. It owns the
//! [`SpectrumAcquirer`] and all display state, and is the only thing that
//! mutates either. Operator commands arrive as [`SessionCommand`] messages
//! and are applied at drain points between acquisitions, so a command sent
//! during a long one-shot exposure is only seen once that exposure finishes.
//!
//! ```text
//!                    tick (default exposure)
//!                   ┌──────────────┐
//!                   ▼              │
//!         ┌─────────────────────┐  │  acquire(d)   ┌───────────────────┐
//!  new ──▶│ RunningContinuous   │──┴──────────────▶│ PausedForOneShot  │
//!         └─────────────────────┘◀─────────────────└───────────────────┘
//!                   │               restart, or auto-resume    │
//!                   └──────────── quit ──▶ Stopped ◀── quit ───┘
//! ```
//!
//! Every state change is published as a [`DisplayUpdate`] on a broadcast
//! channel for renderers.

use crate::acquisition::SpectrumAcquirer;
use crate::config::SpectroConfig;
use crate::core::{duration_from_secs, Spectrum, WavelengthAxis};
use crate::data::{ArrayFile, ArrayStore};
use crate::error::{format_duration, AppResult, DaqError};
use crate::instrument::SpectrometerDevice;
use crate::messages::SessionCommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Controller state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Acquiring at the default exposure on every tick.
    RunningContinuous,
    /// Continuous ticks suspended after a one-shot acquisition.
    PausedForOneShot,
    /// Terminal.
    Stopped,
}

/// Y-axis scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleMode {
    /// Lower bound 0.
    Linear,
    /// Lower bound 1.
    Log,
}

/// Y-axis bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct YLimits {
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

impl YLimits {
    /// Bounds `[lower, upper]`.
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

/// Behaviour switches and defaults for a session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Exposure of each continuous tick.
    pub default_exposure: Duration,
    /// Accept `acquire` and `restart`.
    pub supports_one_shot: bool,
    /// Return to continuous mode after a one-shot instead of waiting for `restart`.
    pub resume_after_one_shot: bool,
    /// Requested exposure at startup.
    pub initial_requested_exposure: Duration,
    /// Substituted for unreadable exposure text.
    pub fallback_exposure: Duration,
    /// Sleep between drain points while paused.
    pub idle_poll: Duration,
    /// Default save destination.
    pub export_path: PathBuf,
    /// Initial y-axis bounds.
    pub y_limits: YLimits,
    /// Autoscale factor.
    pub autoscale_headroom: f64,
    /// Broadcast capacity for display updates.
    pub update_channel_capacity: usize,
}

impl SessionOptions {
    /// Options from the loaded configuration.
    pub fn from_config(config: &SpectroConfig) -> Self {
        let session = &config.session;
        Self {
            default_exposure: config.acquisition.default_exposure,
            supports_one_shot: session.supports_one_shot,
            resume_after_one_shot: session.resume_after_one_shot,
            initial_requested_exposure: session.initial_requested_exposure,
            fallback_exposure: session.fallback_exposure,
            idle_poll: session.idle_poll,
            export_path: session.export_path.clone(),
            y_limits: YLimits::new(session.y_limits[0], session.y_limits[1]),
            autoscale_headroom: session.autoscale_headroom,
            update_channel_capacity: session.update_channel_capacity,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SpectroConfig::default())
    }
}

/// Display state owned by the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionState {
    spectrum: Spectrum,
    y_limits: YLimits,
    scale: ScaleMode,
    mode: SessionMode,
    requested_exposure: Duration,
    exposure: Duration,
}

impl SessionState {
    /// Displayed spectrum.
    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    /// Y-axis bounds.
    pub fn y_limits(&self) -> YLimits {
        self.y_limits
    }

    /// Y-axis scale.
    pub fn scale(&self) -> ScaleMode {
        self.scale
    }

    /// Current state machine mode.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// False once stopped.
    pub fn is_running(&self) -> bool {
        self.mode != SessionMode::Stopped
    }

    /// True while continuous ticks are suspended.
    pub fn is_paused(&self) -> bool {
        self.mode == SessionMode::PausedForOneShot
    }

    /// Exposure for the next one-shot acquisition.
    pub fn requested_exposure(&self) -> Duration {
        self.requested_exposure
    }

    /// Exposure the displayed spectrum was acquired with.
    pub fn exposure(&self) -> Duration {
        self.exposure
    }
}

/// Snapshot published to renderers.
#[derive(Clone, Debug)]
pub struct DisplayUpdate {
    /// X values.
    pub wavelengths: WavelengthAxis,
    /// Y values.
    pub spectrum: Spectrum,
    /// Y-axis bounds.
    pub y_limits: YLimits,
    /// Y-axis scale.
    pub scale: ScaleMode,
    /// Controller mode.
    pub mode: SessionMode,
}

/// Drives continuous acquisition and applies operator commands.
pub struct SessionController<D> {
    acquirer: SpectrumAcquirer<D>,
    store: Arc<dyn ArrayStore>,
    options: SessionOptions,
    state: SessionState,
    updates: broadcast::Sender<Arc<DisplayUpdate>>,
}

impl<D: SpectrometerDevice> SessionController<D> {
    /// Seeds the display with one acquisition at the default exposure.
    pub async fn new(
        mut acquirer: SpectrumAcquirer<D>,
        store: Arc<dyn ArrayStore>,
        options: SessionOptions,
    ) -> AppResult<Self> {
        let spectrum = acquirer.acquire(options.default_exposure).await?;
        let (updates, _) = broadcast::channel(options.update_channel_capacity.max(1));
        let state = SessionState {
            spectrum,
            y_limits: options.y_limits,
            scale: ScaleMode::Linear,
            mode: SessionMode::RunningContinuous,
            requested_exposure: options.initial_requested_exposure,
            exposure: options.default_exposure,
        };
        info!(
            one_shot = options.supports_one_shot,
            auto_resume = options.resume_after_one_shot,
            "Session controller ready"
        );
        Ok(Self {
            acquirer,
            store,
            options,
            state,
            updates,
        })
    }

    /// Current display state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current mode.
    pub fn mode(&self) -> SessionMode {
        self.state.mode
    }

    /// The acquirer driven by this session.
    pub fn acquirer(&self) -> &SpectrumAcquirer<D> {
        &self.acquirer
    }

    /// Receives a [`DisplayUpdate`] after every state change.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DisplayUpdate>> {
        self.updates.subscribe()
    }

    /// Snapshot of what a renderer should show.
    pub fn display_update(&self) -> DisplayUpdate {
        DisplayUpdate {
            wavelengths: self.acquirer.wavelengths().clone(),
            spectrum: self.state.spectrum.clone(),
            y_limits: self.state.y_limits,
            scale: self.state.scale,
            mode: self.state.mode,
        }
    }

    /// One continuous acquisition. Returns `false` without reading when not
    /// in continuous mode.
    pub async fn tick(&mut self) -> AppResult<bool> {
        if self.state.mode != SessionMode::RunningContinuous {
            return Ok(false);
        }
        self.state.spectrum = self.acquirer.acquire(self.options.default_exposure).await?;
        self.state.exposure = self.options.default_exposure;
        self.publish();
        Ok(true)
    }

    /// Applies one operator command. Commands after `quit` are ignored.
    pub async fn apply(&mut self, command: SessionCommand) -> AppResult<()> {
        if self.state.mode == SessionMode::Stopped {
            debug!(command = command.name(), "Session stopped, command ignored");
            return Ok(());
        }
        debug!(command = command.name(), "Applying operator command");

        let result = match command {
            SessionCommand::Quit => {
                self.stop();
                Ok(())
            }
            SessionCommand::Autoscale => {
                self.autoscale();
                Ok(())
            }
            SessionCommand::ToggleLogScale => {
                self.toggle_log_scale();
                Ok(())
            }
            SessionCommand::Acquire { exposure } => {
                let exposure = exposure.unwrap_or(self.state.requested_exposure);
                self.acquire_one_shot(exposure).await
            }
            SessionCommand::Save { path } => {
                self.save(path.as_deref());
                Ok(())
            }
            SessionCommand::Restart => {
                self.restart();
                Ok(())
            }
            SessionCommand::SetRequestedExposure(text) => {
                self.set_requested_exposure(&text);
                Ok(())
            }
            SessionCommand::RefreshDark => self.acquirer.refresh_dark().await,
        };

        self.publish();
        result
    }

    /// Runs until `quit`, until every command sender is dropped, or until the
    /// reader's cancellation token fires. Returns the final state.
    ///
    /// Each cycle drains all pending commands in arrival order, then either
    /// acquires one continuous spectrum or, while paused, sleeps for the idle
    /// poll interval.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) -> AppResult<SessionState> {
        let cancel = self.acquirer.reader().cancellation_token().clone();
        info!("Session controller started");
        self.publish();

        while self.state.mode != SessionMode::Stopped {
            // Drain point.
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        let result = self.apply(command).await;
                        self.absorb(result)?;
                        if self.state.mode == SessionMode::Stopped {
                            break;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        info!("Command channel closed");
                        self.stop();
                        break;
                    }
                }
            }
            if cancel.is_cancelled() {
                self.stop();
            }

            match self.state.mode {
                SessionMode::RunningContinuous => {
                    let result = self.tick().await.map(|_| ());
                    self.absorb(result)?;
                    // Devices that never suspend would otherwise starve the runtime.
                    tokio::task::yield_now().await;
                }
                SessionMode::PausedForOneShot => {
                    tokio::select! {
                        _ = sleep(self.options.idle_poll) => {}
                        _ = cancel.cancelled() => self.stop(),
                    }
                }
                SessionMode::Stopped => {}
            }
        }

        self.publish();
        info!("Session controller stopped");
        Ok(self.state)
    }

    fn absorb(&mut self, result: AppResult<()>) -> AppResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(DaqError::Cancelled) => {
                info!("Acquisition cancelled");
                self.stop();
                Ok(())
            }
            Err(err @ (DaqError::Device(_) | DaqError::Configuration(_))) => {
                error!(%err, "Session aborted");
                self.stop();
                Err(err)
            }
            Err(err) => {
                error!(%err, "Acquisition cycle failed, continuing");
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        if self.state.mode != SessionMode::Stopped {
            info!("Quit");
            self.state.mode = SessionMode::Stopped;
        }
    }

    fn autoscale(&mut self) {
        match self.state.spectrum.max() {
            Some(max) => {
                self.state.y_limits.upper = max * self.options.autoscale_headroom;
                info!(max, upper = self.state.y_limits.upper, "Set autoscale");
            }
            None => warn!("Autoscale skipped: displayed spectrum has no finite values"),
        }
    }

    /// Renderers must cope with non-positive intensities on a log axis; this
    /// layer only moves the lower bound.
    ///
    /// The toggle follows `ScaleMode`, not the current lower bound, so the
    /// first toggle from the initial `[-30, upper]` linear view goes to log.
    fn toggle_log_scale(&mut self) {
        let (scale, lower) = match self.state.scale {
            ScaleMode::Linear => (ScaleMode::Log, 1.0),
            ScaleMode::Log => (ScaleMode::Linear, 0.0),
        };
        self.state.scale = scale;
        self.state.y_limits.lower = lower;
        info!(?scale, "Y-axis scale changed");
    }

    fn set_requested_exposure(&mut self, text: &str) {
        let parsed = text.trim().parse::<f64>().ok().and_then(duration_from_secs);
        self.state.requested_exposure = match parsed {
            Some(exposure) => {
                info!(exposure = %format_duration(exposure), "Requested exposure set");
                exposure
            }
            None => {
                warn!(
                    input = text,
                    fallback = %format_duration(self.options.fallback_exposure),
                    "Cannot read value, using fallback exposure"
                );
                self.options.fallback_exposure
            }
        };
    }

    async fn acquire_one_shot(&mut self, exposure: Duration) -> AppResult<()> {
        if !self.options.supports_one_shot {
            warn!("One-shot acquisition is not supported by this session");
            return Ok(());
        }

        info!(exposure = %format_duration(exposure), "Acquire spectrum");
        self.state.mode = SessionMode::PausedForOneShot;
        self.publish();

        let result = self.acquirer.acquire(exposure).await;
        let outcome = result.map(|spectrum| {
            self.state.spectrum = spectrum;
            self.state.exposure = exposure;
            info!("Done");
        });

        if self.options.resume_after_one_shot {
            self.state.mode = SessionMode::RunningContinuous;
        }
        outcome
    }

    fn restart(&mut self) {
        if self.state.mode == SessionMode::PausedForOneShot {
            info!("Continuous acquisition resumed");
            self.state.mode = SessionMode::RunningContinuous;
        } else {
            debug!(mode = ?self.state.mode, "Restart ignored, session not paused");
        }
    }

    fn save(&self, path: Option<&Path>) {
        let path = path.unwrap_or(&self.options.export_path);
        let reader = self.acquirer.reader();
        let file = ArrayFile::new(vec![
            self.acquirer.wavelengths().as_slice().to_vec(),
            self.state.spectrum.as_slice().to_vec(),
        ])
        .with_metadata("device_id", reader.device().id())
        .with_metadata("exposure_ns", self.state.exposure.as_nanos())
        .with_metadata("native_integration_ns", reader.native_integration_time().as_nanos())
        .with_metadata("saved_at", chrono::Utc::now().to_rfc3339());

        match self.store.save(path, &file) {
            Ok(()) => info!(path = %path.display(), "Saved spectrum"),
            Err(err) => error!(path = %path.display(), %err, "Failed to save spectrum"),
        }
    }

    fn publish(&self) {
        // Ignore errors if no receivers are active
        let _ = self.updates.send(Arc::new(self.display_update()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{DarkCalibrator, FrameReader};
    use crate::data::BincodeArrayStore;
    use crate::error_recovery::RetryPolicy;
    use crate::instrument::mock::{MockControl, MockSpectrometer};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const NATIVE: Duration = Duration::from_millis(10);

    async fn controller(
        frames: Vec<Vec<f64>>,
        options: SessionOptions,
    ) -> (SessionController<MockSpectrometer>, Arc<MockControl>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let axis = WavelengthAxis::linear(400.0, 700.0, 3).unwrap();
        let device = MockSpectrometer::sequence("mock", axis, frames);
        let control = device.control();
        let mut reader = FrameReader::new(device, RetryPolicy::default());
        reader.configure(NATIVE).await.unwrap();
        let store: Arc<dyn ArrayStore> = Arc::new(BincodeArrayStore);
        let acquirer = SpectrumAcquirer::new(
            reader,
            DarkCalibrator::new(store.clone(), dir.path().join("dark.bin")),
            NATIVE,
            false,
        )
        .await
        .unwrap();
        let options = SessionOptions {
            export_path: dir.path().join("data.bin"),
            ..options
        };
        let controller = SessionController::new(acquirer, store, options).await.unwrap();
        (controller, control, dir)
    }

    fn options() -> SessionOptions {
        SessionOptions {
            default_exposure: NATIVE,
            idle_poll: Duration::from_millis(1),
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_construction_seeds_display() {
        // First frame is the dark reference, then 250 counts.
        let (controller, control, _dir) =
            controller(vec![vec![0.0; 3], vec![250.0; 3]], options()).await;
        assert_eq!(control.read_attempts(), 2);
        assert_eq!(controller.mode(), SessionMode::RunningContinuous);
        assert_eq!(controller.state().spectrum().as_slice(), &[250.0; 3]);
    }

    #[tokio::test]
    async fn test_autoscale_uses_headroom() {
        let (mut controller, _control, _dir) =
            controller(vec![vec![0.0; 3], vec![100.0, 250.0, 5.0]], options()).await;
        let before = controller.state().y_limits();
        controller.apply(SessionCommand::Autoscale).await.unwrap();
        let after = controller.state().y_limits();
        assert!((after.upper - 300.0).abs() < 1e-9);
        assert_eq!(after.lower, before.lower);
    }

    #[tokio::test]
    async fn test_toggle_log_scale_flips_lower_bound() {
        let (mut controller, _control, _dir) = controller(vec![vec![1.0; 3]], options()).await;
        let upper = controller.state().y_limits().upper;

        controller.apply(SessionCommand::ToggleLogScale).await.unwrap();
        assert_eq!(controller.state().scale(), ScaleMode::Log);
        assert_eq!(controller.state().y_limits(), YLimits::new(1.0, upper));

        controller.apply(SessionCommand::ToggleLogScale).await.unwrap();
        assert_eq!(controller.state().scale(), ScaleMode::Linear);
        assert_eq!(controller.state().y_limits(), YLimits::new(0.0, upper));
    }

    #[tokio::test]
    async fn test_first_toggle_from_initial_limits_goes_to_log() {
        let (mut controller, _control, _dir) = controller(vec![vec![1.0; 3]], options()).await;
        assert_eq!(controller.state().y_limits(), YLimits::new(-30.0, 1000.0));
        assert_eq!(controller.state().scale(), ScaleMode::Linear);

        controller.apply(SessionCommand::ToggleLogScale).await.unwrap();
        assert_eq!(controller.state().scale(), ScaleMode::Log);
        assert_eq!(controller.state().y_limits(), YLimits::new(1.0, 1000.0));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_exposure_falls_back() {
        let (mut controller, control, _dir) = controller(vec![vec![1.0; 3]], options()).await;
        let reads = control.read_attempts();

        controller
            .apply(SessionCommand::SetRequestedExposure("2.5".into()))
            .await
            .unwrap();
        assert_eq!(controller.state().requested_exposure(), Duration::from_millis(2500));

        controller
            .apply(SessionCommand::SetRequestedExposure("abc".into()))
            .await
            .unwrap();
        assert_eq!(controller.state().requested_exposure(), Duration::from_millis(100));
        assert!(logs_contain("Cannot read value"));

        controller
            .apply(SessionCommand::SetRequestedExposure("-3".into()))
            .await
            .unwrap();
        assert_eq!(controller.state().requested_exposure(), Duration::from_millis(100));

        assert_eq!(controller.mode(), SessionMode::RunningContinuous);
        assert_eq!(control.read_attempts(), reads);
    }

    #[tokio::test]
    async fn test_one_shot_pauses_until_restart() {
        let (mut controller, control, _dir) = controller(vec![vec![2.0; 3]], options()).await;
        let reads = control.read_attempts();

        controller
            .apply(SessionCommand::acquire_for(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(control.read_attempts(), reads + 20);
        assert_eq!(controller.mode(), SessionMode::PausedForOneShot);
        assert!(controller.state().is_paused());

        // Paused: ticks do not read.
        assert!(!controller.tick().await.unwrap());
        assert_eq!(control.read_attempts(), reads + 20);

        controller.apply(SessionCommand::Restart).await.unwrap();
        assert_eq!(controller.mode(), SessionMode::RunningContinuous);
        assert!(controller.tick().await.unwrap());
        assert_eq!(control.read_attempts(), reads + 21);
    }

    #[tokio::test]
    async fn test_one_shot_auto_resume() {
        let options = SessionOptions {
            resume_after_one_shot: true,
            ..options()
        };
        let (mut controller, _control, _dir) = controller(vec![vec![2.0; 3]], options).await;
        controller.apply(SessionCommand::acquire()).await.unwrap();
        assert_eq!(controller.mode(), SessionMode::RunningContinuous);
    }

    #[tokio::test]
    async fn test_one_shot_disabled_variant() {
        let options = SessionOptions {
            supports_one_shot: false,
            ..options()
        };
        let (mut controller, control, _dir) = controller(vec![vec![2.0; 3]], options).await;
        let reads = control.read_attempts();
        controller.apply(SessionCommand::acquire()).await.unwrap();
        assert_eq!(control.read_attempts(), reads);
        assert_eq!(controller.mode(), SessionMode::RunningContinuous);
    }

    #[tokio::test]
    async fn test_one_shot_updates_display() {
        // dark 0, seed 1, then one-shot of two frames 10 and 30.
        let frames = vec![vec![0.0; 3], vec![1.0; 3], vec![10.0; 3], vec![30.0; 3]];
        let (mut controller, _control, _dir) = controller(frames, options()).await;
        controller
            .apply(SessionCommand::acquire_for(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(controller.state().spectrum().as_slice(), &[20.0; 3]);
        assert_eq!(controller.state().exposure(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_save_exports_axis_and_spectrum() {
        let (mut controller, _control, dir) =
            controller(vec![vec![1.0; 3], vec![4.0; 3]], options()).await;
        controller.apply(SessionCommand::save()).await.unwrap();

        let file = BincodeArrayStore
            .load(&dir.path().join("data.bin"))
            .unwrap()
            .unwrap();
        assert_eq!(file.rows.len(), 2);
        assert_eq!(file.rows[0], vec![400.0, 550.0, 700.0]);
        assert_eq!(file.rows[1], vec![3.0; 3]);
        assert_eq!(file.metadata.get("device_id").map(String::as_str), Some("mock"));
        assert_eq!(controller.mode(), SessionMode::RunningContinuous);
    }

    #[tokio::test]
    async fn test_quit_is_terminal() {
        let (mut controller, control, _dir) = controller(vec![vec![1.0; 3]], options()).await;
        controller.apply(SessionCommand::Quit).await.unwrap();
        assert_eq!(controller.mode(), SessionMode::Stopped);
        assert!(!controller.state().is_running());

        let reads = control.read_attempts();
        controller.apply(SessionCommand::Restart).await.unwrap();
        controller.apply(SessionCommand::acquire()).await.unwrap();
        assert!(!controller.tick().await.unwrap());
        assert_eq!(controller.mode(), SessionMode::Stopped);
        assert_eq!(control.read_attempts(), reads);
    }

    #[tokio::test]
    async fn test_updates_are_published() {
        let (mut controller, _control, _dir) = controller(vec![vec![1.0; 3]], options()).await;
        let mut updates = controller.subscribe();
        controller.apply(SessionCommand::ToggleLogScale).await.unwrap();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.scale, ScaleMode::Log);
        assert_eq!(update.wavelengths.len(), 3);
    }
}
