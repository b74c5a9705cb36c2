// src/print_job/run.rs - Worker side of a print job: the per-layer sequence
use resin_shared::{BladeMode, PrintEvent, SequencerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{sleep, Instant};

use super::{Hardware, PrintJob, SequencerError, Shared};
use crate::config::SequencerConfig;
use crate::motion::{Axis, JobSignal};

/// Positions closer than this are the same target.
const POSITION_EPSILON: f64 = 1e-6;

enum Outcome {
    Completed,
    Stopped,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
}

pub(super) struct JobRunner {
    job: PrintJob,
    shared: Arc<Shared>,
    settings: SequencerConfig,
}

impl JobRunner {
    pub(super) fn new(job: PrintJob, shared: Arc<Shared>, settings: SequencerConfig) -> Self {
        Self { job, shared, settings }
    }

    fn stopped(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Runs the job to its end, cleans up, releases the hardware and only
    /// then reports the single terminal event.
    pub(super) async fn run(self, mut hardware: OwnedMutexGuard<Hardware>) {
        let result = self.execute(&mut hardware).await;

        let (completed, terminal) = match result {
            Ok(Outcome::Completed) => {
                tracing::info!("Job {} completed", self.job.id);
                self.shared.set_state(SequencerState::Completed);
                (true, PrintEvent::Completed)
            }
            Ok(Outcome::Stopped) => {
                tracing::info!("Job {} stopped", self.job.id);
                self.shared.set_state(SequencerState::Stopping);
                (false, PrintEvent::Stopped)
            }
            Err(e) => {
                tracing::error!("Job {} failed: {}", self.job.id, e);
                self.shared.request_stop();
                self.shared.set_state(SequencerState::Error);
                (false, PrintEvent::Error(e.to_string()))
            }
        };

        let failed = matches!(terminal, PrintEvent::Error(_));
        self.cleanup(&mut hardware, completed, failed).await;
        drop(hardware);

        self.shared.set_state(SequencerState::Idle);
        self.shared.emit(terminal);
    }

    async fn execute(&self, hw: &mut Hardware) -> Result<Outcome, SequencerError> {
        let params = &self.job.parameters;

        hw.motion.connect().await?;
        hw.exposure.set_brightness(params.led_power).await?;

        if self.stopped() {
            return Ok(Outcome::Stopped);
        }
        hw.motion.home(Axis::Z).await?;
        if self.stopped() {
            return Ok(Outcome::Stopped);
        }
        hw.motion.home(Axis::X).await?;

        if params.leveling_cycles > 0 {
            if self.stopped() {
                return Ok(Outcome::Stopped);
            }
            self.shared.set_state(SequencerState::Leveling);
            if self.level(hw).await? == Flow::Stopped {
                return Ok(Outcome::Stopped);
            }
        }

        if self.stopped() {
            return Ok(Outcome::Stopped);
        }
        hw.exposure.projector_power(true).await?;

        self.shared.set_state(SequencerState::Printing);
        let total = params.total_layers;
        self.shared.emit(PrintEvent::Progress { current: 0, total });

        for index in 0..total {
            if self.stopped() {
                return Ok(Outcome::Stopped);
            }
            if self.print_layer(hw, index).await? == Flow::Stopped {
                return Ok(Outcome::Stopped);
            }
            self.shared.emit(PrintEvent::LayerCompleted(index));
            self.shared.emit(PrintEvent::Progress { current: index + 1, total });
        }
        Ok(Outcome::Completed)
    }

    /// Flattens the resin before the first layer: plate just above the vat
    /// floor, full blade round trips, then Z homed again.
    async fn level(&self, hw: &mut Hardware) -> Result<Flow, SequencerError> {
        let params = &self.job.parameters;
        let cycles = params.leveling_cycles;
        let settle = Duration::from_millis(self.settings.blade_settle_ms);
        let far = hw.motion.x_far();
        tracing::info!("Leveling resin ({} cycles)", cycles);

        hw.motion
            .move_absolute(Axis::Z, self.settings.leveling_lift_mm, params.drop_speed)
            .await?;
        for cycle in 1..=cycles {
            if self.stopped() {
                return Ok(Flow::Stopped);
            }
            hw.motion.move_absolute(Axis::X, far, params.blade_speed).await?;
            sleep(settle).await;
            hw.motion.move_absolute(Axis::X, 0.0, params.blade_speed).await?;
            sleep(settle).await;
            tracing::debug!("Leveling cycle {}/{} done", cycle, cycles);
        }
        hw.motion.home(Axis::Z).await?;
        Ok(Flow::Continue)
    }

    async fn print_layer(&self, hw: &mut Hardware, index: usize) -> Result<Flow, SequencerError> {
        let params = &self.job.parameters;
        let profile = params.layer_profile(index);
        let z = params.layer_z(index);

        self.shared.emit(PrintEvent::LayerStarted(index));
        tracing::info!(
            "Layer {}/{} ({}): z={:.3}mm exposure={:.1}s",
            index + 1,
            params.total_layers,
            if profile.bottom { "bottom" } else { "normal" },
            z,
            profile.exposure.as_secs_f64()
        );

        // The previous layer's drop normally leaves the plate here already.
        let target = hw.motion.clamp(Axis::Z, z);
        if (hw.motion.state().current_z - target).abs() > POSITION_EPSILON {
            hw.motion.move_absolute(Axis::Z, z, params.drop_speed).await?;
        }

        if self.stopped() {
            return Ok(Flow::Stopped);
        }
        self.sweep_blade(hw).await?;

        if self.stopped() {
            return Ok(Flow::Stopped);
        }
        if self.honor_pause(hw).await? == Flow::Stopped {
            return Ok(Flow::Stopped);
        }

        let image = self.job.source.layer_image(index).await?;
        self.shared.emit(PrintEvent::LayerImageReady(Arc::new(image)));

        // Exposure is atomic with respect to pause; only stop cuts it short.
        hw.exposure.led_on(Some(params.led_power)).await?;
        let interrupted = self.wait_exposure(profile.exposure).await;
        hw.exposure.led_off().await?;
        self.shared.emit(PrintEvent::ImageCleared);
        if interrupted {
            tracing::info!("Exposure of layer {} cut short by stop", index);
        }

        // Stop only: a pause waits for the next layer's checkpoint.
        if self.stopped() {
            return Ok(Flow::Stopped);
        }
        hw.motion
            .move_absolute(Axis::Z, z + profile.lift_height, profile.lift_speed)
            .await?;

        if params.blade_mode == BladeMode::Oneway && hw.motion.state().current_x.abs() > POSITION_EPSILON {
            if self.stopped() {
                return Ok(Flow::Stopped);
            }
            hw.motion.move_absolute(Axis::X, 0.0, params.blade_speed).await?;
        }

        if !params.is_last_layer(index) {
            if self.stopped() {
                return Ok(Flow::Stopped);
            }
            hw.motion
                .move_absolute(Axis::Z, params.layer_z(index + 1), params.drop_speed)
                .await?;
        }
        Ok(Flow::Continue)
    }

    async fn sweep_blade(&self, hw: &mut Hardware) -> Result<(), SequencerError> {
        let params = &self.job.parameters;
        let far = hw.motion.x_far();
        let cycles = params.blade_cycles_per_layer;

        match params.blade_mode {
            BladeMode::Roundtrip => {
                for _ in 0..cycles {
                    hw.motion.move_absolute(Axis::X, far, params.blade_speed).await?;
                    hw.motion.move_absolute(Axis::X, 0.0, params.blade_speed).await?;
                }
            }
            BladeMode::Oneway => {
                // The blade stays at the far end after the last pass.
                for pass in 0..cycles {
                    if pass > 0 {
                        hw.motion.move_absolute(Axis::X, 0.0, params.blade_speed).await?;
                    }
                    hw.motion.move_absolute(Axis::X, far, params.blade_speed).await?;
                }
            }
        }
        Ok(())
    }

    /// The only place a pause is honored. Tells the host the job is held,
    /// blocks until resumed or stopped, then lets the machine settle.
    async fn honor_pause(&self, hw: &mut Hardware) -> Result<Flow, SequencerError> {
        if !self.shared.pause_requested() {
            return Ok(Flow::Continue);
        }

        let mut control = self.shared.control();
        self.shared.set_state(SequencerState::Paused);
        hw.motion.signal_job(JobSignal::Paused).await?;

        let stopped = control
            .wait_for(|flags| !flags.paused || flags.stopped)
            .await
            .map(|flags| flags.stopped)
            .unwrap_or(true);
        if stopped {
            return Ok(Flow::Stopped);
        }

        tracing::info!("Resuming job {}", self.job.id);
        hw.motion.signal_job(JobSignal::Resumed).await?;
        sleep(Duration::from_millis(self.settings.resume_settle_ms)).await;
        self.shared.set_state(SequencerState::Printing);
        Ok(Flow::Continue)
    }

    /// Waits out the exposure in short slices. Returns `true` if a stop
    /// request ended it early.
    async fn wait_exposure(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let slice = Duration::from_millis(self.settings.exposure_poll_ms.max(1));
        loop {
            if self.stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep((deadline - now).min(slice)).await;
        }
    }

    /// Puts the machine in a safe state. Failures are logged and never
    /// replace the job's own outcome.
    async fn cleanup(&self, hw: &mut Hardware, completed: bool, failed: bool) {
        tracing::info!("Cleaning up after job {}", self.job.id);

        if failed {
            if let Err(e) = hw.motion.quick_stop().await {
                tracing::warn!("Cleanup: quick stop failed: {}", e);
            }
        }
        if let Err(e) = hw.exposure.ensure_led_off().await {
            tracing::warn!("Cleanup: LED off failed: {}", e);
        }
        if hw.exposure.is_projector_on() {
            if let Err(e) = hw.exposure.projector_power(false).await {
                tracing::warn!("Cleanup: projector off failed: {}", e);
            }
        }
        self.shared.emit(PrintEvent::ImageCleared);

        if let Err(e) = hw.motion.home(Axis::X).await {
            tracing::warn!("Cleanup: homing X failed: {}", e);
        }
        let signal = if completed { JobSignal::Finished } else { JobSignal::Cancelled };
        if let Err(e) = hw.motion.signal_job(signal).await {
            tracing::warn!("Cleanup: job {:?} notification failed: {}", signal, e);
        }
    }
}
