// src/motion/mod.rs - Stateful port to the remote motion host
pub mod host;

pub use host::{HostError, MoonrakerHost, MotionHost, SimulatedHost};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{JobSignalScripts, MotionConfig, MotionTiming, TravelLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Build plate, sets the layer height.
    Z,
    /// Leveling blade.
    X,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Z => f.write_str("Z"),
            Axis::X => f.write_str("X"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("Motion host unreachable: {0}")]
    Connectivity(#[source] HostError),
    #[error("Homing {axis} failed: {source}")]
    Homing { axis: Axis, source: HostError },
    #[error("Command '{command}' failed: {source}")]
    Command { command: String, source: HostError },
    #[error("Invalid feed rate {speed} for {axis} move")]
    InvalidFeedRate { axis: Axis, speed: f64 },
}

/// Outcome of waiting for the motion queue to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStatus {
    /// The host confirmed the queue is empty.
    Confirmed,
    /// Every `M400` attempt failed; a fixed delay was waited instead.
    Degraded,
}

/// Cached axis positions. Written only after the host confirmed a command.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionState {
    pub current_z: f64,
    pub current_x: f64,
    pub z_homed: bool,
    pub x_homed: bool,
}

impl MotionState {
    pub fn position(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Z => self.current_z,
            Axis::X => self.current_x,
        }
    }

    pub fn is_homed(&self, axis: Axis) -> bool {
        match axis {
            Axis::Z => self.z_homed,
            Axis::X => self.x_homed,
        }
    }

    fn set_position(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::Z => self.current_z = value,
            Axis::X => self.current_x = value,
        }
    }

    fn set_homed(&mut self, axis: Axis, homed: bool) {
        match axis {
            Axis::Z => self.z_homed = homed,
            Axis::X => self.x_homed = homed,
        }
    }
}

/// Job state changes reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSignal {
    Paused,
    Resumed,
    Cancelled,
    Finished,
}

/// Out-of-band access to the host's full shutdown. Usable while the port
/// itself is owned by a running job.
#[derive(Clone)]
pub struct EmergencyHandle {
    host: Arc<dyn MotionHost>,
}

impl EmergencyHandle {
    pub async fn trigger(&self) -> Result<(), MotionError> {
        tracing::warn!("Emergency shutdown of the motion host");
        self.host.emergency_stop().await.map_err(MotionError::Connectivity)
    }
}

/// Single-owner wrapper around a [`MotionHost`].
///
/// Not meant for concurrent use: every method takes `&mut self` and waits
/// for the host before returning.
pub struct MotionPort {
    host: Arc<dyn MotionHost>,
    limits: TravelLimits,
    timing: MotionTiming,
    signals: JobSignalScripts,
    state: MotionState,
}

impl MotionPort {
    pub fn new(host: Arc<dyn MotionHost>, config: &MotionConfig) -> Self {
        Self {
            host,
            limits: config.limits.clone(),
            timing: config.timing.clone(),
            signals: config.job_signals.clone(),
            state: MotionState::default(),
        }
    }

    pub fn state(&self) -> &MotionState {
        &self.state
    }

    pub fn limits(&self) -> &TravelLimits {
        &self.limits
    }

    pub fn emergency_handle(&self) -> EmergencyHandle {
        EmergencyHandle { host: self.host.clone() }
    }

    pub async fn connect(&self) -> Result<(), MotionError> {
        self.host.check_connection().await.map_err(|e| {
            tracing::error!("Motion host unreachable: {}", e);
            MotionError::Connectivity(e)
        })?;
        tracing::info!("Motion host connected");
        Ok(())
    }

    /// Clamps `target` into the configured travel range of `axis`.
    pub fn clamp(&self, axis: Axis, target: f64) -> f64 {
        let (min, max) = match axis {
            Axis::Z => (self.limits.z_min, self.limits.z_max),
            Axis::X => (self.limits.x_min, self.limits.x_max),
        };
        target.clamp(min, max)
    }

    /// Caps `speed` at the axis's feed limit. Zero, negative and non-finite
    /// rates are rejected.
    pub fn feed_rate(&self, axis: Axis, speed: f64) -> Result<f64, MotionError> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(MotionError::InvalidFeedRate { axis, speed });
        }
        let max = match axis {
            Axis::Z => self.limits.z_max_feed,
            Axis::X => self.limits.x_max_feed,
        };
        if speed > max {
            tracing::warn!("{} feed rate {} above limit, using {}", axis, speed, max);
            return Ok(max);
        }
        Ok(speed)
    }

    /// Far end of the blade travel.
    pub fn x_far(&self) -> f64 {
        self.limits.x_max
    }

    fn idle_timeout(&self, axis: Axis) -> Duration {
        match axis {
            Axis::Z => self.timing.home_timeout(),
            Axis::X => self.timing.travel_timeout(),
        }
    }

    fn move_timeout(&self, axis: Axis) -> Duration {
        match axis {
            Axis::Z => self.timing.command_timeout(),
            Axis::X => self.timing.travel_timeout(),
        }
    }

    async fn send(&self, script: &str, timeout: Duration) -> Result<(), MotionError> {
        self.host
            .run_gcode(script, timeout)
            .await
            .map_err(|source| MotionError::Command { command: script.replace('\n', " | "), source })
    }

    pub async fn home(&mut self, axis: Axis) -> Result<(), MotionError> {
        tracing::info!("Homing {}", axis);
        let timeout = self.timing.home_timeout();
        self.host
            .run_gcode(&format!("G28 {}", axis), timeout)
            .await
            .map_err(|source| {
                tracing::error!("Homing {} failed: {}", axis, source);
                MotionError::Homing { axis, source }
            })?;
        self.state.set_position(axis, 0.0);
        self.state.set_homed(axis, true);
        self.wait_idle(timeout).await;
        tracing::info!("{} homed", axis);
        Ok(())
    }

    /// Absolute move followed by a wait for the motion queue to drain.
    ///
    /// A degraded idle wait still counts as success.
    pub async fn move_absolute(&mut self, axis: Axis, target: f64, speed: f64) -> Result<IdleStatus, MotionError> {
        let speed = self.feed_rate(axis, speed)?;
        let clamped = self.clamp(axis, target);
        if clamped != target {
            tracing::warn!(
                "{} target clamped: {:.3}mm -> {:.3}mm (range {:.1}~{:.1}mm)",
                axis,
                target,
                clamped,
                match axis { Axis::Z => self.limits.z_min, Axis::X => self.limits.x_min },
                match axis { Axis::Z => self.limits.z_max, Axis::X => self.limits.x_max },
            );
        }
        if !self.state.is_homed(axis) {
            tracing::warn!("{} absolute move without a confirmed home", axis);
        }

        let script = match axis {
            Axis::Z => format!("G90\nG0 Z{:.3} F{}", clamped, speed),
            Axis::X => format!("G90\nG1 X{:.1} F{}", clamped, speed),
        };
        let previous = self.state.position(axis);
        self.send(&script, self.move_timeout(axis)).await?;
        self.state.set_position(axis, clamped);
        tracing::debug!("{} at {:.3}mm", axis, clamped);

        let status = self.wait_idle(self.idle_timeout(axis)).await;
        if status == IdleStatus::Degraded && axis == Axis::X {
            let expected = travel_time((clamped - previous).abs(), speed);
            tracing::warn!("X completion unconfirmed, waiting expected travel time {:.1}s", expected.as_secs_f64());
            sleep(expected).await;
        }
        Ok(status)
    }

    /// Relative move, clamped so the result stays in range. Clears the
    /// axis's homed flag since the origin is no longer guaranteed.
    pub async fn move_relative(&mut self, axis: Axis, distance: f64, speed: f64) -> Result<IdleStatus, MotionError> {
        let speed = self.feed_rate(axis, speed)?;
        let current = self.state.position(axis);
        let target = self.clamp(axis, current + distance);
        let actual = target - current;
        if actual.abs() < f64::EPSILON {
            tracing::info!("{} already at travel limit ({:.1}mm), move skipped", axis, current);
            return Ok(IdleStatus::Confirmed);
        }
        if (actual - distance).abs() > f64::EPSILON {
            tracing::warn!("{} relative move limited: {:.3}mm -> {:.3}mm", axis, distance, actual);
        }

        let script = format!("G91\nG1 {}{:.3} F{}\nG90", axis, actual, speed);
        self.send(&script, self.move_timeout(axis)).await?;
        self.state.set_position(axis, target);
        self.state.set_homed(axis, false);
        Ok(self.wait_idle(self.idle_timeout(axis)).await)
    }

    /// Waits for the host's motion queue to drain (`M400`).
    ///
    /// Retries a bounded number of times; if every attempt fails it waits a
    /// fixed delay and reports [`IdleStatus::Degraded`] instead of failing.
    pub async fn wait_idle(&self, timeout: Duration) -> IdleStatus {
        let attempts = self.timing.idle_attempts.max(1);
        for attempt in 1..=attempts {
            match self.host.run_gcode("M400", timeout).await {
                Ok(()) => {
                    sleep(Duration::from_millis(self.timing.idle_settle_ms)).await;
                    return IdleStatus::Confirmed;
                }
                Err(e) => {
                    tracing::warn!("M400 attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        sleep(Duration::from_millis(self.timing.idle_retry_backoff_ms)).await;
                    }
                }
            }
        }
        tracing::warn!(
            "Motion completion unconfirmed after {} attempts, using fixed {}ms wait",
            attempts,
            self.timing.idle_fallback_ms
        );
        sleep(Duration::from_millis(self.timing.idle_fallback_ms)).await;
        IdleStatus::Degraded
    }

    pub async fn dwell(&self, millis: u64) -> Result<(), MotionError> {
        if millis == 0 {
            return Ok(());
        }
        self.send(&format!("G4 P{}", millis), self.timing.command_timeout()).await
    }

    /// Cancels in-flight motion; the host keeps running.
    pub async fn quick_stop(&mut self) -> Result<(), MotionError> {
        tracing::warn!("Quick stop: cancelling current motion");
        self.send("M410", self.timing.quick_stop_timeout()).await?;
        self.state.set_homed(Axis::X, false);
        self.state.set_homed(Axis::Z, false);
        Ok(())
    }

    /// Full motion host shutdown, for operator panic stops only.
    pub async fn emergency_shutdown(&mut self) -> Result<(), MotionError> {
        self.emergency_handle().trigger().await?;
        self.state.set_homed(Axis::X, false);
        self.state.set_homed(Axis::Z, false);
        Ok(())
    }

    /// Tells the host the job changed state so it clears or keeps its
    /// hold state accordingly.
    pub async fn signal_job(&self, signal: JobSignal) -> Result<(), MotionError> {
        let script = match signal {
            JobSignal::Paused => &self.signals.paused,
            JobSignal::Resumed => &self.signals.resumed,
            JobSignal::Cancelled => &self.signals.cancelled,
            JobSignal::Finished => &self.signals.finished,
        };
        if script.trim().is_empty() {
            return Ok(());
        }
        tracing::info!("Job {:?}: notifying motion host", signal);
        self.send(script, self.timing.command_timeout()).await
    }

    /// Replaces the cached positions with what the host reports.
    pub async fn sync_position(&mut self) -> Result<MotionState, MotionError> {
        let position = self.host.query_position().await.map_err(MotionError::Connectivity)?;
        self.state.current_x = position[0];
        self.state.current_z = position[2];
        Ok(self.state)
    }
}

/// Expected duration of a `distance` mm move at `speed` mm/min.
fn travel_time(distance: f64, speed: f64) -> Duration {
    if speed <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(distance / speed * 60.0)
}
