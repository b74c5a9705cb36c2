// src/print_job/mod.rs - Print sequencer: job lifecycle and control surface
mod run;

use chrono::{DateTime, Utc};
use futures_core::stream::Stream;
use resin_shared::{ParameterOverrides, PrintEvent, PrintJobError, PrintParameters, SequencerState};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::SequencerConfig;
use crate::exposure::{ExposureError, ExposurePort};
use crate::layer_source::{LayerSource, LayerSourceError, RetryPolicy};
use crate::motion::{EmergencyHandle, MotionError, MotionPort};

use run::JobRunner;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    #[error(transparent)]
    Layer(#[from] LayerSourceError),
    #[error(transparent)]
    Job(#[from] PrintJobError),
    #[error("Hardware is held by another operation")]
    HardwareBusy,
    #[error("Print worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// The two device ports. Owned by exactly one job (or idle operation) at a time.
pub struct Hardware {
    pub motion: MotionPort,
    pub exposure: ExposurePort,
}

/// A started job: its source plus the parameters frozen at start.
#[derive(Clone)]
pub struct PrintJob {
    pub id: String,
    pub parameters: PrintParameters,
    pub started_at: DateTime<Utc>,
    pub source: LayerSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ControlFlags {
    pub paused: bool,
    pub stopped: bool,
}

/// State shared between the control surface and the job worker.
pub(crate) struct Shared {
    state: watch::Sender<SequencerState>,
    control: watch::Sender<ControlFlags>,
    events: broadcast::Sender<PrintEvent>,
}

impl Shared {
    pub(crate) fn state(&self) -> SequencerState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SequencerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("Sequencer state: {} -> {}", previous, state);
            self.emit(PrintEvent::StateChanged(state));
        }
    }

    pub(crate) fn emit(&self, event: PrintEvent) {
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.events.send(event);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.control.borrow().stopped
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.control.borrow().paused
    }

    pub(crate) fn request_stop(&self) {
        self.control.send_modify(|flags| {
            flags.stopped = true;
            flags.paused = false;
        });
    }

    pub(crate) fn control(&self) -> watch::Receiver<ControlFlags> {
        self.control.subscribe()
    }
}

/// Runs one print job at a time on a dedicated task.
///
/// `pause`, `resume` and `stop` only flip flags and return immediately;
/// the worker acts on them at its checkpoints. Everything the worker does
/// is reported through [`events`](Self::events).
pub struct PrintSequencer {
    hardware: Arc<Mutex<Hardware>>,
    settings: SequencerConfig,
    shared: Arc<Shared>,
    emergency: EmergencyHandle,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PrintSequencer {
    pub fn new(motion: MotionPort, exposure: ExposurePort, settings: &SequencerConfig) -> Self {
        let emergency = motion.emergency_handle();
        let (state, _) = watch::channel(SequencerState::Idle);
        let (control, _) = watch::channel(ControlFlags::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            hardware: Arc::new(Mutex::new(Hardware { motion, exposure })),
            settings: settings.clone(),
            shared: Arc::new(Shared { state, control, events }),
            emergency,
            worker: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SequencerState {
        self.shared.state()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SequencerState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrintEvent> {
        self.shared.events.subscribe()
    }

    /// Events from now on, as a stream. Ends when the sequencer is dropped.
    pub fn events(&self) -> impl Stream<Item = PrintEvent> + Send + 'static {
        let mut rx = self.shared.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event consumer lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Starts a job from `source`, with `overrides` applied on top of the
    /// package's own parameters. Returns the job id.
    ///
    /// Rejected unless the sequencer is idle.
    pub async fn start(&self, source: LayerSource, overrides: &ParameterOverrides) -> Result<String, SequencerError> {
        let current = self.state();
        if current != SequencerState::Idle {
            tracing::warn!("Start rejected: job already active ({})", current);
            return Err(PrintJobError::Busy(current).into());
        }

        let parameters = source.parameters().await?.with_overrides(overrides);
        parameters.validate()?;
        if parameters.total_layers == 0 {
            return Err(PrintJobError::EmptyJob.into());
        }
        let available = source.layer_count();
        if parameters.total_layers > available {
            return Err(PrintJobError::InvalidParameter {
                name: "total_layers".to_string(),
                value: format!("{} (package has {} layers)", parameters.total_layers, available),
            }
            .into());
        }

        let hardware = self
            .hardware
            .clone()
            .try_lock_owned()
            .map_err(|_| SequencerError::HardwareBusy)?;

        let mut busy = None;
        self.shared.state.send_if_modified(|state| {
            if *state == SequencerState::Idle {
                *state = SequencerState::Initializing;
                true
            } else {
                busy = Some(*state);
                false
            }
        });
        if let Some(state) = busy {
            return Err(PrintJobError::Busy(state).into());
        }
        self.shared.control.send_replace(ControlFlags::default());
        tracing::info!("Sequencer state: {} -> {}", SequencerState::Idle, SequencerState::Initializing);
        self.shared.emit(PrintEvent::StateChanged(SequencerState::Initializing));

        let job = PrintJob {
            id: uuid::Uuid::new_v4().to_string(),
            parameters,
            started_at: Utc::now(),
            source: source.with_retry(RetryPolicy::from(&self.settings)),
        };
        let id = job.id.clone();
        tracing::info!(
            "Starting job {}: {} layers, {} bottom, blade {} x{} @ {} mm/min, LED {}",
            id,
            job.parameters.total_layers,
            job.parameters.bottom_layer_count,
            job.parameters.blade_mode,
            job.parameters.blade_cycles_per_layer,
            job.parameters.blade_speed,
            job.parameters.led_power
        );

        let runner = JobRunner::new(job, self.shared.clone(), self.settings.clone());
        let handle = tokio::spawn(runner.run(hardware));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(id)
    }

    /// Requests a pause at the next checkpoint (after the blade sweep, before
    /// the layer image). An exposure in progress always completes.
    /// Returns whether the request changed anything.
    pub fn pause(&self) -> bool {
        let state = self.state();
        if !state.can_pause() {
            tracing::debug!("Pause ignored in state {}", state);
            return false;
        }
        let changed = self.shared.control.send_if_modified(|flags| {
            if flags.paused || flags.stopped {
                false
            } else {
                flags.paused = true;
                true
            }
        });
        if changed {
            tracing::info!("Pause requested");
        }
        changed
    }

    /// Clears a pause request. A no-op when not paused.
    pub fn resume(&self) -> bool {
        let changed = self.shared.control.send_if_modified(|flags| {
            if flags.paused {
                flags.paused = false;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("Resume requested");
        }
        changed
    }

    /// Requests the active job to stop. Sticky until the next `start`.
    pub fn stop(&self) -> bool {
        let state = self.state();
        if !state.is_active() {
            return false;
        }
        tracing::info!("Stop requested (state {})", state);
        self.shared.request_stop();
        true
    }

    /// Stops the job and shuts the motion host down. Recovery needs a
    /// restart of the host.
    pub async fn emergency_stop(&self) -> Result<(), SequencerError> {
        tracing::error!("Emergency stop");
        self.shared.request_stop();
        self.emergency.trigger().await?;
        Ok(())
    }

    /// Waits for the worker of the current (or last) job to finish.
    pub async fn join(&self) -> Result<(), SequencerError> {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    /// Lends the hardware to calibration or cleaning flows. Fails while a
    /// job is active.
    pub fn idle_hardware(&self) -> Result<OwnedMutexGuard<Hardware>, SequencerError> {
        let state = self.state();
        if state.is_active() {
            return Err(PrintJobError::Busy(state).into());
        }
        self.hardware
            .clone()
            .try_lock_owned()
            .map_err(|_| SequencerError::HardwareBusy)
    }
}
