use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PrintJobError {
    #[error("A job is already active (state: {0})")]
    Busy(SequencerState),
    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter { name: String, value: String },
    #[error("Job has no layers")]
    EmptyJob,
}

/// Lifecycle of the print engine. Only one job is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SequencerState {
    Idle,
    Initializing,
    Leveling,
    Printing,
    Paused,
    Stopping,
    Completed,
    Error,
}

impl SequencerState {
    /// A job owns the hardware in every state except `Idle`.
    pub fn is_active(&self) -> bool {
        !matches!(self, SequencerState::Idle)
    }

    /// States in which `pause()` is accepted.
    pub fn can_pause(&self) -> bool {
        matches!(
            self,
            SequencerState::Initializing | SequencerState::Leveling | SequencerState::Printing
        )
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequencerState::Idle => "IDLE",
            SequencerState::Initializing => "INITIALIZING",
            SequencerState::Leveling => "LEVELING",
            SequencerState::Printing => "PRINTING",
            SequencerState::Paused => "PAUSED",
            SequencerState::Stopping => "STOPPING",
            SequencerState::Completed => "COMPLETED",
            SequencerState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Encoded raster of one layer. Fetched on demand and dropped after display.
#[derive(Clone, PartialEq, Eq)]
pub struct LayerImage {
    pub index: usize,
    pub data: Vec<u8>,
}

impl fmt::Debug for LayerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerImage")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Everything the engine reports to the UI. Exactly one of `Completed`,
/// `Stopped` or `Error` ends each job.
#[derive(Debug, Clone)]
pub enum PrintEvent {
    StateChanged(SequencerState),
    /// `current` counts finished layers.
    Progress { current: usize, total: usize },
    LayerStarted(usize),
    LayerImageReady(Arc<LayerImage>),
    ImageCleared,
    LayerCompleted(usize),
    Error(String),
    Completed,
    Stopped,
}

impl PrintEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PrintEvent::Completed | PrintEvent::Stopped | PrintEvent::Error(_))
    }
}
