// resin_shared: job parameters, sequencer states and events shared by the
// print engine and whatever UI layer consumes it.

pub mod params;
pub mod print_job;

pub use params::{BladeMode, MAX_EXPOSURE_SECS, ParameterOverrides, PrintParameters};
pub use print_job::{LayerImage, PrintEvent, PrintJobError, SequencerState};
