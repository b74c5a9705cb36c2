//! Print host for a bottom-up DLP resin printer.
//!
//! Turns a packaged job (layer images + manifest) into the sequence of
//! motion host and exposure device commands that prints it, with
//! pause/resume/stop from the outside.

pub mod config;
pub mod exposure;
pub mod file;
pub mod layer_source;
pub mod motion;
pub mod print_job;

pub use print_job::{Hardware, PrintJob, PrintSequencer, SequencerError};
pub use resin_shared::{
    BladeMode, LayerImage, ParameterOverrides, PrintEvent, PrintJobError, PrintParameters, SequencerState,
};

use std::sync::Arc;
use thiserror::Error;

use config::{Config, ExposureConfig};
use exposure::{DeviceError, ExposureDevice, ExposurePort, SimulatedDevice};
use motion::{HostError, MoonrakerHost, MotionHost, MotionPort, SimulatedHost};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Motion host setup failed: {0}")]
    Host(#[from] HostError),
    #[error("Exposure device setup failed: {0}")]
    Device(#[from] DeviceError),
}

pub fn motion_host(config: &Config, simulate: bool) -> Result<Arc<dyn MotionHost>, SetupError> {
    if simulate {
        tracing::info!("Using simulated motion host");
        return Ok(Arc::new(SimulatedHost));
    }
    tracing::info!("Using motion host at {}", config.motion_host.url);
    Ok(Arc::new(MoonrakerHost::new(&config.motion_host)?))
}

pub fn exposure_device(config: &ExposureConfig, simulate: bool) -> Result<Arc<dyn ExposureDevice>, SetupError> {
    if simulate || config.simulate {
        tracing::info!("Using simulated exposure device");
        return Ok(Arc::new(SimulatedDevice));
    }
    #[cfg(feature = "cyusb")]
    {
        Ok(Arc::new(exposure::cyusb::CyUsbDevice::open(config)?))
    }
    #[cfg(not(feature = "cyusb"))]
    {
        Err(DeviceError::Library("built without the `cyusb` feature; enable it or set exposure.simulate".to_string()).into())
    }
}

/// Wires ports and sequencer from one configuration.
pub fn build_sequencer(config: &Config, simulate: bool) -> Result<PrintSequencer, SetupError> {
    let motion = MotionPort::new(motion_host(config, simulate)?, &config.motion);
    let exposure = ExposurePort::new(exposure_device(&config.exposure, simulate)?, &config.exposure);
    Ok(PrintSequencer::new(motion, exposure, &config.sequencer))
}
