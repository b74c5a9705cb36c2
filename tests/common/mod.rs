#![allow(dead_code)]

use async_trait::async_trait;
use resin_host::config::Config;
use resin_host::exposure::{opcode, DeviceError, ExposureDevice, ExposurePort};
use resin_host::file::PackageError;
use resin_host::layer_source::{LayerArchive, LayerSource};
use resin_host::motion::{HostError, MotionHost, MotionPort};
use resin_host::{PrintEvent, PrintParameters, PrintSequencer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const PNG_BYTES: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

/// Every call that reached a mock, in order, across host, device and archive.
#[derive(Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<String>>>);

impl Timeline {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries without the `M400` queue flushes.
    pub fn without_flushes(&self) -> Vec<String> {
        self.entries().into_iter().filter(|e| e != "M400").collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

struct FailureRule {
    fragment: String,
    remaining: Option<usize>,
}

/// Motion host that records scripts and fails the ones matching a rule.
pub struct RecordingHost {
    timeline: Timeline,
    rules: Mutex<Vec<FailureRule>>,
    pub position: Mutex<[f64; 4]>,
}

impl RecordingHost {
    pub fn new(timeline: Timeline) -> Self {
        Self { timeline, rules: Mutex::new(Vec::new()), position: Mutex::new([0.0; 4]) }
    }

    /// Every script containing `fragment` fails.
    pub fn fail_when(&self, fragment: &str) {
        self.rules.lock().unwrap().push(FailureRule { fragment: fragment.to_string(), remaining: None });
    }

    /// The next `times` scripts containing `fragment` fail.
    pub fn fail_next(&self, fragment: &str, times: usize) {
        self.rules
            .lock()
            .unwrap()
            .push(FailureRule { fragment: fragment.to_string(), remaining: Some(times) });
    }

    fn should_fail(&self, script: &str) -> bool {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !script.contains(&rule.fragment) {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return true,
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return true;
                }
            }
        }
        false
    }
}

#[async_trait]
impl MotionHost for RecordingHost {
    async fn check_connection(&self) -> Result<(), HostError> {
        self.timeline.push("connect");
        if self.should_fail("connect") {
            return Err(HostError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn run_gcode(&self, script: &str, _timeout: Duration) -> Result<(), HostError> {
        self.timeline.push(script);
        if self.should_fail(script) {
            return Err(HostError::Rejected { status: 400, body: format!("rejected: {}", script) });
        }
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), HostError> {
        self.timeline.push("emergency_stop");
        Ok(())
    }

    async fn query_position(&self) -> Result<[f64; 4], HostError> {
        Ok(*self.position.lock().unwrap())
    }
}

/// Exposure device that decodes and records commands.
pub struct RecordingDevice {
    timeline: Timeline,
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub led_switches: Mutex<Vec<(bool, Instant)>>,
    failing_opcodes: Mutex<Vec<(u8, Option<u8>)>>,
    disconnected: Mutex<bool>,
}

impl RecordingDevice {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            writes: Mutex::new(Vec::new()),
            led_switches: Mutex::new(Vec::new()),
            failing_opcodes: Mutex::new(Vec::new()),
            disconnected: Mutex::new(false),
        }
    }

    /// Writes with this opcode (and first data byte, if given) fail.
    pub fn fail_opcode(&self, opcode: u8, first: Option<u8>) {
        self.failing_opcodes.lock().unwrap().push((opcode, first));
    }

    pub fn clear_failures(&self) {
        self.failing_opcodes.lock().unwrap().clear();
    }

    pub fn disconnect(&self) {
        *self.disconnected.lock().unwrap() = true;
    }

    fn describe(payload: &[u8]) -> String {
        match payload {
            [opcode::LED_CONTROL, opcode::LED_ON] => "led on".to_string(),
            [opcode::LED_CONTROL, opcode::LED_OFF] => "led off".to_string(),
            [opcode::LED_BRIGHTNESS, lsb, msb, ..] => format!("brightness {}", u16::from_le_bytes([*lsb, *msb])),
            [opcode::PATTERN_SELECT, code] => format!("pattern 0x{:02X}", code),
            [opcode::PATTERN_ENABLE, 0x01] => "pattern enable".to_string(),
            [opcode::PATTERN_ENABLE, 0x00] => "pattern disable".to_string(),
            [opcode::FLIP, mode] => format!("flip 0x{:02X}", mode),
            other => format!("i2c {:02X?}", other),
        }
    }
}

#[async_trait]
impl ExposureDevice for RecordingDevice {
    async fn i2c_write(&self, _address: u8, payload: &[u8]) -> Result<(), DeviceError> {
        if *self.disconnected.lock().unwrap() {
            return Err(DeviceError::NotConnected);
        }
        let description = Self::describe(payload);
        self.timeline.push(description.clone());
        self.writes.lock().unwrap().push(payload.to_vec());

        let failing = self.failing_opcodes.lock().unwrap().iter().any(|(op, first)| {
            payload.first() == Some(op) && first.is_none_or(|b| payload.get(1) == Some(&b))
        });
        if failing {
            return Err(DeviceError::Status { code: 5 });
        }
        if description == "led on" || description == "led off" {
            self.led_switches.lock().unwrap().push((description == "led on", Instant::now()));
        }
        Ok(())
    }

    async fn set_gpio(&self, _pin: u8, high: bool) -> Result<(), DeviceError> {
        if *self.disconnected.lock().unwrap() {
            return Err(DeviceError::NotConnected);
        }
        self.timeline.push(if high { "projector on" } else { "projector off" });
        Ok(())
    }
}

/// In-memory job with fixed parameters. Reads of `failing_layer` always fail.
pub struct RecordingArchive {
    timeline: Timeline,
    params: PrintParameters,
    pub failing_layer: Option<usize>,
    pub reads: AtomicUsize,
}

impl RecordingArchive {
    pub fn new(timeline: Timeline, params: PrintParameters) -> Self {
        Self { timeline, params, failing_layer: None, reads: AtomicUsize::new(0) }
    }
}

impl LayerArchive for RecordingArchive {
    fn parameters(&self) -> Result<PrintParameters, PackageError> {
        Ok(self.params.clone())
    }

    fn layer_count(&self) -> usize {
        self.params.total_layers
    }

    fn layer_image(&self, index: usize) -> Result<Vec<u8>, PackageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_layer == Some(index) {
            self.timeline.push(format!("image {} failed", index));
            return Err(PackageError::Invalid(format!("layer {} is corrupt", index)));
        }
        self.timeline.push(format!("image {}", index));
        Ok(PNG_BYTES.to_vec())
    }
}

/// Parameters with short, distinct timings and no leveling.
pub fn job_params(total_layers: usize) -> PrintParameters {
    PrintParameters {
        total_layers,
        layer_height: 0.05,
        bottom_layer_count: 1,
        bottom_exposure_time: 5.0,
        normal_exposure_time: 2.0,
        leveling_cycles: 0,
        blade_cycles_per_layer: 1,
        ..PrintParameters::default()
    }
}

pub struct Rig {
    pub sequencer: PrintSequencer,
    pub timeline: Timeline,
    pub host: Arc<RecordingHost>,
    pub device: Arc<RecordingDevice>,
}

pub fn rig() -> Rig {
    rig_with(&Config::default())
}

pub fn rig_with(config: &Config) -> Rig {
    let timeline = Timeline::default();
    let host = Arc::new(RecordingHost::new(timeline.clone()));
    let device = Arc::new(RecordingDevice::new(timeline.clone()));
    let motion = MotionPort::new(host.clone(), &config.motion);
    let exposure = ExposurePort::new(device.clone(), &config.exposure);
    let sequencer = PrintSequencer::new(motion, exposure, &config.sequencer);
    Rig { sequencer, timeline, host, device }
}

impl Rig {
    pub fn source(&self, params: PrintParameters) -> LayerSource {
        LayerSource::new(Arc::new(RecordingArchive::new(self.timeline.clone(), params)))
    }

    pub fn failing_source(&self, params: PrintParameters, layer: usize) -> (LayerSource, Arc<RecordingArchive>) {
        let mut archive = RecordingArchive::new(self.timeline.clone(), params);
        archive.failing_layer = Some(layer);
        let archive = Arc::new(archive);
        (LayerSource::new(archive.clone()), archive)
    }
}

/// Receives until `matches` accepts an event, returning everything seen.
pub async fn recv_until<F>(rx: &mut broadcast::Receiver<PrintEvent>, mut matches: F) -> Vec<PrintEvent>
where
    F: FnMut(&PrintEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = rx.recv().await.expect("event channel closed");
        let done = matches(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Receives until the job's terminal event.
pub async fn recv_terminal(rx: &mut broadcast::Receiver<PrintEvent>) -> Vec<PrintEvent> {
    recv_until(rx, PrintEvent::is_terminal).await
}
