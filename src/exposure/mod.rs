// src/exposure/mod.rs - UV LED and projector control
pub mod device;
#[cfg(feature = "cyusb")]
pub mod cyusb;

pub use device::{DeviceError, ExposureDevice, SimulatedDevice};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::ExposureConfig;

/// Command bytes understood by the projector board.
pub mod opcode {
    pub const LED_CONTROL: u8 = 0x52;
    pub const LED_BRIGHTNESS: u8 = 0x54;
    pub const PATTERN_SELECT: u8 = 0x05;
    pub const PATTERN_ENABLE: u8 = 0x0B;
    pub const FLIP: u8 = 0x14;

    pub const LED_ON: u8 = 0x07;
    pub const LED_OFF: u8 = 0x00;
    pub const FLIP_HORIZONTAL: u8 = 0x02;
    pub const FLIP_VERTICAL: u8 = 0x04;
}

/// Built-in test patterns.
pub mod pattern {
    pub const RAMP: u8 = 0x01;
    pub const CHECKER: u8 = 0x07;
}

#[derive(Debug, Error)]
pub enum ExposureError {
    #[error("Exposure device unreachable: {0}")]
    Connectivity(#[source] DeviceError),
    #[error("Exposure command '{command}' rejected: {source}")]
    DeviceCommand { command: &'static str, source: DeviceError },
}

impl ExposureError {
    fn from_device(command: &'static str, source: DeviceError) -> Self {
        match source {
            DeviceError::NotConnected => ExposureError::Connectivity(source),
            other => ExposureError::DeviceCommand { command, source: other },
        }
    }
}

/// What the port knows about the LED. A failed command leaves it `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    On,
    Off,
    Unknown,
}

/// Brightness payload: LSB/MSB repeated once per colour channel.
pub fn encode_brightness(value: u16) -> [u8; 6] {
    let [lsb, msb] = value.to_le_bytes();
    [lsb, msb, lsb, msb, lsb, msb]
}

pub fn flip_mode(horizontal: bool, vertical: bool) -> u8 {
    let mut mode = 0x00;
    if horizontal {
        mode |= opcode::FLIP_HORIZONTAL;
    }
    if vertical {
        mode |= opcode::FLIP_VERTICAL;
    }
    mode
}

/// Single-owner wrapper around an [`ExposureDevice`].
///
/// No call is retried here; retry and abort policy belongs to the caller.
pub struct ExposurePort {
    device: Arc<dyn ExposureDevice>,
    config: ExposureConfig,
    led: LedState,
    projector_on: bool,
    brightness: u16,
    flip: u8,
}

impl ExposurePort {
    pub fn new(device: Arc<dyn ExposureDevice>, config: &ExposureConfig) -> Self {
        let brightness = config
            .default_brightness
            .clamp(config.min_brightness, config.max_brightness);
        Self {
            device,
            config: config.clone(),
            led: LedState::Unknown,
            projector_on: false,
            brightness,
            flip: 0x00,
        }
    }

    pub fn led_state(&self) -> LedState {
        self.led
    }

    pub fn brightness(&self) -> u16 {
        self.brightness
    }

    pub fn is_projector_on(&self) -> bool {
        self.projector_on
    }

    pub fn flip(&self) -> u8 {
        self.flip
    }

    pub fn clamp_brightness(&self, value: u16) -> u16 {
        value.clamp(self.config.min_brightness, self.config.max_brightness)
    }

    async fn send(&self, command: &'static str, opcode: u8, data: &[u8]) -> Result<(), ExposureError> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(opcode);
        payload.extend_from_slice(data);
        tracing::debug!("Exposure <- {} {:02X?}", command, payload);
        self.device
            .i2c_write(self.config.i2c_address, &payload)
            .await
            .map_err(|e| ExposureError::from_device(command, e))
    }

    /// Switches the projector power rail. Turning it on waits for the
    /// projector to stabilise before returning.
    pub async fn projector_power(&mut self, on: bool) -> Result<(), ExposureError> {
        self.device
            .set_gpio(self.config.projector_gpio, on)
            .await
            .map_err(|e| ExposureError::from_device("projector_power", e))?;
        self.projector_on = on;
        if on {
            tracing::info!("Projector on");
            sleep(Duration::from_millis(self.config.projector_settle_ms)).await;
        } else {
            tracing::info!("Projector off");
        }
        Ok(())
    }

    /// Sets the LED brightness, clamped into the device range. Returns the
    /// value actually sent.
    pub async fn set_brightness(&mut self, value: u16) -> Result<u16, ExposureError> {
        let clamped = self.clamp_brightness(value);
        if clamped != value {
            tracing::warn!(
                "Brightness {} outside {}~{}, using {}",
                value,
                self.config.min_brightness,
                self.config.max_brightness,
                clamped
            );
        }
        self.send("set_brightness", opcode::LED_BRIGHTNESS, &encode_brightness(clamped))
            .await?;
        self.brightness = clamped;
        Ok(clamped)
    }

    pub async fn led_on(&mut self, brightness: Option<u16>) -> Result<(), ExposureError> {
        if let Some(value) = brightness {
            self.set_brightness(value).await?;
        }
        match self.send("led_on", opcode::LED_CONTROL, &[opcode::LED_ON]).await {
            Ok(()) => {
                self.led = LedState::On;
                tracing::debug!("LED on (brightness={})", self.brightness);
                Ok(())
            }
            Err(e) => {
                self.led = LedState::Unknown;
                Err(e)
            }
        }
    }

    pub async fn led_off(&mut self) -> Result<(), ExposureError> {
        match self.send("led_off", opcode::LED_CONTROL, &[opcode::LED_OFF]).await {
            Ok(()) => {
                self.led = LedState::Off;
                tracing::debug!("LED off");
                Ok(())
            }
            Err(e) => {
                self.led = LedState::Unknown;
                Err(e)
            }
        }
    }

    /// Turns the LED off unless it is already known to be off.
    pub async fn ensure_led_off(&mut self) -> Result<(), ExposureError> {
        if self.led == LedState::Off {
            return Ok(());
        }
        self.led_off().await
    }

    pub async fn set_test_pattern(&mut self, code: u8) -> Result<(), ExposureError> {
        self.send("pattern_select", opcode::PATTERN_SELECT, &[code]).await?;
        self.send("pattern_enable", opcode::PATTERN_ENABLE, &[0x01]).await?;
        tracing::info!("Test pattern 0x{:02X}", code);
        Ok(())
    }

    /// Switches back to the external video input.
    pub async fn clear_test_pattern(&mut self) -> Result<(), ExposureError> {
        self.send("pattern_disable", opcode::PATTERN_ENABLE, &[0x00]).await
    }

    pub async fn set_flip(&mut self, horizontal: bool, vertical: bool) -> Result<(), ExposureError> {
        let mode = flip_mode(horizontal, vertical);
        self.send("flip", opcode::FLIP, &[mode]).await?;
        self.flip = mode;
        tracing::info!("Flip H={} V={} (0x{:02X})", horizontal, vertical, mode);
        Ok(())
    }

    /// LED on for `duration`, then off. The LED is switched off even if
    /// switching it on failed halfway.
    pub async fn expose(&mut self, duration: Duration, brightness: Option<u16>) -> Result<(), ExposureError> {
        if let Err(e) = self.led_on(brightness).await {
            self.ensure_led_off().await.ok();
            return Err(e);
        }
        sleep(duration).await;
        self.led_off().await
    }

    /// Projector on, pattern and flip applied, LED on. Left running until
    /// [`stop_exposure_test`](Self::stop_exposure_test).
    pub async fn start_exposure_test(
        &mut self,
        code: u8,
        horizontal: bool,
        vertical: bool,
        brightness: u16,
    ) -> Result<(), ExposureError> {
        self.projector_power(true).await?;
        self.set_flip(horizontal, vertical).await?;
        self.set_test_pattern(code).await?;
        self.led_on(Some(brightness)).await
    }

    /// Tears the test down in order; every step is attempted and the first
    /// failure is returned.
    pub async fn stop_exposure_test(&mut self) -> Result<(), ExposureError> {
        let led = self.led_off().await;
        let pattern = self.clear_test_pattern().await;
        let power = self.projector_power(false).await;
        led.and(pattern).and(power)
    }

    /// Full-screen exposure used to cure a film left in the vat.
    pub async fn clean_exposure(&mut self, duration: Duration, brightness: u16) -> Result<(), ExposureError> {
        tracing::info!("Vat cleaning exposure for {:.0}s", duration.as_secs_f64());
        self.projector_power(true).await?;
        let result = async {
            self.clear_test_pattern().await?;
            self.expose(duration, Some(brightness)).await
        }
        .await;
        let power = self.projector_power(false).await;
        result.and(power)
    }
}
