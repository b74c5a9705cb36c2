// src/exposure/device.rs - Command channel to the projector's control board
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,
    #[error("Device returned status {code}")]
    Status { code: i32 },
    #[error("Device library error: {0}")]
    Library(String),
}

/// Byte-oriented command channel: single-address I2C writes plus digital
/// output lines. Each call is fire-and-confirm.
#[async_trait]
pub trait ExposureDevice: Send + Sync {
    /// Writes `payload` (opcode followed by its data bytes) to `address`.
    async fn i2c_write(&self, address: u8, payload: &[u8]) -> Result<(), DeviceError>;
    async fn set_gpio(&self, pin: u8, high: bool) -> Result<(), DeviceError>;
}

/// Logs every command and reports success.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice;

#[async_trait]
impl ExposureDevice for SimulatedDevice {
    async fn i2c_write(&self, address: u8, payload: &[u8]) -> Result<(), DeviceError> {
        tracing::info!("[sim] I2C 0x{:02X} <- {:02X?}", address, payload);
        Ok(())
    }

    async fn set_gpio(&self, pin: u8, high: bool) -> Result<(), DeviceError> {
        tracing::info!("[sim] GPIO {} <- {}", pin, if high { 1 } else { 0 });
        Ok(())
    }
}
