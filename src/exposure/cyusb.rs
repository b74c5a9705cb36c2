// src/exposure/cyusb.rs - Cypress USB-serial bridge driving the projector board
//
// Compiled only with the `cyusb` feature; links against libcyusbserial.
use async_trait::async_trait;
use std::ffi::{c_int, c_void};
use std::sync::{Arc, Mutex};

use super::device::{DeviceError, ExposureDevice};
use crate::config::ExposureConfig;

const CY_SUCCESS: c_int = 0;
const I2C_TIMEOUT_MS: u32 = 1000;

type CyHandle = *mut c_void;

#[repr(C)]
struct CyI2cDataConfig {
    slave_address: u8,
    is_stop_bit: bool,
    is_nak_bit: bool,
}

#[repr(C)]
struct CyDataBuffer {
    buffer: *mut u8,
    length: u32,
    transfer_count: u32,
}

#[link(name = "cyusbserial")]
unsafe extern "C" {
    fn CyLibraryInit() -> c_int;
    fn CyLibraryExit() -> c_int;
    fn CyGetListofDevices(num_devices: *mut u8) -> c_int;
    fn CyOpen(device_number: u8, interface_num: u8, handle: *mut CyHandle) -> c_int;
    fn CyClose(handle: CyHandle) -> c_int;
    fn CyI2cWrite(
        handle: CyHandle,
        config: *mut CyI2cDataConfig,
        data: *mut CyDataBuffer,
        timeout: u32,
    ) -> c_int;
    fn CySetGpioValue(handle: CyHandle, gpio_number: u8, value: u8) -> c_int;
}

fn check(code: c_int) -> Result<(), DeviceError> {
    if code == CY_SUCCESS { Ok(()) } else { Err(DeviceError::Status { code }) }
}

/// Library initialisation scope. Exits the library when dropped.
struct Library;

impl Library {
    fn init() -> Result<Self, DeviceError> {
        // SAFETY: no preconditions; paired with CyLibraryExit in Drop.
        check(unsafe { CyLibraryInit() })
            .map_err(|e| DeviceError::Library(format!("CyLibraryInit failed: {}", e)))?;
        Ok(Library)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: only constructed after a successful CyLibraryInit.
        unsafe {
            CyLibraryExit();
        }
    }
}

/// Open device handle. `Drop` closes it before the library scope field drops.
struct OpenDevice {
    handle: CyHandle,
    _library: Library,
}

// SAFETY: the handle is only ever used while holding the owning Mutex.
unsafe impl Send for OpenDevice {}

impl OpenDevice {
    fn open(device_index: u8, interface: u8) -> Result<Self, DeviceError> {
        let library = Library::init()?;

        let mut count: u8 = 0;
        // SAFETY: `count` outlives the call.
        check(unsafe { CyGetListofDevices(&mut count) })?;
        if count == 0 {
            return Err(DeviceError::NotConnected);
        }

        let mut handle: CyHandle = std::ptr::null_mut();
        // SAFETY: `handle` outlives the call and is only read on success.
        check(unsafe { CyOpen(device_index, interface, &mut handle) })?;
        if handle.is_null() {
            return Err(DeviceError::NotConnected);
        }
        Ok(Self { handle, _library: library })
    }

    fn i2c_write(&self, address: u8, payload: &[u8]) -> Result<(), DeviceError> {
        let mut bytes = payload.to_vec();
        let mut config = CyI2cDataConfig { slave_address: address, is_stop_bit: true, is_nak_bit: false };
        let mut buffer = CyDataBuffer {
            buffer: bytes.as_mut_ptr(),
            length: bytes.len() as u32,
            transfer_count: 0,
        };
        // SAFETY: `bytes`, `config` and `buffer` live until the call returns.
        check(unsafe { CyI2cWrite(self.handle, &mut config, &mut buffer, I2C_TIMEOUT_MS) })
    }

    fn set_gpio(&self, pin: u8, high: bool) -> Result<(), DeviceError> {
        // SAFETY: handle is open for the lifetime of `self`.
        check(unsafe { CySetGpioValue(self.handle, pin, u8::from(high)) })
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful CyOpen and is closed once.
        unsafe {
            CyClose(self.handle);
        }
    }
}

/// Projector board reached through libcyusbserial.
#[derive(Clone)]
pub struct CyUsbDevice {
    inner: Arc<Mutex<OpenDevice>>,
}

impl CyUsbDevice {
    pub fn open(config: &ExposureConfig) -> Result<Self, DeviceError> {
        tracing::info!(
            "Opening USB-serial device {} interface {}",
            config.device_index,
            config.interface
        );
        let device = OpenDevice::open(config.device_index, config.interface)?;
        Ok(Self { inner: Arc::new(Mutex::new(device)) })
    }

    async fn with_device<F>(&self, f: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&OpenDevice) -> Result<(), DeviceError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let device = inner
                .lock()
                .map_err(|_| DeviceError::Library("device lock poisoned".to_string()))?;
            f(&device)
        })
        .await
        .map_err(|e| DeviceError::Library(e.to_string()))?
    }
}

#[async_trait]
impl ExposureDevice for CyUsbDevice {
    async fn i2c_write(&self, address: u8, payload: &[u8]) -> Result<(), DeviceError> {
        let payload = payload.to_vec();
        self.with_device(move |device| device.i2c_write(address, &payload)).await
    }

    async fn set_gpio(&self, pin: u8, high: bool) -> Result<(), DeviceError> {
        self.with_device(move |device| device.set_gpio(pin, high)).await
    }
}
