//! USB access to the sensor.
//!
//! Wraps a libusb device handle with RAII semantics: the streaming
//! interface is claimed on open and released on drop. Control transfers go
//! through the safe `rusb` API; the isochronous transfer ring needs the raw
//! handle and lives in [`crate::isochronous`].

use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};

/// Vendor ID of the sensor's camera interface.
pub const VENDOR_ID: u16 = 0x045e;
/// Product ID of the sensor's camera interface.
pub const PRODUCT_ID: u16 = 0x02ae;

/// Interface carrying both isochronous endpoints.
const STREAMING_INTERFACE: u8 = 0;

/// Timeout for vendor control transfers.
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// An opened sensor device with its streaming interface claimed.
pub struct UsbDevice {
    handle: DeviceHandle<Context>,
    context: Context,
    serial: String,
}

impl UsbDevice {
    /// Open the camera with the given serial number, or the first camera on
    /// the bus when `serial` is `None`.
    pub fn open(context: &Context, serial: Option<&str>) -> Result<Self> {
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                continue;
            }

            // Tentatively open to read the serial string; skip devices we
            // cannot open (permissions, already claimed elsewhere).
            let handle = match device.open() {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "skipping camera that failed to open");
                    continue;
                }
            };
            let device_serial = handle
                .read_serial_number_string_ascii(&descriptor)
                .unwrap_or_default();
            if let Some(wanted) = serial {
                if device_serial != wanted {
                    continue;
                }
            }

            handle.claim_interface(STREAMING_INTERFACE)?;
            info!(serial = %device_serial, "opened camera");
            return Ok(Self {
                handle,
                context: context.clone(),
                serial: device_serial,
            });
        }

        Err(CameraError::NotFound {
            serial: serial.unwrap_or("<any>").to_string(),
        })
    }

    /// Serial numbers of all cameras currently on the bus.
    pub fn enumerate(context: &Context) -> Result<Vec<String>> {
        let mut serials = Vec::new();
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                continue;
            }
            if let Ok(handle) = device.open() {
                if let Ok(serial) = handle.read_serial_number_string_ascii(&descriptor) {
                    serials.push(serial);
                }
            }
        }
        Ok(serials)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    /// Raw libusb handle for the isochronous transfer ring.
    ///
    /// The pointer is valid for the lifetime of this `UsbDevice`; the ring
    /// must be torn down before the device is dropped.
    pub(crate) fn raw_handle(&self) -> *mut rusb::ffi::libusb_device_handle {
        self.handle.as_raw()
    }

    /// Send a vendor control message to the device.
    pub(crate) fn control_out(&self, data: &[u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.handle
            .write_control(request_type, 0, 0, 0, data, CONTROL_TIMEOUT)
            .map_err(CameraError::from_usb)
    }

    /// Read a vendor control reply. Returns the number of bytes the device
    /// produced; zero means the reply is not ready yet.
    pub(crate) fn control_in(&self, buffer: &mut [u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        match self
            .handle
            .read_control(request_type, 0, 0, 0, buffer, CONTROL_TIMEOUT)
        {
            Ok(n) => Ok(n),
            // A not-ready reply shows up as a zero-length or timed-out read.
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(CameraError::from_usb(e)),
        }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        debug!(serial = %self.serial, "releasing camera interface");
        if let Err(e) = self.handle.release_interface(STREAMING_INTERFACE) {
            warn!(serial = %self.serial, error = %e, "failed to release interface");
        }
    }
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("serial", &self.serial)
            .finish()
    }
}
