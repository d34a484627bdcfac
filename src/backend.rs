//! Thin capability layer over the host USB stack.
//!
//! The transport logic is written against the three traits in this module;
//! [`RusbBackend`] binds them to libusb via [`rusb`]. Tests substitute a
//! scripted backend instead of real hardware.

use std::time::Duration;

use log::trace;
use rusb::UsbContext;
use thiserror::Error;

/// Bulk IN endpoint carrying data from the device.
pub const ENDPOINT_IN: u8 = 0x81;
/// Bulk OUT endpoint carrying data to the device.
pub const ENDPOINT_OUT: u8 = 0x01;

/// The single interface all transfers go through.
pub const DATA_INTERFACE: u8 = 0;
/// The configuration the device must be in before claiming the interface.
pub const ACTIVE_CONFIGURATION: u8 = 1;

/// Transport failures, reduced to the categories the retry and polling loops
/// branch on. Everything else lands in [`TransportError::Other`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("access denied (insufficient permissions)")]
    Access,

    #[error("device is gone")]
    NoDevice,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("overflow")]
    Overflow,

    #[error("insufficient memory")]
    NoMem,

    #[error("short transfer: {transferred} of {expected} bytes")]
    ShortTransfer { expected: usize, transferred: usize },

    #[error("USB transport error: {0}")]
    Other(String),
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Access => TransportError::Access,
            rusb::Error::NoDevice => TransportError::NoDevice,
            rusb::Error::NotFound => TransportError::NotFound,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Overflow => TransportError::Overflow,
            rusb::Error::NoMem => TransportError::NoMem,
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// The descriptor fields the transport cares about.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Index of the serial-number string descriptor, when the device has one.
    pub serial_number_index: Option<u8>,
    /// Major part of bcdUSB; `1` selects the small USB 1.x boot chunk size.
    pub usb_version_major: u8,
}

/// A bulk endpoint located by scanning a configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoint {
    pub address: u8,
    pub max_packet_size: u16,
}

/// Source of USB device references.
pub trait UsbBackend {
    type Device: UsbDevice;

    /// Fetch the current device list. Each returned device owns its own
    /// reference; dropping it releases that reference.
    fn devices(&self) -> Result<Vec<Self::Device>, TransportError>;
}

/// A not-yet-opened device reference.
pub trait UsbDevice {
    type Handle: UsbHandle;

    fn descriptor(&self) -> Result<DeviceInfo, TransportError>;

    fn bus_number(&self) -> u8;

    /// Port chain from the root hub down to the device.
    fn port_numbers(&self) -> Result<Vec<u8>, TransportError>;

    fn open(&self) -> Result<Self::Handle, TransportError>;

    /// First bulk OUT endpoint in the device's first configuration.
    fn first_bulk_out(&self) -> Result<BulkEndpoint, TransportError>;
}

/// An opened device. Dropping the handle closes it.
pub trait UsbHandle {
    fn active_configuration(&self) -> Result<u8, TransportError>;

    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Bulk write with a per-transfer timeout; `Duration::ZERO` blocks until
    /// the transfer completes or fails. Returns the byte count transferred.
    fn bulk_write(&self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, TransportError>;

    /// Bulk read; same timeout semantics as [`UsbHandle::bulk_write`].
    fn bulk_read(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> Result<usize, TransportError>;

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// ASCII string descriptor read, used for serial numbers.
    fn read_serial_string(&self, index: u8) -> Result<String, TransportError>;
}

/// Handle type produced by a backend's devices.
pub type HandleOf<B> = <<B as UsbBackend>::Device as UsbDevice>::Handle;

/// The libusb-backed implementation used outside of tests.
pub struct RusbBackend {
    context: rusb::Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, TransportError> {
        Ok(RusbBackend {
            context: rusb::Context::new()?,
        })
    }
}

impl UsbBackend for RusbBackend {
    type Device = rusb::Device<rusb::Context>;

    fn devices(&self) -> Result<Vec<Self::Device>, TransportError> {
        Ok(self.context.devices()?.iter().collect())
    }
}

impl UsbDevice for rusb::Device<rusb::Context> {
    type Handle = rusb::DeviceHandle<rusb::Context>;

    fn descriptor(&self) -> Result<DeviceInfo, TransportError> {
        let descriptor = self.device_descriptor()?;
        Ok(DeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number_index: descriptor.serial_number_string_index(),
            usb_version_major: descriptor.usb_version().major(),
        })
    }

    fn bus_number(&self) -> u8 {
        rusb::Device::bus_number(self)
    }

    fn port_numbers(&self) -> Result<Vec<u8>, TransportError> {
        Ok(rusb::Device::port_numbers(self)?)
    }

    fn open(&self) -> Result<Self::Handle, TransportError> {
        Ok(rusb::Device::open(self)?)
    }

    fn first_bulk_out(&self) -> Result<BulkEndpoint, TransportError> {
        let config = self.config_descriptor(0)?;
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    trace!(
                        "found endpoint {:#04x}, max packet size {}",
                        endpoint.address(),
                        endpoint.max_packet_size()
                    );
                    if endpoint.transfer_type() == rusb::TransferType::Bulk
                        && endpoint.direction() == rusb::Direction::Out
                    {
                        return Ok(BulkEndpoint {
                            address: endpoint.address(),
                            max_packet_size: endpoint.max_packet_size(),
                        });
                    }
                }
            }
        }
        Err(TransportError::NotFound)
    }
}

impl UsbHandle for rusb::DeviceHandle<rusb::Context> {
    fn active_configuration(&self) -> Result<u8, TransportError> {
        Ok(rusb::DeviceHandle::active_configuration(self)?)
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError> {
        Ok(rusb::DeviceHandle::set_active_configuration(self, configuration)?)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        Ok(rusb::DeviceHandle::claim_interface(self, interface)?)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        Ok(rusb::DeviceHandle::release_interface(self, interface)?)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError> {
        Ok(rusb::DeviceHandle::detach_kernel_driver(self, interface)?)
    }

    fn bulk_write(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(rusb::DeviceHandle::write_bulk(self, endpoint, data, timeout)?)
    }

    fn bulk_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(rusb::DeviceHandle::read_bulk(self, endpoint, buf, timeout)?)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(rusb::DeviceHandle::write_control(
            self,
            request_type,
            request,
            value,
            index,
            data,
            timeout,
        )?)
    }

    fn read_serial_string(&self, index: u8) -> Result<String, TransportError> {
        Ok(rusb::DeviceHandle::read_string_descriptor_ascii(self, index)?)
    }
}
