//! Scripted USB backend for driving the transport without hardware.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use myriad_link::backend::{
    BulkEndpoint, DeviceInfo, TransportError, UsbBackend, UsbDevice, UsbHandle,
};
use myriad_link::{HostConfig, MxidProgram, UsbHost};

pub const MYRIAD_VID: u16 = 0x03E7;
pub const UNBOOTED_PID: u16 = 0x2485;
pub const BOOTED_PID: u16 = 0xF63B;
pub const BOOTLOADER_PID: u16 = 0xF63C;

pub struct MockBus {
    devices: Vec<MockDevice>,
}

impl MockBus {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        MockBus { devices }
    }
}

impl UsbBackend for MockBus {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<MockDevice>, TransportError> {
        Ok(self.devices.clone())
    }
}

pub struct Behavior {
    info: DeviceInfo,
    bus_number: u8,
    ports: Result<Vec<u8>, TransportError>,
    open_error: Option<TransportError>,
    serial: Option<String>,
    rom_response: Option<Vec<u8>>,
    bulk_out: Result<BulkEndpoint, TransportError>,
    read_limit: usize,
    write_error: Mutex<Option<(usize, TransportError)>>,
    opens: AtomicUsize,
    releases: AtomicUsize,
    writes: Mutex<Vec<usize>>,
}

#[derive(Clone)]
pub struct MockDevice(Arc<Behavior>);

impl MockDevice {
    fn with_pid(pid: u16, bus_number: u8, ports: &[u8]) -> Self {
        MockDevice(Arc::new(Behavior {
            info: DeviceInfo {
                vendor_id: MYRIAD_VID,
                product_id: pid,
                serial_number_index: Some(3),
                usb_version_major: 2,
            },
            bus_number,
            ports: Ok(ports.to_vec()),
            open_error: None,
            serial: None,
            rom_response: None,
            bulk_out: Ok(BulkEndpoint { address: 0x01, max_packet_size: 512 }),
            read_limit: usize::MAX,
            write_error: Mutex::new(None),
            opens: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }))
    }

    /// An unbooted device whose ROM exchange answers with `response`.
    pub fn unbooted(bus_number: u8, ports: &[u8], response: &[u8]) -> Self {
        let mut device = Self::with_pid(UNBOOTED_PID, bus_number, ports);
        Arc::get_mut(&mut device.0).unwrap().rom_response = Some(response.to_vec());
        device
    }

    /// A booted device reporting `serial` through its string descriptor.
    pub fn booted(bus_number: u8, ports: &[u8], serial: &str) -> Self {
        let mut device = Self::with_pid(BOOTED_PID, bus_number, ports);
        Arc::get_mut(&mut device.0).unwrap().serial = Some(serial.to_owned());
        device
    }

    /// A bootloader device reporting `serial` through its string descriptor.
    pub fn bootloader(bus_number: u8, ports: &[u8], serial: &str) -> Self {
        let mut device = Self::with_pid(BOOTLOADER_PID, bus_number, ports);
        Arc::get_mut(&mut device.0).unwrap().serial = Some(serial.to_owned());
        device
    }

    /// A device of some other vendor that must be skipped.
    pub fn foreign(bus_number: u8, ports: &[u8]) -> Self {
        let mut device = Self::with_pid(UNBOOTED_PID, bus_number, ports);
        Arc::get_mut(&mut device.0).unwrap().info.vendor_id = 0x1D6B;
        device
    }

    pub fn failing_open(mut self, err: TransportError) -> Self {
        Arc::get_mut(&mut self.0).unwrap().open_error = Some(err);
        self
    }

    pub fn failing_ports(mut self, err: TransportError) -> Self {
        Arc::get_mut(&mut self.0).unwrap().ports = Err(err);
        self
    }

    pub fn usb_version_major(mut self, major: u8) -> Self {
        Arc::get_mut(&mut self.0).unwrap().info.usb_version_major = major;
        self
    }

    /// Cap how many bytes a single bulk read hands back.
    pub fn short_reads(mut self, limit: usize) -> Self {
        Arc::get_mut(&mut self.0).unwrap().read_limit = limit;
        self
    }

    /// Script the bytes every IN transfer repeats.
    pub fn feeding(mut self, data: &[u8]) -> Self {
        Arc::get_mut(&mut self.0).unwrap().rom_response = Some(data.to_vec());
        self
    }

    /// Fail the bulk write after `after` successful ones.
    pub fn failing_write(self, after: usize, err: TransportError) -> Self {
        *self.0.write_error.lock().unwrap() = Some((after, err));
        self
    }

    pub fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.0.releases.load(Ordering::SeqCst)
    }

    /// Sizes of every bulk write seen so far, in order.
    pub fn writes(&self) -> Vec<usize> {
        self.0.writes.lock().unwrap().clone()
    }
}

impl UsbDevice for MockDevice {
    type Handle = MockHandle;

    fn descriptor(&self) -> Result<DeviceInfo, TransportError> {
        Ok(self.0.info)
    }

    fn bus_number(&self) -> u8 {
        self.0.bus_number
    }

    fn port_numbers(&self) -> Result<Vec<u8>, TransportError> {
        self.0.ports.clone()
    }

    fn open(&self) -> Result<MockHandle, TransportError> {
        if let Some(err) = &self.0.open_error {
            return Err(err.clone());
        }
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle { behavior: self.0.clone() })
    }

    fn first_bulk_out(&self) -> Result<BulkEndpoint, TransportError> {
        self.0.bulk_out.clone()
    }
}

pub struct MockHandle {
    behavior: Arc<Behavior>,
}

impl UsbHandle for MockHandle {
    fn active_configuration(&self) -> Result<u8, TransportError> {
        Ok(1)
    }

    fn set_configuration(&mut self, _configuration: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn claim_interface(&mut self, _interface: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> Result<(), TransportError> {
        self.behavior.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_kernel_driver(&mut self, _interface: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn bulk_write(
        &self,
        _endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut writes = self.behavior.writes.lock().unwrap();
        let mut planned = self.behavior.write_error.lock().unwrap();
        if let Some((after, err)) = planned.as_ref() {
            if writes.len() >= *after {
                let err = err.clone();
                *planned = None;
                return Err(err);
            }
        }
        writes.push(data.len());
        Ok(data.len())
    }

    fn bulk_read(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        match &self.behavior.rom_response {
            Some(response) => {
                let n = response.len().min(buf.len()).min(self.behavior.read_limit);
                buf[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn control_out(
        &self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn read_serial_string(&self, _index: u8) -> Result<String, TransportError> {
        self.behavior.serial.clone().ok_or(TransportError::NotFound)
    }
}

pub fn program() -> MxidProgram {
    MxidProgram::new(vec![0xAA; 24], vec![0xBB; 8])
}

pub fn host(devices: Vec<MockDevice>) -> UsbHost<MockBus> {
    UsbHost::with_backend(MockBus::new(devices), program(), HostConfig::default())
}

pub fn host_with_config(devices: Vec<MockDevice>, config: HostConfig) -> UsbHost<MockBus> {
    UsbHost::with_backend(MockBus::new(devices), program(), config)
}
