//! Firmware delivery into an unbooted device, and the bootloader reboot
//! request.
//!
//! Booting is two polling phases followed by a chunked bulk write. The device
//! being booted is mid-reenumeration more often than not, so both the lookup
//! and the open are retried on a fixed cadence until the connect window
//! closes.

use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::backend::{
    BulkEndpoint, DeviceInfo, HandleOf, TransportError, UsbBackend, UsbDevice, UsbHandle,
    ACTIVE_CONFIGURATION, DATA_INTERFACE,
};
use crate::UsbHost;

/// Cadence of the phase-A "has it reappeared" lookup poll.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cadence of the phase-B open poll.
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Chunk size forced for USB 1.x links.
const USB1_CHUNK_SIZE: usize = 64;

/// A payload whose length is a multiple of this needs a zero-length trailer
/// so the device can tell the transfer ended.
const ZLP_BOUNDARY: usize = 512;

const BOOTLOADER_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

struct SetupPacket {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
}

/// Vendor request that reboots a device into its flashed bootloader.
const BOOT_BOOTLOADER_REQUEST: SetupPacket = SetupPacket {
    request_type: 0x00,
    request: 0xF5,
    value: 0x0DA1,
    index: 0x0000,
};

/// Failure modes of a firmware boot.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BootError {
    #[error("no device appeared at the requested path within the connect window")]
    DeviceNotFound,

    #[error("device could not be opened and claimed for booting")]
    InsufficientPermissions,

    #[error("firmware transfer timed out")]
    Timeout,

    #[error("firmware transfer failed")]
    Transfer(#[from] TransportError),
}

/// Send `image` into the unbooted device at `path`.
pub(crate) fn boot_firmware<B: UsbBackend>(
    host: &UsbHost<B>,
    path: &str,
    image: &[u8],
) -> Result<(), BootError> {
    // Phase A: wait for the device to show up at the expected path.
    let started = Instant::now();
    let device = loop {
        if let Ok(device) = host.lookup(path) {
            break device;
        }
        if started.elapsed() >= host.config.connect_timeout {
            return Err(BootError::DeviceNotFound);
        }
        std::thread::sleep(LOOKUP_POLL_INTERVAL);
    };

    let info = device.descriptor()?;

    // Phase B: the device exists but may still be settling; keep trying to
    // open and claim it.
    let started = Instant::now();
    let (mut handle, endpoint) = loop {
        match open_for_boot(&device) {
            Ok(opened) => break opened,
            Err(err) => {
                debug!("open for boot failed: {err}");
                if started.elapsed() >= host.config.connect_timeout {
                    return Err(BootError::InsufficientPermissions);
                }
                std::thread::sleep(OPEN_POLL_INTERVAL);
            }
        }
    };

    let result = send_image(&handle, endpoint, image, &info, host);
    let _ = handle.release_interface(DATA_INTERFACE);
    result
}

/// Open, configure, claim, and locate the bulk OUT endpoint. One failed step
/// undoes the claim and reports the error to the poll loop.
fn open_for_boot<D: UsbDevice>(device: &D) -> Result<(D::Handle, BulkEndpoint), TransportError> {
    let mut handle = device.open()?;

    let active = handle.active_configuration()?;
    if active != ACTIVE_CONFIGURATION {
        debug!("setting configuration from {active} to {ACTIVE_CONFIGURATION}");
        handle.set_configuration(ACTIVE_CONFIGURATION)?;
    }

    handle.claim_interface(DATA_INTERFACE)?;

    match device.first_bulk_out() {
        Ok(endpoint) => Ok((handle, endpoint)),
        Err(err) => {
            let _ = handle.release_interface(DATA_INTERFACE);
            Err(err)
        }
    }
}

fn send_image<B: UsbBackend>(
    handle: &HandleOf<B>,
    endpoint: BulkEndpoint,
    image: &[u8],
    info: &DeviceInfo,
    host: &UsbHost<B>,
) -> Result<(), BootError> {
    let mut chunk_size = if endpoint.max_packet_size > 0 {
        endpoint.max_packet_size as usize
    } else {
        host.config.bulk_chunk_size
    };
    if info.usb_version_major < 2 {
        chunk_size = USB1_CHUNK_SIZE;
    }

    let send_zlp = image.len() % ZLP_BOUNDARY == 0;
    let started = Instant::now();
    debug!("performing bulk write of {} bytes", image.len());

    let mut sent = 0;
    while sent < image.len() {
        let chunk = &image[sent..image.len().min(sent + chunk_size)];
        match handle.bulk_write(endpoint.address, chunk, host.config.write_timeout) {
            Ok(written) if written == chunk.len() => sent += written,
            Ok(written) => {
                warn!("bulk write came up short: {written} of {} bytes", chunk.len());
                return Err(TransportError::ShortTransfer {
                    expected: chunk.len(),
                    transferred: written,
                }
                .into());
            }
            // The device drops off the bus as soon as it has enough of the
            // image to reboot into it; nothing left for the host to send.
            Err(TransportError::NoDevice) => return Ok(()),
            Err(TransportError::Timeout) => return Err(BootError::Timeout),
            Err(err) => {
                warn!("bulk write failed: {err}");
                return Err(err.into());
            }
        }
        if started.elapsed() > host.config.send_timeout {
            return Err(BootError::Timeout);
        }
    }

    if send_zlp {
        // End-of-transfer marker; its outcome carries no signal.
        let _ = handle.bulk_write(endpoint.address, &[], host.config.write_timeout);
    }

    debug!("sent {} bytes in {:?}", image.len(), started.elapsed());
    Ok(())
}

/// Ask the device at `path` to reboot into its flashed bootloader. The device
/// resets without acknowledging, so the control transfer's outcome is
/// deliberately ignored.
pub(crate) fn boot_bootloader<B: UsbBackend>(
    host: &UsbHost<B>,
    path: &str,
) -> Result<(), TransportError> {
    let device = host.lookup(path)?;
    let handle = device.open()?;

    let _ = handle.control_out(
        BOOT_BOOTLOADER_REQUEST.request_type,
        BOOT_BOOTLOADER_REQUEST.request,
        BOOT_BOOTLOADER_REQUEST.value,
        BOOT_BOOTLOADER_REQUEST.index,
        &[],
        BOOTLOADER_REQUEST_TIMEOUT,
    );

    Ok(())
}
