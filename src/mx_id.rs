//! Serial-number ("MxId") retrieval and the per-sweep cache in front of it.
//!
//! Booted devices report their serial through an ordinary string descriptor.
//! Unbooted devices are still in ROM and have to be asked: the host bulk-writes
//! a small vendor program, reads back a 9-byte response, and writes a second
//! payload that ends the exchange and re-arms the ROM watchdog. Both payloads
//! are opaque blobs supplied by the caller as a [`MxidProgram`].

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::backend::{
    DeviceInfo, TransportError, UsbDevice, UsbHandle, ACTIVE_CONFIGURATION, DATA_INTERFACE,
    ENDPOINT_IN, ENDPOINT_OUT,
};
use crate::device_ids::DeviceState;

/// Per-transfer timeout during the ROM exchange.
const MXID_TRANSFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Wall-clock budget for the whole retry loop.
const MXID_RETRY_BUDGET: Duration = Duration::from_millis(5);

/// Pause between attempts, long enough for another host process to let go of
/// the interface.
const MXID_RETRY_SLEEP: Duration = Duration::from_micros(100);

/// The ROM response is exactly this many bytes.
const MXID_RESPONSE_SIZE: usize = 9;

/// Bound on a stored serial, including the booted-state descriptor path.
pub const MAX_MXID_SIZE: usize = 32;

pub(crate) const MXID_CACHE_CAPACITY: usize = 16;

/// The ROM program a serial retrieval sends to an unbooted device, plus the
/// payload that ends the exchange. Contents are opaque to this crate.
#[derive(Debug, Clone)]
pub struct MxidProgram {
    request: Vec<u8>,
    request_end: Vec<u8>,
}

impl MxidProgram {
    pub fn new(request: Vec<u8>, request_end: Vec<u8>) -> Self {
        MxidProgram { request, request_end }
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn request_end(&self) -> &[u8] {
        &self.request_end
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    path: String,
    mxid: String,
    valid: bool,
}

/// Bounded path→serial store, valid for one enumeration sweep.
#[derive(Debug)]
pub(crate) struct MxidCache {
    slots: [CacheSlot; MXID_CACHE_CAPACITY],
}

impl MxidCache {
    pub(crate) fn new() -> Self {
        MxidCache {
            slots: std::array::from_fn(|_| CacheSlot::default()),
        }
    }

    /// Sweep start: every entry becomes stale at once.
    pub(crate) fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.valid = false;
        }
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<&str> {
        self.slots
            .iter()
            .find(|slot| slot.valid && slot.path == path)
            .map(|slot| slot.mxid.as_str())
    }

    /// Store into the first stale slot. `None` means the cache is full, which
    /// is not an error; the caller simply proceeds uncached.
    pub(crate) fn store(&mut self, path: &str, mxid: &str) -> Option<usize> {
        let index = self.slots.iter().position(|slot| !slot.valid)?;
        let slot = &mut self.slots[index];
        slot.path.clear();
        slot.path.push_str(path);
        slot.mxid.clear();
        slot.mxid.push_str(mxid);
        slot.valid = true;
        Some(index)
    }
}

/// Obtain the serial for a device in the given state, consulting the cache
/// first and filling it on success.
///
/// Open failures are terminal and propagate unchanged. Everything the exchange
/// itself can throw (busy interface, short transfer, configuration churn,
/// descriptor hiccups) is retried until the budget runs out, at which point
/// the last-seen error is returned.
pub(crate) fn acquire_mxid<D: UsbDevice>(
    state: DeviceState,
    path: &str,
    info: &DeviceInfo,
    device: &D,
    program: &MxidProgram,
    cache: &mut MxidCache,
) -> Result<String, TransportError> {
    if let Some(hit) = cache.lookup(path) {
        debug!("found cached MX ID {hit} for {path}");
        return Ok(hit.to_owned());
    }

    let mut handle = device.open()?;

    let started = Instant::now();
    let mxid = loop {
        let attempt = match state {
            DeviceState::Unbooted => rom_exchange(&mut handle, program).map(format_mxid),
            DeviceState::Booted | DeviceState::Bootloader => descriptor_serial(&handle, info),
        };
        match attempt {
            Ok(mxid) => break mxid,
            Err(err) => {
                if started.elapsed() >= MXID_RETRY_BUDGET {
                    return Err(err);
                }
                std::thread::sleep(MXID_RETRY_SLEEP);
            }
        }
    };
    drop(handle);

    match cache.store(path, &mxid) {
        Some(index) => debug!("cached MX ID {mxid} at index {index}"),
        None => debug!("MX ID cache full, not caching {mxid}"),
    }

    Ok(mxid)
}

/// One attempt at the unbooted-state exchange. Any failure returns to the
/// retry loop; a claimed interface is left claimed, which the next attempt's
/// claim call tolerates.
fn rom_exchange<H: UsbHandle>(
    handle: &mut H,
    program: &MxidProgram,
) -> Result<[u8; MXID_RESPONSE_SIZE], TransportError> {
    let active = handle.active_configuration()?;
    if active != ACTIVE_CONFIGURATION {
        debug!("setting configuration from {active} to {ACTIVE_CONFIGURATION}");
        handle.set_configuration(ACTIVE_CONFIGURATION)?;
    }

    if let Err(err) = handle.claim_interface(DATA_INTERFACE) {
        // Busy just means another process has it right now.
        if err != TransportError::Busy {
            warn!("claiming interface failed: {err}");
        }
        return Err(err);
    }

    send_payload(handle, program.request())?;

    let mut response = [0u8; 128];
    let transferred = handle.bulk_read(ENDPOINT_IN, &mut response, MXID_TRANSFER_TIMEOUT)?;
    if transferred != MXID_RESPONSE_SIZE {
        warn!("MX ID response was {transferred} bytes, expected {MXID_RESPONSE_SIZE}");
        return Err(TransportError::ShortTransfer {
            expected: MXID_RESPONSE_SIZE,
            transferred,
        });
    }

    send_payload(handle, program.request_end())?;

    // The exchange is complete; a failed release changes nothing.
    let _ = handle.release_interface(DATA_INTERFACE);

    let mut serial = [0u8; MXID_RESPONSE_SIZE];
    serial.copy_from_slice(&response[..MXID_RESPONSE_SIZE]);
    Ok(serial)
}

fn send_payload<H: UsbHandle>(handle: &H, payload: &[u8]) -> Result<(), TransportError> {
    let transferred = handle.bulk_write(ENDPOINT_OUT, payload, MXID_TRANSFER_TIMEOUT)?;
    if transferred != payload.len() {
        warn!("short bulk write: {transferred} of {} bytes", payload.len());
        return Err(TransportError::ShortTransfer {
            expected: payload.len(),
            transferred,
        });
    }
    Ok(())
}

/// One attempt at reading the serial of a booted or bootloader device.
fn descriptor_serial<H: UsbHandle>(
    handle: &H,
    info: &DeviceInfo,
) -> Result<String, TransportError> {
    let index = info.serial_number_index.ok_or(TransportError::NotFound)?;
    let mut serial = handle.read_serial_string(index).map_err(|err| {
        warn!("failed to read serial string descriptor: {err}");
        err
    })?;
    serial.truncate(MAX_MXID_SIZE - 1);
    Ok(serial)
}

/// Render the 9 response bytes as 18 uppercase hex digits.
fn format_mxid(mut raw: [u8; MXID_RESPONSE_SIZE]) -> String {
    // The MDK tools keep the high nibble of the last byte (0x0F would look
    // right); devices in the field are identified by that rendering, so the
    // mask must not change.
    raw[8] &= 0xF0;

    let mut mxid = String::with_capacity(2 * MXID_RESPONSE_SIZE);
    for byte in raw {
        write!(mxid, "{byte:02X}").unwrap();
    }
    mxid
}
