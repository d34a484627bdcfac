//! Bus sweep: find Myriad devices, identify them, and report a filtered view.

use log::debug;

use crate::backend::{TransportError, UsbBackend, UsbDevice};
use crate::device_ids::{state_for, DeviceState, Platform, Protocol, UsbId};
use crate::device_path::device_path;
use crate::mx_id::{acquire_mxid, MxidCache, MxidProgram};

/// Optional equality predicates a candidate must pass to be reported. An
/// unset field matches anything.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub state: Option<DeviceState>,
    pub path: Option<String>,
    pub mxid: Option<String>,
}

impl DeviceFilter {
    /// A filter that accepts every device.
    pub fn any() -> Self {
        DeviceFilter::default()
    }

    fn state_matches(&self, state: DeviceState) -> bool {
        self.state.map_or(true, |wanted| wanted == state)
    }

    fn path_matches(&self, path: &str) -> bool {
        self.path.as_deref().map_or(true, |wanted| wanted == path)
    }

    fn mxid_matches(&self, mxid: &str) -> bool {
        self.mxid.as_deref().map_or(true, |wanted| wanted == mxid)
    }
}

/// Per-device outcome of the identification step. Independent of the
/// sweep-wide result: a device the host may not open is still reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Success,
    InsufficientPermissions,
    Error,
}

/// One enumerated device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub status: DeviceStatus,
    pub platform: Platform,
    pub protocol: Protocol,
    pub state: DeviceState,
    /// Canonical topology path, never empty. Bounded by
    /// [`MAX_PATH_SIZE`](crate::device_path::MAX_PATH_SIZE).
    pub path: String,
    /// Serial number; empty when it could not be obtained. Bounded by
    /// [`MAX_MXID_SIZE`](crate::mx_id::MAX_MXID_SIZE).
    pub mxid: String,
}

/// Walk the bus once and report every matching device, up to `max_devices`
/// records. Caller holds the scan lock.
///
/// Only a failed device-list fetch fails the sweep; per-device trouble is
/// folded into that record's [`DeviceStatus`].
pub(crate) fn enumerate_devices<B: UsbBackend>(
    backend: &B,
    program: &MxidProgram,
    cache: &mut MxidCache,
    filter: &DeviceFilter,
    max_devices: usize,
) -> Result<Vec<DeviceRecord>, TransportError> {
    cache.invalidate_all();

    let devices = backend.devices().map_err(|err| {
        debug!("unable to list USB devices: {err}");
        err
    })?;

    let mut found = Vec::new();
    for device in &devices {
        if found.len() >= max_devices {
            break;
        }

        let info = match device.descriptor() {
            Ok(info) => info,
            Err(err) => {
                debug!("unable to read a device descriptor: {err}");
                continue;
            }
        };

        let id = UsbId { vid: info.vendor_id, pid: info.product_id };
        let Some(state) = state_for(id) else {
            continue;
        };

        if !filter.state_matches(state) {
            continue;
        }

        let path = device_path(device);
        if !filter.path_matches(&path) {
            continue;
        }

        let (status, mxid) = match acquire_mxid(state, &path, &info, device, program, cache) {
            Ok(mxid) => (DeviceStatus::Success, mxid),
            Err(TransportError::Access) => (DeviceStatus::InsufficientPermissions, String::new()),
            Err(err) => {
                debug!("MX ID retrieval for {path} failed: {err}");
                (DeviceStatus::Error, String::new())
            }
        };

        if !filter.mxid_matches(&mxid) {
            continue;
        }

        found.push(DeviceRecord {
            status,
            platform: Platform::MyriadX,
            protocol: Protocol::UsbVsc,
            state,
            path,
            mxid,
        });
    }

    Ok(found)
}

/// Find the device currently attached at `path` and hand the caller an owned
/// reference to it. Caller holds the scan lock for the duration of the walk.
pub(crate) fn lookup_device<B: UsbBackend>(
    backend: &B,
    path: &str,
) -> Result<B::Device, TransportError> {
    if path.is_empty() {
        return Err(TransportError::NotFound);
    }

    for device in backend.devices()? {
        if device_path(&device) == path {
            return Ok(device);
        }
    }

    Err(TransportError::NotFound)
}
