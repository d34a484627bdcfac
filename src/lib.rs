//! USB host transport for Myriad-class vision processors.
//!
//! A Myriad device shows up on the bus in one of three lifecycle states,
//! told apart by USB ID: unbooted ROM, booted firmware, or bootloader. This
//! crate enumerates those devices, coaxes a persistent serial ("MxId") out of
//! each one, boots firmware images into unbooted parts, and then moves bulk
//! data over the device's single IN/OUT endpoint pair.
//!
//! Everything hangs off a [`UsbHost`]:
//!
//! ```no_run
//! use myriad_link::{DeviceFilter, MxidProgram, UsbHost};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The ROM payloads ship with the device SDK.
//!     let program = MxidProgram::new(rom_request(), rom_request_end());
//!     let host = UsbHost::new(program)?;
//!
//!     for device in host.enumerate(&DeviceFilter::any(), 8)? {
//!         println!("{} [{}] {}", device.path, device.state, device.mxid);
//!     }
//!     Ok(())
//! }
//! # fn rom_request() -> Vec<u8> { vec![] }
//! # fn rom_request_end() -> Vec<u8> { vec![] }
//! ```
//!
//! Enumeration and path lookup serialize on a host-wide lock; booting and
//! data transfers run lock-free on handles the caller owns.

use std::sync::Mutex;
use std::time::Duration;

pub mod backend;
pub mod boot;
pub mod device_ids;
pub mod device_path;
pub mod enumerate;
pub mod mx_id;
pub mod pipe;

pub use backend::{BulkEndpoint, DeviceInfo, RusbBackend, TransportError};
pub use boot::BootError;
pub use device_ids::{DeviceState, Platform, Protocol, UsbId};
pub use device_path::{MAX_PATH_SIZE, PATH_ERROR};
pub use enumerate::{DeviceFilter, DeviceRecord, DeviceStatus};
pub use mx_id::{MxidProgram, MAX_MXID_SIZE};
pub use pipe::DataPipe;

use backend::{HandleOf, UsbBackend};
use mx_id::MxidCache;

/// Knobs recognised by the transport. The defaults reproduce stock behavior;
/// tests shrink the windows so failure paths finish quickly.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Boot-transfer chunk size used when the endpoint's max packet size is
    /// unknown.
    pub bulk_chunk_size: usize,
    /// Per-chunk timeout during a boot transfer.
    pub write_timeout: Duration,
    /// Window for a device to appear (and become openable) at its path.
    pub connect_timeout: Duration,
    /// Wall-clock bound on sending one whole firmware image.
    pub send_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            bulk_chunk_size: pipe::DEFAULT_CHUNK_SIZE,
            write_timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// The transport's entry point: owns the backend context, the MxId program
/// payloads, the per-sweep serial cache, and the lock that serialises bus
/// scans.
pub struct UsbHost<B: UsbBackend = RusbBackend> {
    backend: B,
    program: MxidProgram,
    pub(crate) config: HostConfig,
    scan: Mutex<MxidCache>,
}

impl UsbHost<RusbBackend> {
    /// Host over the system USB stack with default configuration.
    pub fn new(program: MxidProgram) -> Result<Self, TransportError> {
        Ok(UsbHost::with_backend(RusbBackend::new()?, program, HostConfig::default()))
    }
}

impl<B: UsbBackend> UsbHost<B> {
    /// Host over a caller-supplied backend, the seam tests use.
    pub fn with_backend(backend: B, program: MxidProgram, config: HostConfig) -> Self {
        UsbHost {
            backend,
            program,
            config,
            scan: Mutex::new(MxidCache::new()),
        }
    }

    /// Sweep the bus once and report every device passing `filter`, at most
    /// `max_devices` records.
    ///
    /// A completed sweep is `Ok` even when individual records carry a
    /// non-success [`DeviceStatus`]; only a failed device-list fetch errors.
    pub fn enumerate(
        &self,
        filter: &DeviceFilter,
        max_devices: usize,
    ) -> Result<Vec<DeviceRecord>, TransportError> {
        let mut cache = self.lock_scan();
        enumerate::enumerate_devices(&self.backend, &self.program, &mut cache, filter, max_devices)
    }

    /// Find the device currently attached at `path`. The returned reference
    /// is owned by the caller and released on drop.
    pub fn lookup(&self, path: &str) -> Result<B::Device, TransportError> {
        let _scan = self.lock_scan();
        enumerate::lookup_device(&self.backend, path)
    }

    /// Boot `image` into the unbooted device at `path`. The path is the one
    /// the enumerator reported for the device.
    pub fn boot_firmware(&self, path: &str, image: &[u8]) -> Result<(), BootError> {
        boot::boot_firmware(self, path, image)
    }

    /// Reboot the device at `path` into its flashed bootloader. Best-effort:
    /// the device resets without acknowledging.
    pub fn boot_bootloader(&self, path: &str) -> Result<(), TransportError> {
        boot::boot_bootloader(self, path)
    }

    /// Open a data pipe to the booted device at `path`.
    pub fn connect(&self, path: &str) -> Result<DataPipe<HandleOf<B>>, TransportError> {
        pipe::connect(self, path)
    }

    fn lock_scan(&self) -> std::sync::MutexGuard<'_, MxidCache> {
        // The cache is rebuilt at the start of every sweep, so a lock
        // poisoned mid-sweep holds nothing worth protecting.
        self.scan.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
