//! Post-boot bulk data pipe.
//!
//! Once a device is running firmware, application traffic moves through a
//! fixed bulk IN / bulk OUT endpoint pair with no framing at this layer: the
//! caller's buffer is walked in chunks until every byte has moved or the
//! backend reports an error.

use std::time::{Duration, Instant};

use log::debug;

use crate::backend::{
    HandleOf, TransportError, UsbBackend, UsbDevice, UsbHandle, DATA_INTERFACE, ENDPOINT_IN,
    ENDPOINT_OUT,
};
use crate::UsbHost;

/// Largest single bulk transfer handed to the backend.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Data transfers block until completion.
const DATA_TIMEOUT: Duration = Duration::ZERO;

/// How long `connect` waits for the booted device to appear at its path.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An owned, claimed connection to a booted device. Dropping the pipe
/// releases the interface and closes the handle.
pub struct DataPipe<H: UsbHandle> {
    handle: H,
}

impl<H: UsbHandle> DataPipe<H> {
    /// Wrap an already opened and claimed handle.
    pub fn new(handle: H) -> Self {
        DataPipe { handle }
    }

    /// Fill `buf` from the IN endpoint. Returns only once every byte has
    /// arrived; the first backend error aborts the transfer.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let end = buf.len().min(filled + DEFAULT_CHUNK_SIZE);
            let transferred =
                self.handle
                    .bulk_read(ENDPOINT_IN, &mut buf[filled..end], DATA_TIMEOUT)?;
            filled += transferred;
        }
        Ok(())
    }

    /// Send all of `buf` to the OUT endpoint. Same completion and error
    /// semantics as [`DataPipe::read`].
    pub fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut sent = 0;
        while sent < buf.len() {
            let end = buf.len().min(sent + DEFAULT_CHUNK_SIZE);
            let transferred = self
                .handle
                .bulk_write(ENDPOINT_OUT, &buf[sent..end], DATA_TIMEOUT)?;
            sent += transferred;
        }
        Ok(())
    }
}

impl<H: UsbHandle> Drop for DataPipe<H> {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(DATA_INTERFACE);
    }
}

/// Open a pipe to the booted device at `path`. Polls the lookup briefly, then
/// opens and claims in one shot; unlike booting there is no open retry.
pub(crate) fn connect<B: UsbBackend>(
    host: &UsbHost<B>,
    path: &str,
) -> Result<DataPipe<HandleOf<B>>, TransportError> {
    let started = Instant::now();
    let device = loop {
        match host.lookup(path) {
            Ok(device) => break device,
            Err(err) => {
                if started.elapsed() >= OPEN_TIMEOUT {
                    return Err(err);
                }
                std::thread::sleep(OPEN_POLL_INTERVAL);
            }
        }
    };

    let mut handle = device.open()?;
    // A kernel driver may still be bound; failing to detach one is fine on
    // platforms without that notion.
    let _ = handle.detach_kernel_driver(DATA_INTERFACE);
    handle.claim_interface(DATA_INTERFACE)?;

    debug!("opened data pipe to {path}");
    Ok(DataPipe::new(handle))
}
