use std::fmt::Display;

const MYRIAD_VID: u16 = 0x03E7;

const UNBOOTED_PID: u16 = 0x2485;
const BOOTED_PID: u16 = 0xF63B;
const BOOTLOADER_PID: u16 = 0xF63C;

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Lifecycle states of a Myriad device, distinguished purely by which USB ID
/// it enumerates with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Running ROM; accepts a firmware image and speaks the small serial
    /// retrieval program.
    Unbooted,
    /// Running application firmware.
    Booted,
    /// Running the flashed bootloader.
    Bootloader,
}

impl Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceState::Unbooted => write!(f, "unbooted"),
            DeviceState::Booted => write!(f, "booted"),
            DeviceState::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Map a USB ID to the device state it advertises. Any other ID is not a
/// device this transport talks to.
pub fn state_for(id: UsbId) -> Option<DeviceState> {
    match (id.vid, id.pid) {
        (MYRIAD_VID, UNBOOTED_PID) => Some(DeviceState::Unbooted),
        (MYRIAD_VID, BOOTED_PID) => Some(DeviceState::Booted),
        (MYRIAD_VID, BOOTLOADER_PID) => Some(DeviceState::Bootloader),
        _ => None,
    }
}

/// Hardware platform of every device reachable through this transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Platform {
    MyriadX,
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Platform::MyriadX => write!(f, "Myriad X"),
        }
    }
}

/// Link protocol of every device reachable through this transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    UsbVsc,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Protocol::UsbVsc => write!(f, "USB VSC"),
        }
    }
}
