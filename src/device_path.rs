//! Stable textual paths derived from a device's position on the bus.
//!
//! The path is the key callers use to refer to one physical attachment. It
//! survives the device's soft reboots between lifecycle states, which is what
//! makes boot-then-reopen possible at all.

use std::fmt::Write as _;

use crate::backend::UsbDevice;

/// Longest supported port chain below the root hub.
pub const MAX_PORT_CHAIN: usize = 7;

/// Upper bound on a rendered path, `"255"` plus seven `".255"` components.
pub const MAX_PATH_SIZE: usize = 64;

/// Rendered when the topology cannot be read. Still a usable record key, but
/// it never equals a caller-supplied path filter.
pub const PATH_ERROR: &str = "<error>";

/// Render the canonical `bus[.port…]` path for a device.
pub fn device_path<D: UsbDevice>(device: &D) -> String {
    let ports = match device.port_numbers() {
        Ok(ports) => ports,
        Err(_) => return PATH_ERROR.to_owned(),
    };
    if ports.len() > MAX_PORT_CHAIN {
        return PATH_ERROR.to_owned();
    }
    render_path(device.bus_number(), &ports)
}

fn render_path(bus: u8, ports: &[u8]) -> String {
    let mut path = bus.to_string();
    for port in ports {
        write!(path, ".{port}").unwrap();
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_only_renders_without_ports() {
        assert_eq!(render_path(3, &[]), "3");
    }

    #[test]
    fn port_chain_is_dot_separated_decimal() {
        assert_eq!(render_path(1, &[2]), "1.2");
        assert_eq!(render_path(1, &[2, 10, 255]), "1.2.10.255");
    }

    #[test]
    fn longest_chain_stays_within_bound() {
        let path = render_path(255, &[255; MAX_PORT_CHAIN]);
        assert_eq!(path, "255.255.255.255.255.255.255.255");
        assert!(path.len() < MAX_PATH_SIZE);
    }
}
