//! Network interface selection.
//!
//! The interface an engine binds is process-wide configuration: it is
//! chosen once, before any listener or sender exists, either explicitly
//! (by name or address) or by enumeration. The enumeration picks the first
//! non-loopback interface carrying a usable IPv4 address; platforms where
//! interface flags are unreliable simply fall through to that filter.

use std::io;
use std::net::IpAddr;
use std::net::Ipv4Addr;

/// Error type for interface selection.
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    /// Enumeration found no non-loopback interface with an IPv4 address.
    #[error("no suitable network interface found")]
    NoSuitableInterface,

    /// No interface with the requested name carries an IPv4 address.
    #[error("no interface named `{0}` with an IPv4 address")]
    UnknownInterface(String),

    /// An [std::io::Error] wrapper.
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn usable_ipv4(iface: &if_addrs::Interface) -> Option<Ipv4Addr> {
    if iface.is_loopback() {
        return None;
    }
    let IpAddr::V4(ip) = iface.ip() else {
        return None;
    };
    if ip.is_link_local() || ip.is_unspecified() {
        return None;
    }
    Some(ip)
}

/// Picks the first usable interface address on this host.
pub fn default_interface() -> Result<Ipv4Addr, InterfaceError> {
    for iface in if_addrs::get_if_addrs()? {
        if let Some(ip) = usable_ipv4(&iface) {
            log::debug!("using network interface {} ({ip})", iface.name);
            return Ok(ip);
        }
    }

    log::error!("no suitable network interface found");
    Err(InterfaceError::NoSuitableInterface)
}

/// Resolves an interface by OS name to its first usable IPv4 address.
pub fn interface_by_name(name: &str) -> Result<Ipv4Addr, InterfaceError> {
    for iface in if_addrs::get_if_addrs()? {
        if iface.name == name {
            if let Some(ip) = usable_ipv4(&iface) {
                return Ok(ip);
            }
        }
    }

    Err(InterfaceError::UnknownInterface(name.to_string()))
}

/// Lists all usable interfaces as `(name, address)` pairs, for consumers
/// that present a picker.
pub fn available_interfaces() -> Result<Vec<(String, Ipv4Addr)>, InterfaceError> {
    let mut interfaces = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if let Some(ip) = usable_ipv4(&iface) {
            interfaces.push((iface.name, ip));
        }
    }
    Ok(interfaces)
}
