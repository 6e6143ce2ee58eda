//! Local network interface lookup
//!
//! Resolves the local interface used for multicast binding, given either a
//! dotted IPv4 literal or an interface name such as `eth0`.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Local interface a multicast socket is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalInterface {
    /// IPv4 address configured on the interface
    pub address: Ipv4Addr,
    /// OS interface index (0 when unknown)
    pub index: u32,
    /// Interface name (empty when unknown)
    pub name: String,
}

/// Resolve an interface specification
///
/// An IPv4 literal must be configured on some local interface; anything
/// else is treated as an interface name and must carry an IPv4 address.
pub(crate) fn resolve(spec: &str) -> Result<LocalInterface> {
    match spec.parse::<Ipv4Addr>() {
        Ok(address) => by_address(address),
        Err(_) => by_name(spec),
    }
}

/// A failed interface listing is a resolution failure like any other
#[cfg(unix)]
fn listing(found: std::io::Result<Vec<(String, Ipv4Addr)>>) -> Result<Vec<(String, Ipv4Addr)>> {
    found.map_err(|e| TransportError::Interface(format!("cannot list interfaces: {}", e)))
}

#[cfg(unix)]
fn by_address(address: Ipv4Addr) -> Result<LocalInterface> {
    let interfaces = listing(sys::ipv4_interfaces())?;
    interfaces
        .into_iter()
        .find(|(_, ip)| *ip == address)
        .map(|(name, address)| LocalInterface {
            index: sys::index_of(&name),
            address,
            name,
        })
        .ok_or_else(|| TransportError::Interface(format!("no interface has address {}", address)))
}

#[cfg(unix)]
fn by_name(name: &str) -> Result<LocalInterface> {
    let interfaces = listing(sys::ipv4_interfaces())?;
    let address = interfaces
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, ip)| ip)
        .ok_or_else(|| TransportError::Interface(format!("no IPv4 interface named {}", name)))?;

    Ok(LocalInterface {
        address,
        index: sys::index_of(name),
        name: name.to_string(),
    })
}

#[cfg(not(unix))]
fn by_address(address: Ipv4Addr) -> Result<LocalInterface> {
    Ok(LocalInterface {
        address,
        index: 0,
        name: String::new(),
    })
}

#[cfg(not(unix))]
fn by_name(name: &str) -> Result<LocalInterface> {
    Err(TransportError::Interface(format!(
        "named interfaces are not supported on this platform: {}",
        name
    )))
}

#[cfg(unix)]
mod sys {
    use std::ffi::{CStr, CString};
    use std::io;
    use std::net::Ipv4Addr;

    /// List `(name, address)` for every IPv4 address on a local interface
    pub(super) fn ipv4_interfaces() -> io::Result<Vec<(String, Ipv4Addr)>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

        unsafe {
            if libc::getifaddrs(&mut head) != 0 {
                return Err(io::Error::last_os_error());
            }

            let mut found = Vec::new();
            let mut cursor = head;
            while !cursor.is_null() {
                let entry = &*cursor;
                if !entry.ifa_addr.is_null()
                    && (*entry.ifa_addr).sa_family as libc::c_int == libc::AF_INET
                {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    let address = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    let name = CStr::from_ptr(entry.ifa_name).to_string_lossy().into_owned();
                    found.push((name, address));
                }
                cursor = entry.ifa_next;
            }

            libc::freeifaddrs(head);
            Ok(found)
        }
    }

    pub(super) fn index_of(name: &str) -> u32 {
        match CString::new(name) {
            Ok(c_name) => unsafe { libc::if_nametoindex(c_name.as_ptr()) },
            Err(_) => 0,
        }
    }
}
