//! Socket options std does not expose
//!
//! Buffer sizes and the outgoing multicast interface are set directly with
//! `setsockopt`.

use std::io;
use std::net::Ipv4Addr;

#[cfg(unix)]
use std::os::fd::AsRawFd;

#[cfg(unix)]
fn setsockopt<T>(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set the size of the socket receive buffer (SO_RCVBUF)
///
/// The OS may round or double the value; Linux reports twice the requested
/// size to leave room for bookkeeping.
#[cfg(unix)]
pub(crate) fn set_recv_buffer_size<S: AsRawFd>(socket: &S, size: usize) -> io::Result<()> {
    let size = size as libc::c_int;
    setsockopt(socket.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, &size)
}

/// Set the size of the socket send buffer (SO_SNDBUF)
#[cfg(unix)]
pub(crate) fn set_send_buffer_size<S: AsRawFd>(socket: &S, size: usize) -> io::Result<()> {
    let size = size as libc::c_int;
    setsockopt(socket.as_raw_fd(), libc::SOL_SOCKET, libc::SO_SNDBUF, &size)
}

/// Select the interface outgoing multicast datagrams leave from (IP_MULTICAST_IF)
#[cfg(unix)]
pub(crate) fn set_multicast_if_v4<S: AsRawFd>(socket: &S, interface: Ipv4Addr) -> io::Result<()> {
    let addr = libc::in_addr {
        s_addr: u32::from(interface).to_be(),
    };
    setsockopt(socket.as_raw_fd(), libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &addr)
}

#[cfg(not(unix))]
pub(crate) fn set_recv_buffer_size<S>(_socket: &S, _size: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "SO_RCVBUF not supported"))
}

#[cfg(not(unix))]
pub(crate) fn set_send_buffer_size<S>(_socket: &S, _size: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "SO_SNDBUF not supported"))
}

#[cfg(not(unix))]
pub(crate) fn set_multicast_if_v4<S>(_socket: &S, _interface: Ipv4Addr) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_MULTICAST_IF not supported",
    ))
}
