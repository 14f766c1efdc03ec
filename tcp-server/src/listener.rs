//! Listening socket setup.
//!
//! The socket is created with raw `libc` calls so that `SO_REUSEADDR` and
//! `O_NONBLOCK` are in place before `bind`/`listen`, which `std::net`
//! does not allow. The descriptor lives in an [`OwnedFd`] from the moment
//! it exists, so every early return closes it.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::{debug, error};

use crate::error::{Result, ServerError};

/// Create a bound, listening, non-blocking IPv4 TCP socket.
///
/// `address` must be a dotted-quad (`"127.0.0.1"`); port 0 binds an
/// ephemeral port, readable through [`TcpListener::local_addr`].
pub fn init_listen_server(address: &str, port: u16) -> Result<TcpListener> {
    let ip: Ipv4Addr = address.parse().map_err(|_| {
        error!(address, "address is not an IPv4 dotted-quad");
        ServerError::InvalidAddress(address.to_string())
    })?;
    let addr = SocketAddrV4::new(ip, port);

    let fd = create_socket().inspect_err(|e| error!(error = %e, "socket() failed"))?;

    set_reuse_addr(fd.as_raw_fd())
        .map_err(|source| socket_option("SO_REUSEADDR", source))?;
    set_nonblocking(fd.as_raw_fd()).map_err(|source| socket_option("O_NONBLOCK", source))?;

    bind(fd.as_raw_fd(), addr).map_err(|source| {
        error!(%addr, error = %source, "bind() failed");
        ServerError::BindFailed { addr, source }
    })?;

    // SAFETY: fd is an open, bound socket owned by this function.
    if unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) } == -1 {
        let e = io::Error::last_os_error();
        error!(%addr, error = %e, "listen() failed");
        return Err(ServerError::ListenFailed(e));
    }

    debug!(fd = fd.as_raw_fd(), %addr, "listening socket ready");
    Ok(TcpListener::from(fd))
}

fn socket_option(option: &'static str, source: io::Error) -> ServerError {
    error!(option, error = %source, "socket option failed");
    ServerError::SocketOption { option, source }
}

fn create_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call, no pointers involved.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw == -1 {
        return Err(ServerError::SocketCreateFailed(io::Error::last_os_error()));
    }
    // SAFETY: raw is a freshly created descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: the option value points to a live c_int and the length matches it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&on as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an open descriptor with integer arguments only.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    // SAFETY: an all-zero sockaddr_in is valid; family, port and address are filled below.
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    // SAFETY: sa is fully initialized and the length is its exact size.
    let rc = unsafe {
        libc::bind(
            fd,
            (&sa as *const libc::sockaddr_in).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
