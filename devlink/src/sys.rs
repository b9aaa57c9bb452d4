//! Thin wrappers over the libc socket and poll calls used by fd transports.
//!
//! All `unsafe` code in the crate is confined to this module.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Listen backlog for server sockets.
#[cfg(target_os = "linux")]
const BACKLOG: libc::c_int = 64;

/// Reads exactly `buf.len()` bytes, retrying on `EINTR`.
///
/// A zero-byte read before the buffer is full yields `UnexpectedEof`.
pub fn read_exact(fd: BorrowedFd<'_>, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: `buf` is a valid writable region of `buf.len()` bytes and
        // `fd` is borrowed for the duration of the call.
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            #[allow(clippy::cast_sign_loss)]
            n => buf = &mut buf[n as usize..],
        }
    }
    Ok(())
}

/// Writes all of `buf`, retrying on `EINTR` and short writes.
pub fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: `buf` is a valid readable region of `buf.len()` bytes.
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            continue;
        }
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        #[allow(clippy::cast_sign_loss)]
        let written = n as usize;
        buf = &buf[written..];
    }
    Ok(())
}

/// Calls `poll(2)`. An interrupted wait reports zero ready descriptors.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    #[allow(clippy::cast_possible_truncation)]
    let nfds = fds.len() as libc::nfds_t;
    // SAFETY: `fds` is a valid, exclusively borrowed array of `nfds` pollfds.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(ret as usize)
}

/// Returns `true` if `fd` is readable (or hung up) within `timeout_ms`.
pub fn readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = [libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    Ok(poll(&mut pfd, timeout_ms)? > 0 && pfd[0].revents != 0)
}

/// Accepts one connection from a listening socket.
pub fn accept(listener: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    loop {
        // SAFETY: null address pointers are allowed when the peer address
        // is not needed.
        let fd = unsafe {
            libc::accept(
                listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            // SAFETY: accept returned a fresh descriptor that we now own.
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Creates a vsock stream socket.
#[cfg(target_os = "linux")]
fn vsock_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked before wrapping.
    let fd: RawFd =
        unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a fresh, valid descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Builds a `sockaddr_vm` for `cid:port`.
#[cfg(target_os = "linux")]
fn vsock_addr(cid: u32, port: u32) -> libc::sockaddr_vm {
    // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    {
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    }
    addr.svm_cid = cid;
    addr.svm_port = port;
    addr
}

/// Creates a vsock listener bound to `port` on any CID.
#[cfg(target_os = "linux")]
pub fn vsock_listen(port: u32) -> io::Result<OwnedFd> {
    let sock = vsock_socket()?;
    let addr = vsock_addr(libc::VMADDR_CID_ANY, port);
    #[allow(clippy::cast_possible_truncation)]
    let len = size_of::<libc::sockaddr_vm>() as libc::socklen_t;
    // SAFETY: addr is a properly initialised sockaddr_vm of `len` bytes.
    if unsafe { libc::bind(sock.as_raw_fd(), std::ptr::from_ref(&addr).cast(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: sock is a bound stream socket.
    if unsafe { libc::listen(sock.as_raw_fd(), BACKLOG) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sock)
}

/// Connects a vsock stream to `cid:port`.
#[cfg(target_os = "linux")]
pub fn vsock_connect(cid: u32, port: u32) -> io::Result<OwnedFd> {
    let sock = vsock_socket()?;
    let addr = vsock_addr(cid, port);
    #[allow(clippy::cast_possible_truncation)]
    let len = size_of::<libc::sockaddr_vm>() as libc::socklen_t;
    loop {
        // SAFETY: addr is a properly initialised sockaddr_vm of `len` bytes.
        let ret = unsafe { libc::connect(sock.as_raw_fd(), std::ptr::from_ref(&addr).cast(), len) };
        if ret == 0 {
            return Ok(sock);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
