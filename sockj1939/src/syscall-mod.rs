/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/j1939.html#api-calls
 *    https://man7.org/linux/man-pages/man2/recvmsg.2.html
 *
*/

use super::cglue;
use std::ffi::{c_void, CStr};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::os::raw::{c_char, c_int};

/// CAN socket address (`struct sockaddr_can`), J1939 arm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanSockAddr(pub(crate) cglue::sockaddr_can);

impl CanSockAddr {
    pub fn new(iface: i32) -> Self {
        CanSockAddr(cglue::sockaddr_can {
            can_family: cglue::can_SOCK_x_AF_CAN,
            can_ifindex: iface,
            can_addr: cglue::sockaddr_can_j1939::default(),
        })
    }

    pub fn new_j1939(iface: i32, name: u64, pgn: u32, addr: u8) -> Self {
        CanSockAddr(cglue::sockaddr_can {
            can_family: cglue::can_SOCK_x_AF_CAN,
            can_ifindex: iface,
            can_addr: cglue::sockaddr_can_j1939 { name, pgn, addr },
        })
    }

    pub fn get_iface(&self) -> i32 {
        self.0.can_ifindex
    }

    pub fn get_name(&self) -> u64 {
        self.0.can_addr.name
    }

    pub fn get_pgn(&self) -> u32 {
        self.0.can_addr.pgn
    }

    pub fn get_addr(&self) -> u8 {
        self.0.can_addr.addr
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        &self.0 as *const _ as *const libc::sockaddr
    }

    fn socklen() -> libc::socklen_t {
        mem::size_of::<cglue::sockaddr_can>() as libc::socklen_t
    }
}

/// What a single `recvmsg` call returned besides the payload bytes.
#[derive(Clone, Copy, Debug)]
pub struct CanRecvInfo {
    /// byte count reported by the kernel
    pub count: usize,
    /// `msghdr.msg_flags` (MSG_TRUNC, MSG_CTRUNC, ...)
    pub flags: c_int,
    /// bytes of the control buffer filled by the kernel
    pub ctrl_len: usize,
    /// source address
    pub addr: CanSockAddr,
}

/// OS socket facility used by every handle.
///
/// Each call maps one to one onto a syscall and reports failures as the
/// `io::Error` built from errno; no call retries on its own.
pub trait SockCanSys: Send + Sync {
    fn socket(&self, family: c_int, kind: c_int, proto: c_int) -> io::Result<RawFd>;
    fn bind(&self, sockfd: RawFd, addr: &CanSockAddr) -> io::Result<()>;
    fn connect(&self, sockfd: RawFd, addr: &CanSockAddr) -> io::Result<()>;
    fn close(&self, sockfd: RawFd) -> io::Result<()>;
    fn sendto(&self, sockfd: RawFd, data: &[u8], addr: &CanSockAddr) -> io::Result<usize>;
    fn recvmsg(&self, sockfd: RawFd, data: &mut [u8], control: &mut [u8]) -> io::Result<CanRecvInfo>;
    fn setsockopt(&self, sockfd: RawFd, level: c_int, name: c_int, value: &[u8]) -> io::Result<()>;
    /// Returns the option length written by the kernel.
    fn getsockopt(&self, sockfd: RawFd, level: c_int, name: c_int, value: &mut [u8]) -> io::Result<usize>;
    fn nametoindex(&self, ifname: &CStr) -> io::Result<u32>;
    fn indextoname(&self, iface: u32) -> io::Result<String>;
    /// Returns `revents`, zero when the timeout expired.
    fn poll(&self, sockfd: RawFd, events: i16, timeout_ms: c_int) -> io::Result<i16>;
}

/// Linux implementation on top of libc.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxCan;

fn check(status: c_int) -> io::Result<c_int> {
    if status < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(status)
    }
}

fn check_size(count: isize) -> io::Result<usize> {
    if count < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(count as usize)
    }
}

impl SockCanSys for LinuxCan {
    fn socket(&self, family: c_int, kind: c_int, proto: c_int) -> io::Result<RawFd> {
        check(unsafe { libc::socket(family, kind | libc::SOCK_CLOEXEC, proto) })
    }

    fn bind(&self, sockfd: RawFd, addr: &CanSockAddr) -> io::Result<()> {
        check(unsafe { libc::bind(sockfd, addr.as_ptr(), CanSockAddr::socklen()) })?;
        Ok(())
    }

    fn connect(&self, sockfd: RawFd, addr: &CanSockAddr) -> io::Result<()> {
        check(unsafe { libc::connect(sockfd, addr.as_ptr(), CanSockAddr::socklen()) })?;
        Ok(())
    }

    fn close(&self, sockfd: RawFd) -> io::Result<()> {
        check(unsafe { libc::close(sockfd) })?;
        Ok(())
    }

    fn sendto(&self, sockfd: RawFd, data: &[u8], addr: &CanSockAddr) -> io::Result<usize> {
        check_size(unsafe {
            libc::sendto(
                sockfd,
                data.as_ptr() as *const c_void,
                data.len(),
                0,
                addr.as_ptr(),
                CanSockAddr::socklen(),
            )
        })
    }

    fn recvmsg(&self, sockfd: RawFd, data: &mut [u8], control: &mut [u8]) -> io::Result<CanRecvInfo> {
        let mut canaddr = cglue::sockaddr_can::default();
        let mut iovec = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut c_void,
            iov_len: data.len(),
        };

        let mut msg_hdr: libc::msghdr = unsafe { mem::zeroed() };
        msg_hdr.msg_name = &mut canaddr as *mut _ as *mut c_void;
        msg_hdr.msg_namelen = CanSockAddr::socklen();
        msg_hdr.msg_iov = &mut iovec;
        msg_hdr.msg_iovlen = 1;
        msg_hdr.msg_control = control.as_mut_ptr() as *mut c_void;
        msg_hdr.msg_controllen = control.len() as _;
        msg_hdr.msg_flags = 0;

        let count = check_size(unsafe { libc::recvmsg(sockfd, &mut msg_hdr, 0) })?;
        Ok(CanRecvInfo {
            count,
            flags: msg_hdr.msg_flags,
            ctrl_len: msg_hdr.msg_controllen as usize,
            addr: CanSockAddr(canaddr),
        })
    }

    fn setsockopt(&self, sockfd: RawFd, level: c_int, name: c_int, value: &[u8]) -> io::Result<()> {
        check(unsafe {
            libc::setsockopt(
                sockfd,
                level,
                name,
                value.as_ptr() as *const c_void,
                value.len() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    fn getsockopt(&self, sockfd: RawFd, level: c_int, name: c_int, value: &mut [u8]) -> io::Result<usize> {
        let mut optlen = value.len() as libc::socklen_t;
        check(unsafe {
            libc::getsockopt(sockfd, level, name, value.as_mut_ptr() as *mut c_void, &mut optlen)
        })?;
        Ok(optlen as usize)
    }

    fn nametoindex(&self, ifname: &CStr) -> io::Result<u32> {
        let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if index == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(index)
        }
    }

    fn indextoname(&self, iface: u32) -> io::Result<String> {
        let mut buffer = [0 as c_char; cglue::can_SOCK_x_IFACE_LEN];
        let cname = unsafe { libc::if_indextoname(iface, buffer.as_mut_ptr()) };
        if cname.is_null() {
            return Err(io::Error::last_os_error());
        }
        let cstring = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Ok(cstring.to_string_lossy().into_owned())
    }

    fn poll(&self, sockfd: RawFd, events: i16, timeout_ms: c_int) -> io::Result<i16> {
        let mut pollfd = libc::pollfd {
            fd: sockfd,
            events,
            revents: 0,
        };
        let count = check(unsafe { libc::poll(&mut pollfd, 1, timeout_ms) })?;
        if count == 0 {
            Ok(0)
        } else {
            Ok(pollfd.revents)
        }
    }
}
