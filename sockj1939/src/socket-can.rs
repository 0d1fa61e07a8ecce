/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/can.html#how-to-use-socketcan
 *    https://www.kernel.org/doc/html/latest/networking/can.html#broadcast-manager-protocol-sockets-sock-dgram
 *    https://docs.kernel.org/networking/j1939.html
 *
*/

use super::cglue;
use crate::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const J1939_NO_ADDR: u8 = cglue::can_J1939_x_NO_ADDR;
pub const J1939_IDLE_ADDR: u8 = cglue::can_J1939_x_IDLE_ADDR;
pub const J1939_MAX_UNICAST_ADDR: u8 = cglue::can_J1939_x_MAX_UNICAST_ADDR;
pub const J1939_NO_NAME: u64 = cglue::can_J1939_x_NO_NAME;
pub const J1939_NO_PGN: u32 = cglue::can_J1939_x_NO_PGN;
pub const J1939_PGN_MAX: u32 = cglue::can_J1939_x_PGN_MAX;
pub const J1939_PGN_REQUEST: u32 = cglue::can_J1939_x_PGN_REQUEST;
pub const J1939_PGN_ADDRESS_CLAIMED: u32 = cglue::can_J1939_x_PGN_ADDRESS_CLAIMED;
pub const J1939_MAX_TP_PACKET_SIZE: usize = cglue::can_J1939_x_MAX_TP_PACKET_SIZE;
pub const J1939_FILTER_MAX: usize = cglue::can_J1939_x_FILTER_MAX;
/// interface index 0 listens on every CAN interface
pub const CAN_IFACE_ALL: i32 = 0;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockCanMod {
    RAW,
    BCM,
    J1939,
}

/// J1939 (name, address, pgn) triple used for bind and filtering.
/// Each field has a "not set" sentinel: `J1939_NO_NAME`, `J1939_NO_ADDR`, `J1939_NO_PGN`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SockJ1939Addr {
    pub name: u64,
    pub addr: u8,
    pub pgn: u32,
}

impl SockJ1939Addr {
    pub fn new(name: u64, addr: u8, pgn: u32) -> Self {
        SockJ1939Addr { name, addr, pgn }
    }

    /// bare listener, no static name/address/pgn
    pub fn any() -> Self {
        SockJ1939Addr {
            name: J1939_NO_NAME,
            addr: J1939_NO_ADDR,
            pgn: J1939_NO_PGN,
        }
    }

    pub fn is_any(&self) -> bool {
        *self == Self::any()
    }
}

impl Default for SockJ1939Addr {
    fn default() -> Self {
        Self::any()
    }
}

/// Owned CAN socket descriptor bound to one interface.
///
/// A handle is driven by one caller context at a time: `send`, `receive` and
/// option calls must not be issued concurrently from different threads.
/// `close` is the exception, it releases the descriptor at most once even when
/// raced. A thread blocked in `recv_j1939` notices the close within one poll
/// slice and returns a `sockcan-closed` error.
pub struct SockCanHandle {
    sys: Arc<dyn SockCanSys>,
    sockfd: AtomicI32,
    mode: SockCanMod,
    iface: i32,
    ifname: Option<String>,
    bound: Option<SockJ1939Addr>,
    recv_timeout: Option<Duration>,
}

pub trait CanIFaceFrom<T> {
    fn map_can_iface(&self, iface: T) -> Result<i32, CanError>;
}

impl CanIFaceFrom<&str> for SockCanHandle {
    fn map_can_iface(&self, iface: &str) -> Result<i32, CanError> {
        self.index_of(iface)
    }
}

impl CanIFaceFrom<i32> for SockCanHandle {
    fn map_can_iface(&self, iface: i32) -> Result<i32, CanError> {
        if iface < 0 {
            return Err(CanError::invalid(
                "fail-socketcan-iface",
                format!("negative interface index:{iface}"),
            ));
        }
        Ok(iface)
    }
}

impl CanIFaceFrom<u32> for SockCanHandle {
    fn map_can_iface(&self, iface: u32) -> Result<i32, CanError> {
        i32::try_from(iface).map_err(|_| {
            CanError::invalid("fail-socketcan-iface", format!("interface index:{iface} out of range"))
        })
    }
}

impl SockCanHandle {
    pub fn open(mode: SockCanMod) -> Result<Self, CanError> {
        Self::open_with(Arc::new(LinuxCan), mode)
    }

    pub fn open_with(sys: Arc<dyn SockCanSys>, mode: SockCanMod) -> Result<Self, CanError> {
        let (kind, proto) = match mode {
            SockCanMod::RAW => (cglue::can_SOCK_x_RAW, cglue::can_SOCK_x_CANRAW),
            SockCanMod::BCM => (cglue::can_SOCK_x_DGRAM, cglue::can_SOCK_x_BCM),
            SockCanMod::J1939 => (cglue::can_SOCK_x_DGRAM, cglue::can_SOCK_x_J1939),
        };

        let sockfd = sys
            .socket(cglue::can_SOCK_x_PF_CAN, kind, proto)
            .map_err(|error| CanError::resource("fail-socketcan-open", &error))?;
        log::debug!("socketcan open mode:{:?} fd:{}", mode, sockfd);

        Ok(SockCanHandle {
            sys,
            sockfd: AtomicI32::new(sockfd),
            mode,
            iface: CAN_IFACE_ALL,
            ifname: None,
            bound: None,
            recv_timeout: None,
        })
    }

    /// Attach the handle to an interface (index or name). For J1939 sockets
    /// `addr` gives the local name/address/pgn, use `SockJ1939Addr::any()` for
    /// a bare listener. RAW and BCM sockets ignore `addr`.
    pub fn bind<T>(&mut self, candev: T, addr: SockJ1939Addr) -> Result<(), CanError>
    where
        SockCanHandle: CanIFaceFrom<T>,
    {
        let sockfd = self.get_fd()?;
        let iface = self.map_can_iface(candev).map_err(|error| {
            CanError::invalid("fail-socketcan-iface", error.get_info())
        })?;

        let ifname = if iface == CAN_IFACE_ALL {
            None
        } else {
            match self.name_of(iface) {
                Ok(ifname) => Some(ifname),
                Err(error) => {
                    return Err(CanError::invalid(
                        "fail-socketcan-iface",
                        format!("no live interface index:{iface} ({})", error.get_info()),
                    ))
                }
            }
        };

        match self.mode {
            SockCanMod::J1939 => {
                let broadcast = addr.addr == J1939_NO_ADDR;
                if broadcast {
                    // broadcast traffic is only delivered on SO_BROADCAST sockets
                    self.set_option(cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_BROADCAST, 1)
                        .map_err(|error| CanError::resource("fail-sockj1939-bind", error.get_info()))?;
                }
                let canaddr = CanSockAddr::new_j1939(iface, addr.name, addr.pgn, addr.addr);
                if let Err(error) = self.sys.bind(sockfd, &canaddr) {
                    if broadcast {
                        if let Err(reset) =
                            self.set_option(cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_BROADCAST, 0)
                        {
                            log::warn!("sockj1939 fd:{} broadcast reset failed {}", sockfd, reset);
                        }
                    }
                    return Err(CanError::resource("fail-sockj1939-bind", &error));
                }
                self.bound = Some(addr);
            }
            SockCanMod::RAW => {
                self.sys
                    .bind(sockfd, &CanSockAddr::new(iface))
                    .map_err(|error| CanError::resource("fail-socketcan-bind", &error))?;
            }
            SockCanMod::BCM => {
                // BCM sockets have no bind, the interface is given through connect
                self.sys
                    .connect(sockfd, &CanSockAddr::new(iface))
                    .map_err(|error| CanError::resource("fail-sockbcm-connect", &error))?;
            }
        }

        log::debug!("socketcan bind fd:{} iface:{} ifname:{:?}", sockfd, iface, ifname);
        self.iface = iface;
        self.ifname = ifname;
        Ok(())
    }

    /// Release the descriptor. The handle is closed afterward even when the OS
    /// reports an error; a second call fails without touching the OS.
    pub fn close(&self) -> Result<(), CanError> {
        let sockfd = self.sockfd.swap(-1, Ordering::AcqRel);
        if sockfd < 0 {
            return Err(CanError::io("sockcan-already-closed", "socket handle already closed"));
        }

        match self.sys.close(sockfd) {
            Ok(()) => {
                log::debug!("socketcan close fd:{}", sockfd);
                Ok(())
            }
            Err(error) => {
                log::warn!("socketcan close fd:{} error:{}", sockfd, error);
                Err(CanError::io("fail-socketcan-close", &error))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sockfd.load(Ordering::Acquire) < 0
    }

    /// raw descriptor, -1 once closed
    pub fn as_rawfd(&self) -> RawFd {
        self.sockfd.load(Ordering::Acquire)
    }

    pub fn get_mode(&self) -> SockCanMod {
        self.mode
    }

    pub fn get_iface(&self) -> i32 {
        self.iface
    }

    pub fn get_ifname(&self) -> Option<&str> {
        self.ifname.as_deref()
    }

    pub fn get_bound(&self) -> Option<SockJ1939Addr> {
        self.bound
    }

    /// read timeout given to `set_timeout`, `None` blocks until a message or close
    pub fn get_recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout
    }

    pub(crate) fn set_recv_timeout(&mut self, timeout: Duration) {
        self.recv_timeout = Some(timeout);
    }

    pub(crate) fn get_fd(&self) -> Result<RawFd, CanError> {
        let sockfd = self.sockfd.load(Ordering::Acquire);
        if sockfd < 0 {
            Err(CanError::io("sockcan-closed", "socket handle is closed"))
        } else {
            Ok(sockfd)
        }
    }

    pub(crate) fn sys(&self) -> &dyn SockCanSys {
        self.sys.as_ref()
    }
}

impl fmt::Debug for SockCanHandle {
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        format
            .debug_struct("SockCanHandle")
            .field("sockfd", &self.as_rawfd())
            .field("mode", &self.mode)
            .field("iface", &self.iface)
            .field("ifname", &self.ifname)
            .field("bound", &self.bound)
            .field("recv_timeout", &self.recv_timeout)
            .finish()
    }
}

impl Drop for SockCanHandle {
    fn drop(&mut self) {
        let sockfd = self.sockfd.swap(-1, Ordering::AcqRel);
        if sockfd >= 0 {
            if let Err(error) = self.sys.close(sockfd) {
                log::warn!("socketcan drop fd:{} error:{}", sockfd, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysmock::MockCan;

    #[test]
    fn open_reports_resource_error() {
        let sys = MockCan::new();
        sys.fail("socket", libc::EMFILE);
        let error = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).err().unwrap();
        assert_eq!(error.get_kind(), CanErrorKind::Resource);
        assert_eq!(error.get_uid(), "fail-socketcan-open");
    }

    #[test]
    fn bind_j1939_listener_enables_broadcast() {
        let sys = MockCan::new();
        sys.add_iface(3, "vcan0");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sock.bind(3, SockJ1939Addr::any()).unwrap();

        assert_eq!(sock.get_iface(), 3);
        assert_eq!(sock.get_ifname(), Some("vcan0"));
        assert_eq!(sock.get_bound(), Some(SockJ1939Addr::any()));
        assert_eq!(
            sys.raw_option(libc::SOL_SOCKET, libc::SO_BROADCAST),
            Some(1i32.to_ne_bytes().to_vec())
        );
        let bound = sys.bound();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].get_iface(), 3);
        assert_eq!(bound[0].get_name(), J1939_NO_NAME);
        assert_eq!(bound[0].get_addr(), J1939_NO_ADDR);
        assert_eq!(bound[0].get_pgn(), J1939_NO_PGN);
    }

    #[test]
    fn bind_j1939_static_address() {
        let sys = MockCan::new();
        sys.add_iface(2, "can0");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sock.bind("can0", SockJ1939Addr::new(0x1122, 0x30, J1939_NO_PGN)).unwrap();

        assert_eq!(sys.count("setsockopt"), 0);
        assert_eq!(sys.bound()[0].get_addr(), 0x30);
        assert_eq!(sys.bound()[0].get_name(), 0x1122);
    }

    #[test]
    fn bind_rejects_dead_interface() {
        let sys = MockCan::new();
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        let error = sock.bind(7, SockJ1939Addr::any()).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        assert_eq!(sys.count("bind"), 0);

        let error = sock.bind(-1, SockJ1939Addr::any()).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
    }

    #[test]
    fn bind_rejects_long_name_without_os_call() {
        let sys = MockCan::new();
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        let before = sys.calls().len();
        let error = sock.bind("a-very-long-can-interface", SockJ1939Addr::any()).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        assert_eq!(sys.calls().len(), before);
    }

    #[test]
    fn bind_twice_is_resource_error() {
        let sys = MockCan::new();
        sys.add_iface(3, "vcan0");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sock.bind(3, SockJ1939Addr::new(J1939_NO_NAME, 0x20, J1939_NO_PGN)).unwrap();
        let error = sock.bind(3, SockJ1939Addr::new(J1939_NO_NAME, 0x20, J1939_NO_PGN)).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Resource);
        assert_eq!(error.get_uid(), "fail-sockj1939-bind");
    }

    #[test]
    fn broadcast_refusal_is_bind_error() {
        let sys = MockCan::new();
        sys.add_iface(3, "vcan0");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sys.fail("setsockopt", libc::EACCES);

        let error = sock.bind(3, SockJ1939Addr::any()).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Resource);
        assert_eq!(error.get_uid(), "fail-sockj1939-bind");
        let os_text = std::io::Error::from_raw_os_error(libc::EACCES).to_string();
        assert!(error.get_info().ends_with(&os_text));
        assert_eq!(sys.count("bind"), 0);
        assert_eq!(sock.get_bound(), None);
    }

    #[test]
    fn failed_bind_resets_broadcast() {
        let sys = MockCan::new();
        sys.add_iface(3, "vcan0");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sys.fail("bind", libc::EADDRINUSE);

        let error = sock.bind(3, SockJ1939Addr::any()).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Resource);
        assert_eq!(error.get_uid(), "fail-sockj1939-bind");
        assert_eq!(
            sys.raw_option(libc::SOL_SOCKET, libc::SO_BROADCAST),
            Some(0i32.to_ne_bytes().to_vec())
        );
        assert_eq!(sys.count("setsockopt"), 2);
        assert_eq!(sock.get_bound(), None);
        assert_eq!(sock.get_ifname(), None);
    }

    #[test]
    fn bind_all_interfaces_skips_lookup() {
        let sys = MockCan::new();
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::RAW).unwrap();
        sock.bind(CAN_IFACE_ALL, SockJ1939Addr::any()).unwrap();
        assert_eq!(sys.count("indextoname"), 0);
        assert_eq!(sock.get_ifname(), None);
        assert_eq!(sock.get_bound(), None);
    }

    #[test]
    fn bcm_connects_instead_of_binding() {
        let sys = MockCan::new();
        sys.add_iface(4, "vcan1");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::BCM).unwrap();
        sock.bind(4u32, SockJ1939Addr::any()).unwrap();
        assert_eq!(sys.count("connect"), 1);
        assert_eq!(sys.count("bind"), 0);
    }

    #[test]
    fn double_close_is_reported_once_released() {
        let sys = MockCan::new();
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sock.close().unwrap();
        assert!(sock.is_closed());
        assert_eq!(sock.as_rawfd(), -1);

        let error = sock.close().unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Io);
        assert_eq!(error.get_uid(), "sockcan-already-closed");
        drop(sock);
        assert_eq!(sys.count("close"), 1);
    }

    #[test]
    fn failed_close_still_closes() {
        let sys = MockCan::new();
        sys.fail("close", libc::EIO);
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        let error = sock.close().unwrap_err();
        assert_eq!(error.get_uid(), "fail-socketcan-close");
        assert!(sock.is_closed());
        drop(sock);
        assert_eq!(sys.count("close"), 1);
    }

    #[test]
    fn drop_releases_descriptor() {
        let sys = MockCan::new();
        drop(SockCanHandle::open_with(sys.clone(), SockCanMod::RAW).unwrap());
        assert_eq!(sys.count("close"), 1);
    }

    #[test]
    fn closed_handle_refuses_bind() {
        let sys = MockCan::new();
        sys.add_iface(3, "vcan0");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sock.close().unwrap();
        let error = sock.bind(3, SockJ1939Addr::any()).unwrap_err();
        assert_eq!(error.get_uid(), "sockcan-closed");
        assert_eq!(sys.count("bind"), 0);
    }
}
