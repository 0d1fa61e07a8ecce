/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/j1939.html
 *    https://github.com/linux-can/can-utils/blob/master/testj1939.c
 *
*/

use super::cglue;
use crate::prelude::*;
use std::io;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Instant;

// longest single wait inside recv_j1939, bounds how late a close is noticed
const RECV_POLL_SLICE_MS: c_int = 1000;

/// Outcome of a readiness wait, errors travel through `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockCanPoll {
    Ready,
    Timeout,
}

pub trait SockCanJ1939 {
    fn open_j1939<T>(candev: T, addr: SockJ1939Addr, timestamp: CanTimeStamp) -> Result<SockCanHandle, CanError>
    where
        SockCanHandle: CanIFaceFrom<T>;

    fn send_j1939(&self, msg: &SockJ1939Msg) -> Result<(), CanError>;
    fn recv_j1939(&self) -> Result<SockJ1939Msg, CanError>;
}

impl SockCanHandle {
    pub fn open_j1939_with<T>(
        sys: Arc<dyn SockCanSys>,
        candev: T,
        addr: SockJ1939Addr,
        timestamp: CanTimeStamp,
    ) -> Result<SockCanHandle, CanError>
    where
        SockCanHandle: CanIFaceFrom<T>,
    {
        let mut sockcan = SockCanHandle::open_with(sys, SockCanMod::J1939)?;
        sockcan.bind(candev, addr)?;
        sockcan.set_timestamp(timestamp)?;
        Ok(sockcan)
    }

    /// Wait until the socket is readable. `timeout_secs` 0 polls once and
    /// returns, negative values are refused.
    pub fn wait_readable(&self, timeout_secs: i32) -> Result<SockCanPoll, CanError> {
        if timeout_secs < 0 {
            return Err(CanError::invalid("sockcan-poll-timeout", format!("negative timeout:{timeout_secs}")));
        }
        let timeout_ms = timeout_secs
            .checked_mul(1000)
            .ok_or_else(|| CanError::invalid("sockcan-poll-timeout", format!("timeout:{timeout_secs}s too large")))?;
        let sockfd = self.get_fd()?;

        let revents = self
            .sys()
            .poll(sockfd, libc::POLLIN, timeout_ms)
            .map_err(|error| CanError::io("fail-sockcan-poll", &error))?;

        if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            Ok(SockCanPoll::Ready)
        } else if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            Err(CanError::io("fail-sockcan-poll", format!("fd:{} revents:{:#x}", sockfd, revents)))
        } else {
            Ok(SockCanPoll::Timeout)
        }
    }

    fn check_j1939(&self) -> Result<(), CanError> {
        match self.get_mode() {
            SockCanMod::J1939 => Ok(()),
            mode => Err(CanError::invalid(
                "invalid-socketcan-mod",
                format!("j1939 message I/O on {:?} socket", mode),
            )),
        }
    }

    // Wait in bounded poll slices until a message is queued. A concurrent
    // close or an expired read timeout ends the wait.
    fn wait_message(&self) -> Result<RawFd, CanError> {
        let timeout = self.get_recv_timeout();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let sockfd = self.get_fd()?;
            let slice_ms = match deadline {
                None => RECV_POLL_SLICE_MS,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(CanError::io(
                            "fail-sockj1939-recv",
                            format!("no message within {}ms", timeout.unwrap_or_default().as_millis()),
                        ));
                    }
                    left.as_millis().clamp(1, RECV_POLL_SLICE_MS as u128) as c_int
                }
            };

            let polled = self.sys().poll(sockfd, libc::POLLIN, slice_ms);
            self.get_fd()?;
            let revents = match polled {
                Ok(revents) => revents,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(CanError::io("fail-sockj1939-recv", &error)),
            };

            if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                return Ok(sockfd);
            }
            if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(CanError::io(
                    "fail-sockj1939-recv",
                    format!("fd:{} revents:{:#x}", sockfd, revents),
                ));
            }
        }
    }

    fn source_ifname(&self, iface: i32) -> String {
        if iface == self.get_iface() {
            if let Some(ifname) = self.get_ifname() {
                return ifname.to_string();
            }
        }
        match self.name_of(iface) {
            Ok(ifname) => ifname,
            Err(error) => {
                log::warn!("sockj1939 fd:{} no name for iface:{} {}", self.as_rawfd(), iface, error);
                String::new()
            }
        }
    }
}

impl SockCanJ1939 for SockCanHandle {
    fn open_j1939<T>(candev: T, addr: SockJ1939Addr, timestamp: CanTimeStamp) -> Result<SockCanHandle, CanError>
    where
        SockCanHandle: CanIFaceFrom<T>,
    {
        SockCanHandle::open_j1939_with(Arc::new(LinuxCan), candev, addr, timestamp)
    }

    /// One transmit attempt. A priority other than `J1939_NO_PRIO` applies to
    /// this message only, the socket send priority is put back once the
    /// transfer returns. A failed restore is reported as
    /// `sockj1939-prio-restore` even though the message went out.
    fn send_j1939(&self, msg: &SockJ1939Msg) -> Result<(), CanError> {
        self.check_j1939()?;
        let sockfd = self.get_fd()?;
        check_outgoing(msg)?;

        let mut previous = None;
        if msg.get_priority() != J1939_NO_PRIO {
            let current = self.get_option(cglue::can_J1939_x_SOL_CAN_J1939, cglue::can_J1939_x_SO_SEND_PRIO)?;
            if current != msg.get_priority() as i32 {
                self.set_option(
                    cglue::can_J1939_x_SOL_CAN_J1939,
                    cglue::can_J1939_x_SO_SEND_PRIO,
                    msg.get_priority() as i32,
                )?;
                previous = Some(current);
            }
        }

        let canaddr =
            CanSockAddr::new_j1939(self.get_iface(), msg.get_dst_name(), msg.get_pgn(), msg.get_dst_addr());
        let sent = self
            .sys()
            .sendto(sockfd, msg.get_data(), &canaddr)
            .map_err(|error| CanError::io("fail-sockj1939-send", &error));

        if let Some(priority) = previous {
            let restored =
                self.set_option(cglue::can_J1939_x_SOL_CAN_J1939, cglue::can_J1939_x_SO_SEND_PRIO, priority);
            if let Err(error) = restored {
                log::warn!("sockj1939 fd:{} send priority:{} not restored {}", sockfd, priority, error);
                if sent.is_ok() {
                    return Err(CanError::io("sockj1939-prio-restore", error.get_info()));
                }
            }
        }

        let count = sent?;
        if count != msg.get_data().len() {
            return Err(CanError::protocol(
                "sockj1939-send-partial",
                format!("partial transfer sent:{} expected:{}", count, msg.get_data().len()),
            ));
        }
        log::trace!("sockj1939 fd:{} sent pgn:{:#x} len:{}", sockfd, msg.get_pgn(), count);
        Ok(())
    }

    /// Block until one message passes the socket bind/filter rules, the read
    /// timeout from `set_timeout` expires, or the handle is closed.
    fn recv_j1939(&self) -> Result<SockJ1939Msg, CanError> {
        self.check_j1939()?;
        let sockfd = self.wait_message()?;

        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(J1939_MAX_TP_PACKET_SIZE)
            .map_err(|error| CanError::resource("sockj1939-recv-alloc", error.to_string()))?;
        data.resize(J1939_MAX_TP_PACKET_SIZE, 0);
        let mut control = vec![0u8; cglue::CMSG_J1939_SPACE];

        // payload, source and control items come from this single call
        let info = self
            .sys()
            .recvmsg(sockfd, &mut data, &mut control)
            .map_err(|error| CanError::io("fail-sockj1939-recv", &error))?;

        data.truncate(info.count);
        control.truncate(info.ctrl_len);
        let wire = SockJ1939Wire {
            iface: info.addr.get_iface(),
            peer: SockJ1939Addr::new(info.addr.get_name(), info.addr.get_addr(), info.addr.get_pgn()),
            data,
            count: info.count,
            flags: CanRecvFlags::from_bits_truncate(info.flags),
            control,
        };

        decode(&wire, &self.source_ifname(wire.iface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysmock::{MockCan, MockRecv};

    const PEER_NAME: u64 = 0x0102030405060708;

    fn listener(sys: &Arc<MockCan>) -> SockCanHandle {
        sys.add_iface(3, "vcan0");
        SockCanHandle::open_j1939_with(sys.clone(), 3, SockJ1939Addr::any(), CanTimeStamp::CLASSIC).unwrap()
    }

    fn peer_control(stamp: i64, priority: u8) -> Vec<u8> {
        cmsg_build(&[
            SockJ1939Cmsg::Timestamp { sec: stamp, usec: 0 },
            SockJ1939Cmsg::DestAddr(J1939_NO_ADDR),
            SockJ1939Cmsg::Priority(priority),
        ])
        .unwrap()
    }

    #[test]
    fn filtered_listener_receives_peer_message() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        let mut filters = SockJ1939Filters::new();
        filters.add(
            SockJ1939Filter::new()
                .set_name(PEER_NAME, !0)
                .set_addr(0x20, !0)
                .set_pgn(0xFE00, !0),
        );
        filters.apply(&sock).unwrap();

        let from = CanSockAddr::new_j1939(3, PEER_NAME, 0xFE00, 0x20);
        sys.push_recv(MockRecv::new(from, &[1, 2, 3], peer_control(1700000000, 6)));

        let msg = sock.recv_j1939().unwrap();
        assert_eq!(msg.get_name(), PEER_NAME);
        assert_eq!(msg.get_addr(), 0x20);
        assert_eq!(msg.get_pgn(), 0xFE00);
        assert_eq!(msg.get_data(), &[1, 2, 3]);
        assert_eq!(msg.get_ifname(), "vcan0");
        assert_eq!(msg.get_stamp(), 1700000000);
        assert_eq!(msg.get_priority(), 6);
        assert_eq!(msg.get_dst_addr(), J1939_NO_ADDR);
        assert!(filters.matches(&msg.get_source()));

        // bound name is cached, no lookup per message
        assert_eq!(sys.count("indextoname"), 1);
        assert_eq!(sys.count("recvmsg"), 1);
    }

    #[test]
    fn receive_from_other_interface() {
        let sys = MockCan::new();
        sys.add_iface(5, "vcan1");
        let mut sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        sock.bind(CAN_IFACE_ALL, SockJ1939Addr::any()).unwrap();

        sys.push_recv(MockRecv::new(CanSockAddr::new_j1939(5, 1, 0xF004, 0x10), &[7], Vec::new()));
        assert_eq!(sock.recv_j1939().unwrap().get_ifname(), "vcan1");

        // unknown interface still delivers the message
        sys.push_recv(MockRecv::new(CanSockAddr::new_j1939(9, 1, 0xF004, 0x10), &[7], Vec::new()));
        let msg = sock.recv_j1939().unwrap();
        assert_eq!(msg.get_ifname(), "");
        assert_eq!(msg.get_data(), &[7]);
    }

    #[test]
    fn truncated_receive_is_protocol_error() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        let mut recv = MockRecv::new(CanSockAddr::new_j1939(3, 1, 0xF004, 0x10), &[1, 2], Vec::new());
        recv.flags = libc::MSG_TRUNC;
        sys.push_recv(recv);

        let error = sock.recv_j1939().unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Protocol);

        let mut recv = MockRecv::new(CanSockAddr::new_j1939(3, 1, 0xF004, 0x10), &[1, 2], Vec::new());
        recv.count = J1939_MAX_TP_PACKET_SIZE + 1;
        sys.push_recv(recv);
        let error = sock.recv_j1939().unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Protocol);
    }

    #[test]
    fn receive_os_error_is_io_error() {
        let sys = MockCan::new();
        let sock = listener(&sys);

        // readable but nothing queued: recvmsg answers EAGAIN
        sys.push_poll(libc::POLLIN);
        let error = sock.recv_j1939().unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Io);
        assert_eq!(error.get_uid(), "fail-sockj1939-recv");

        sys.push_poll(libc::POLLERR);
        let error = sock.recv_j1939().unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Io);
        assert_eq!(error.get_uid(), "fail-sockj1939-recv");
        assert_eq!(sys.count("recvmsg"), 1);
    }

    #[test]
    fn receive_waits_across_poll_slices() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        sys.push_poll(0);
        sys.push_poll(0);
        sys.push_recv(MockRecv::new(CanSockAddr::new_j1939(3, 1, 0xF004, 0x10), &[9], Vec::new()));

        assert_eq!(sock.recv_j1939().unwrap().get_data(), &[9]);
        assert_eq!(sys.count("poll"), 3);
        assert_eq!(sys.count("recvmsg"), 1);
    }

    #[test]
    fn close_ends_blocked_receive() {
        let sys = MockCan::new();
        let sock = listener(&sys);

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| sock.recv_j1939());
            while sys.count("poll") < 3 {
                std::thread::yield_now();
            }
            sock.close().unwrap();
            let error = waiter.join().unwrap().unwrap_err();
            assert_eq!(error.get_kind(), CanErrorKind::Io);
            assert_eq!(error.get_uid(), "sockcan-closed");
        });
        assert_eq!(sys.count("recvmsg"), 0);
        assert_eq!(sys.count("close"), 1);
    }

    #[test]
    fn receive_honors_read_timeout() {
        let sys = MockCan::new();
        let mut sock = listener(&sys);
        sock.set_timeout(30, 0).unwrap();
        assert_eq!(sock.get_recv_timeout(), Some(std::time::Duration::from_millis(30)));

        let start = Instant::now();
        let error = sock.recv_j1939().unwrap_err();
        assert!(start.elapsed() >= std::time::Duration::from_millis(30));
        assert_eq!(error.get_kind(), CanErrorKind::Io);
        assert_eq!(error.get_uid(), "fail-sockj1939-recv");
        assert!(sys.count("poll") > 1);
        assert_eq!(sys.count("recvmsg"), 0);
    }

    #[test]
    fn send_targets_message_destination() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        let msg = SockJ1939Msg::new(J1939_PGN_REQUEST, &[0x00, 0xEE, 0x00])
            .with_dst(J1939_NO_NAME, 0x42)
            .with_priority(6);
        sock.send_j1939(&msg).unwrap();

        let sent = sys.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec![0x00, 0xEE, 0x00]);
        assert_eq!(sent[0].1.get_iface(), 3);
        assert_eq!(sent[0].1.get_addr(), 0x42);
        assert_eq!(sent[0].1.get_pgn(), J1939_PGN_REQUEST);
        assert_eq!(sys.sent_prio(), vec![Some(6)]);
        // already the socket priority, nothing to override
        assert_eq!(sys.count("setsockopt"), 2);
    }

    #[test]
    fn message_priority_does_not_leak() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[1]).with_priority(2)).unwrap();
        sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[2])).unwrap();

        assert_eq!(sys.sent_prio(), vec![Some(2), Some(6)]);
        assert_eq!(sys.raw_option(107, 3), Some(6i32.to_ne_bytes().to_vec()));
    }

    #[test]
    fn message_priority_restored_after_failed_send() {
        let sys = MockCan::new();
        let mut sock = listener(&sys);
        sock.set_priority(4).unwrap();
        sys.fail("sendto", libc::ENETDOWN);

        let error = sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[1]).with_priority(1)).unwrap_err();
        assert_eq!(error.get_uid(), "fail-sockj1939-send");
        assert_eq!(sys.sent_prio(), Vec::<Option<i32>>::new());
        assert_eq!(sys.raw_option(107, 3), Some(4i32.to_ne_bytes().to_vec()));
    }

    #[test]
    fn send_large_message_in_one_call() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        let payload = vec![0x55u8; J1939_MAX_TP_PACKET_SIZE];
        sock.send_j1939(&SockJ1939Msg::new(0xFECA, &payload)).unwrap();
        assert_eq!(sys.count("sendto"), 1);
        assert_eq!(sys.sent()[0].0.len(), J1939_MAX_TP_PACKET_SIZE);
    }

    #[test]
    fn partial_send_is_reported() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        sys.set_send_count(2);
        let error = sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[1, 2, 3, 4])).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Protocol);
        assert!(error.get_info().starts_with("partial transfer"));
        assert_eq!(sys.count("sendto"), 1);
    }

    #[test]
    fn send_failure_carries_os_text() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        sys.fail("sendto", libc::ENOBUFS);
        let error = sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[1])).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Io);
        let os_text = std::io::Error::from_raw_os_error(libc::ENOBUFS).to_string();
        assert_eq!(error.get_info(), os_text);
        assert_eq!(sys.count("sendto"), 1);
    }

    #[test]
    fn invalid_message_never_reaches_os() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        let error = sock.send_j1939(&SockJ1939Msg::new(0xEA42, &[1])).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        assert_eq!(sys.count("sendto"), 0);
    }

    #[test]
    fn raw_socket_has_no_j1939_io() {
        let sys = MockCan::new();
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::RAW).unwrap();
        let error = sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[1])).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        let error = sock.recv_j1939().unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
    }

    #[test]
    fn poll_outcomes() {
        let sys = MockCan::new();
        let sock = listener(&sys);

        sys.push_poll(libc::POLLIN);
        assert_eq!(sock.wait_readable(1).unwrap(), SockCanPoll::Ready);
        assert_eq!(sock.wait_readable(0).unwrap(), SockCanPoll::Timeout);

        sys.push_poll(libc::POLLNVAL);
        assert_eq!(sock.wait_readable(0).unwrap_err().get_kind(), CanErrorKind::Io);
        sys.push_poll(libc::POLLERR);
        assert_eq!(sock.wait_readable(0).unwrap_err().get_kind(), CanErrorKind::Io);
        assert_eq!(sys.count("poll"), 4);

        let error = sock.wait_readable(-1).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        assert_eq!(sys.count("poll"), 4);
    }

    #[test]
    fn closed_handle_refuses_io() {
        let sys = MockCan::new();
        let sock = listener(&sys);
        sock.close().unwrap();
        assert_eq!(sock.recv_j1939().unwrap_err().get_uid(), "sockcan-closed");
        assert_eq!(sock.send_j1939(&SockJ1939Msg::new(0xFECA, &[1])).unwrap_err().get_uid(), "sockcan-closed");
        assert_eq!(sock.wait_readable(1).unwrap_err().get_uid(), "sockcan-closed");
        assert_eq!(sys.count("recvmsg") + sys.count("sendto") + sys.count("poll"), 0);
    }
}
