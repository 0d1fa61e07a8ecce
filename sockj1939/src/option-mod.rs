/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://man7.org/linux/man-pages/man7/socket.7.html
 *    https://www.kernel.org/doc/html/latest/networking/j1939.html#api-calls
 *
*/

use super::cglue;
use crate::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::mem;
use std::os::raw::c_int;
use std::time::Duration;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanTimeStamp {
    NONE,
    CLASSIC,
    NANOSEC,
}

/// Integer socket options with a known (level, name) pair.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockCanOption {
    /// J1939: receive traffic not addressed to the bound address
    Promiscuous,
    /// RAW: receive frames sent by this socket
    RecvOwn,
    /// J1939: default send priority 0..=7
    Priority,
    Timestamp,
    Broadcast,
    RecvBuffer,
    /// J1939: report TP session state on the error queue
    ErrQueue,
}

// kernel options are plain ints, anything else is refused
const CAN_OPTION_SIZE: usize = mem::size_of::<c_int>();

impl SockCanHandle {
    pub fn set_option(&self, level: c_int, name: c_int, value: i32) -> Result<(), CanError> {
        self.set_raw_option(level, name, &value.to_ne_bytes())
    }

    /// Read an integer option. An answer of any size other than 4 bytes is a
    /// protocol error, never truncated or padded.
    pub fn get_option(&self, level: c_int, name: c_int) -> Result<i32, CanError> {
        let sockfd = self.get_fd()?;
        let mut buffer = [0u8; 2 * CAN_OPTION_SIZE];
        let count = self
            .sys()
            .getsockopt(sockfd, level, name, &mut buffer)
            .map_err(|error| CanError::io("fail-socketcan-getopt", &error))?;

        if count != CAN_OPTION_SIZE {
            return Err(CanError::protocol(
                "socketcan-option-size",
                format!("option level:{} name:{} size:{} expected:{}", level, name, count, CAN_OPTION_SIZE),
            ));
        }
        let mut value = [0u8; CAN_OPTION_SIZE];
        value.copy_from_slice(&buffer[..CAN_OPTION_SIZE]);
        Ok(i32::from_ne_bytes(value))
    }

    pub(crate) fn set_raw_option(&self, level: c_int, name: c_int, value: &[u8]) -> Result<(), CanError> {
        let sockfd = self.get_fd()?;
        self.sys()
            .setsockopt(sockfd, level, name, value)
            .map_err(|error| CanError::io("fail-socketcan-setopt", format!("level:{} name:{} {}", level, name, error)))
    }

    fn option_key(&self, option: SockCanOption) -> Result<(c_int, c_int), CanError> {
        let j1939_only = |key: (c_int, c_int)| {
            if self.get_mode() == SockCanMod::J1939 {
                Ok(key)
            } else {
                Err(CanError::invalid("socketcan-option-mod", format!("{:?} needs a J1939 socket", option)))
            }
        };

        match option {
            SockCanOption::Promiscuous => {
                j1939_only((cglue::can_J1939_x_SOL_CAN_J1939, cglue::can_J1939_x_SO_PROMISC))
            }
            SockCanOption::Priority => {
                j1939_only((cglue::can_J1939_x_SOL_CAN_J1939, cglue::can_J1939_x_SO_SEND_PRIO))
            }
            SockCanOption::ErrQueue => {
                j1939_only((cglue::can_J1939_x_SOL_CAN_J1939, cglue::can_J1939_x_SO_ERRQUEUE))
            }
            SockCanOption::RecvOwn => match self.get_mode() {
                SockCanMod::RAW => Ok((cglue::can_RAW_x_SOL_CAN_RAW, cglue::can_RAW_x_RECV_OWN_MSGS)),
                mode => Err(CanError::invalid(
                    "socketcan-option-mod",
                    format!("RecvOwn not supported on {:?} socket", mode),
                )),
            },
            SockCanOption::Timestamp => Ok((cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_TIMESTAMP)),
            SockCanOption::Broadcast => Ok((cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_BROADCAST)),
            SockCanOption::RecvBuffer => Ok((cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_RCVBUF)),
        }
    }

    pub fn set_sockopt(&self, option: SockCanOption, value: i32) -> Result<(), CanError> {
        if option == SockCanOption::Priority && !(0..=J1939_PRIO_MAX as i32).contains(&value) {
            return Err(CanError::invalid("socketcan-option-prio", format!("priority:{} not in 0..=7", value)));
        }
        let (level, name) = self.option_key(option)?;
        self.set_option(level, name, value)
    }

    pub fn get_sockopt(&self, option: SockCanOption) -> Result<i32, CanError> {
        let (level, name) = self.option_key(option)?;
        self.get_option(level, name)
    }

    pub fn set_promisc(&mut self, promisc: bool) -> Result<&mut Self, CanError> {
        self.set_sockopt(SockCanOption::Promiscuous, promisc as i32)?;
        Ok(self)
    }

    pub fn get_promisc(&self) -> Result<bool, CanError> {
        Ok(self.get_sockopt(SockCanOption::Promiscuous)? != 0)
    }

    pub fn set_recv_own(&mut self, loopback: bool) -> Result<&mut Self, CanError> {
        self.set_sockopt(SockCanOption::RecvOwn, loopback as i32)?;
        Ok(self)
    }

    pub fn get_recv_own(&self) -> Result<bool, CanError> {
        Ok(self.get_sockopt(SockCanOption::RecvOwn)? != 0)
    }

    /// Sticky default priority used by every later send on this socket.
    pub fn set_priority(&mut self, priority: u8) -> Result<&mut Self, CanError> {
        self.set_sockopt(SockCanOption::Priority, priority as i32)?;
        Ok(self)
    }

    pub fn set_timestamp(&mut self, timestamp: CanTimeStamp) -> Result<&mut Self, CanError> {
        match timestamp {
            CanTimeStamp::NONE => {}
            CanTimeStamp::CLASSIC => {
                self.set_option(cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_TIMESTAMP, 1)?
            }
            CanTimeStamp::NANOSEC => {
                self.set_option(cglue::can_SOCK_x_SOL_SOCKET, cglue::can_SOCK_x_SO_TIMESTAMPNS, 1)?
            }
        }
        Ok(self)
    }

    /// Blocking read/write timeouts in milliseconds, zero or negative leaves
    /// the current setting untouched. `recv_j1939` gives up once the read
    /// timeout expires without a message.
    pub fn set_timeout(&mut self, read_ms: i64, write_ms: i64) -> Result<&mut Self, CanError> {
        if read_ms > 0 {
            self.set_raw_option(
                cglue::can_SOCK_x_SOL_SOCKET,
                cglue::can_SOCK_x_SO_RCVTIMEO,
                &timeval_bytes(read_ms),
            )?;
            self.set_recv_timeout(Duration::from_millis(read_ms as u64));
        }
        if write_ms > 0 {
            self.set_raw_option(
                cglue::can_SOCK_x_SOL_SOCKET,
                cglue::can_SOCK_x_SO_SNDTIMEO,
                &timeval_bytes(write_ms),
            )?;
        }
        Ok(self)
    }
}

fn timeval_bytes(millis: i64) -> Vec<u8> {
    let timeout = libc::timeval {
        tv_sec: (millis / 1000) as libc::time_t,
        tv_usec: ((millis % 1000) * 1000) as libc::suseconds_t,
    };
    let mut buffer = vec![0u8; mem::size_of::<libc::timeval>()];
    let sec = timeout.tv_sec.to_ne_bytes();
    let usec = timeout.tv_usec.to_ne_bytes();
    let usec_at = mem::offset_of!(libc::timeval, tv_usec);
    buffer[..sec.len()].copy_from_slice(&sec);
    buffer[usec_at..usec_at + usec.len()].copy_from_slice(&usec);
    buffer
}
