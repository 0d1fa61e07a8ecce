/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * Kernel ABI for CAN sockets, mirrored from:
 *    include/uapi/linux/can.h
 *    include/uapi/linux/can/raw.h
 *    include/uapi/linux/can/j1939.h
 *
*/

#![allow(dead_code)]
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]

use std::collections::TryReserveError;
use std::mem;
use std::os::raw::c_int;

// socket families and protocols
pub const can_SOCK_x_PF_CAN: c_int = libc::PF_CAN;
pub const can_SOCK_x_AF_CAN: libc::sa_family_t = libc::AF_CAN as libc::sa_family_t;
pub const can_SOCK_x_RAW: c_int = libc::SOCK_RAW;
pub const can_SOCK_x_DGRAM: c_int = libc::SOCK_DGRAM;
pub const can_SOCK_x_CANRAW: c_int = 1;
pub const can_SOCK_x_BCM: c_int = 2;
pub const can_SOCK_x_J1939: c_int = 7;
pub const can_SOCK_x_IFACE_LEN: usize = libc::IFNAMSIZ;

// generic socket level
pub const can_SOCK_x_SOL_SOCKET: c_int = libc::SOL_SOCKET;
pub const can_SOCK_x_SO_BROADCAST: c_int = libc::SO_BROADCAST;
pub const can_SOCK_x_SO_RCVBUF: c_int = libc::SO_RCVBUF;
pub const can_SOCK_x_SO_RCVTIMEO: c_int = libc::SO_RCVTIMEO;
pub const can_SOCK_x_SO_SNDTIMEO: c_int = libc::SO_SNDTIMEO;
pub const can_SOCK_x_SO_TIMESTAMP: c_int = libc::SO_TIMESTAMP;
pub const can_SOCK_x_SO_TIMESTAMPNS: c_int = libc::SO_TIMESTAMPNS;
pub const can_SOCK_x_SO_TIMESTAMP_NEW: c_int = 63;
pub const can_SOCK_x_SO_TIMESTAMPNS_NEW: c_int = 64;

// CAN_RAW level
const SOL_CAN_BASE: c_int = 100;
pub const can_RAW_x_SOL_CAN_RAW: c_int = SOL_CAN_BASE + can_SOCK_x_CANRAW;
pub const can_RAW_x_LOOPBACK: c_int = 3;
pub const can_RAW_x_RECV_OWN_MSGS: c_int = 4;

// CAN_J1939 level
pub const can_J1939_x_SOL_CAN_J1939: c_int = SOL_CAN_BASE + can_SOCK_x_J1939;
pub const can_J1939_x_SO_FILTER: c_int = 1;
pub const can_J1939_x_SO_PROMISC: c_int = 2;
pub const can_J1939_x_SO_SEND_PRIO: c_int = 3;
pub const can_J1939_x_SO_ERRQUEUE: c_int = 4;
pub const can_J1939_x_SCM_DEST_ADDR: c_int = 1;
pub const can_J1939_x_SCM_DEST_NAME: c_int = 2;
pub const can_J1939_x_SCM_PRIO: c_int = 3;
pub const can_J1939_x_SCM_ERRQUEUE: c_int = 4;

pub const can_J1939_x_MAX_UNICAST_ADDR: u8 = 0xFD;
pub const can_J1939_x_IDLE_ADDR: u8 = 0xFE;
pub const can_J1939_x_NO_ADDR: u8 = 0xFF;
pub const can_J1939_x_NO_NAME: u64 = 0;
pub const can_J1939_x_PGN_REQUEST: u32 = 0x0EA00;
pub const can_J1939_x_PGN_ADDRESS_CLAIMED: u32 = 0x0EE00;
pub const can_J1939_x_PGN_PDU1_MAX: u32 = 0x3FF00;
pub const can_J1939_x_PGN_MAX: u32 = 0x3FFFF;
pub const can_J1939_x_NO_PGN: u32 = 0x40000;
pub const can_J1939_x_FILTER_MAX: usize = 512;
// 255 TP packets of 7 bytes
pub const can_J1939_x_MAX_TP_PACKET_SIZE: usize = 7 * 255;

/// `sockaddr_can.can_addr.j1939`. The j1939 arm is the largest member of the
/// kernel union, so embedding it directly keeps the kernel layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct sockaddr_can_j1939 {
    pub name: u64,
    pub pgn: u32,
    pub addr: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct sockaddr_can {
    pub can_family: libc::sa_family_t,
    pub can_ifindex: c_int,
    pub can_addr: sockaddr_can_j1939,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct j1939_filter {
    pub name: u64,
    pub name_mask: u64,
    pub pgn: u32,
    pub pgn_mask: u32,
    pub addr: u8,
    pub addr_mask: u8,
}

impl j1939_filter {
    /// Serialize a filter list into the byte buffer expected by SO_J1939_FILTER.
    /// Padding is explicitly zeroed.
    pub fn to_bytes(filters: &[j1939_filter]) -> Result<Vec<u8>, TryReserveError> {
        let size = mem::size_of::<j1939_filter>();
        let mut buffer: Vec<u8> = Vec::new();
        buffer.try_reserve_exact(size * filters.len())?;
        for filter in filters {
            let start = buffer.len();
            buffer.resize(start + size, 0);
            let slot = &mut buffer[start..];
            put_bytes(slot, mem::offset_of!(j1939_filter, name), &filter.name.to_ne_bytes());
            put_bytes(slot, mem::offset_of!(j1939_filter, name_mask), &filter.name_mask.to_ne_bytes());
            put_bytes(slot, mem::offset_of!(j1939_filter, pgn), &filter.pgn.to_ne_bytes());
            put_bytes(slot, mem::offset_of!(j1939_filter, pgn_mask), &filter.pgn_mask.to_ne_bytes());
            slot[mem::offset_of!(j1939_filter, addr)] = filter.addr;
            slot[mem::offset_of!(j1939_filter, addr_mask)] = filter.addr_mask;
        }
        Ok(buffer)
    }
}

fn put_bytes(slot: &mut [u8], offset: usize, value: &[u8]) {
    slot[offset..offset + value.len()].copy_from_slice(value);
}

// ancillary buffer layout, reference https://github.com/rust-lang/libc/blob/master/src/unix/linux_like/mod.rs
// cmsghdr = { size_t cmsg_len; int cmsg_level; int cmsg_type; } followed by aligned data
pub const CMSG_LEN_SZ: usize = mem::size_of::<usize>();

pub const fn cmsg_align(len: usize) -> usize {
    (len + mem::size_of::<usize>() - 1) & !(mem::size_of::<usize>() - 1)
}

pub const fn cmsg_hdrlen() -> usize {
    cmsg_align(mem::size_of::<libc::cmsghdr>())
}

pub const fn cmsg_len(length: usize) -> usize {
    cmsg_hdrlen() + length
}

pub const fn cmsg_space(length: usize) -> usize {
    cmsg_hdrlen() + cmsg_align(length)
}

/// Append one ancillary item using the kernel layout.
pub fn cmsg_push(buffer: &mut Vec<u8>, level: c_int, kind: c_int, data: &[u8]) {
    let start = buffer.len();
    buffer.resize(start + cmsg_space(data.len()), 0);
    let slot = &mut buffer[start..];
    put_bytes(slot, 0, &cmsg_len(data.len()).to_ne_bytes());
    put_bytes(slot, CMSG_LEN_SZ, &level.to_ne_bytes());
    put_bytes(slot, CMSG_LEN_SZ + mem::size_of::<c_int>(), &kind.to_ne_bytes());
    put_bytes(slot, cmsg_hdrlen(), data);
}

// room for timestamp + dest addr + dest name + priority, with spare for errqueue items
pub const CMSG_J1939_SPACE: usize = cmsg_space(2 * mem::size_of::<i64>())
    + cmsg_space(mem::size_of::<u8>())
    + cmsg_space(mem::size_of::<u64>())
    + cmsg_space(mem::size_of::<u8>())
    + cmsg_space(64);

const _: () = assert!(mem::size_of::<sockaddr_can>() == 24);
