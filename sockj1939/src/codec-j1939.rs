/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/j1939.html#api-calls (recvmsg control messages)
 *    https://github.com/linux-can/can-utils/blob/master/j1939cat.c
 *
*/

use super::cglue;
use crate::prelude::*;
use bitflags::bitflags;
use bitvec::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::os::raw::{c_int, c_long};

/// priority not reported by the kernel / left to the socket default
pub const J1939_NO_PRIO: u8 = 0xFF;
pub const J1939_PRIO_MAX: u8 = 7;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct CanRecvFlags: c_int {
        /// payload did not fit the receive buffer
        const TRUNC = libc::MSG_TRUNC;
        /// control items did not fit the ancillary buffer
        const CTRUNC = libc::MSG_CTRUNC;
        const ERRQUEUE = libc::MSG_ERRQUEUE;
    }
}

/// One ancillary item returned next to a J1939 payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockJ1939Cmsg {
    Timestamp { sec: i64, usec: i64 },
    DestAddr(u8),
    DestName(u64),
    Priority(u8),
    Unknown { level: c_int, kind: c_int },
}

/// Ancillary items folded into one record, unseen items keep their default.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockJ1939Meta {
    pub stamp: i64,
    pub dst_addr: u8,
    pub dst_name: u64,
    pub priority: u8,
}

impl Default for SockJ1939Meta {
    fn default() -> Self {
        SockJ1939Meta {
            stamp: 0,
            dst_addr: J1939_NO_ADDR,
            dst_name: J1939_NO_NAME,
            priority: J1939_NO_PRIO,
        }
    }
}

impl SockJ1939Meta {
    pub fn fold(items: &[SockJ1939Cmsg]) -> Self {
        items.iter().fold(SockJ1939Meta::default(), |mut meta, item| {
            match *item {
                SockJ1939Cmsg::Timestamp { sec, .. } => meta.stamp = sec,
                SockJ1939Cmsg::DestAddr(addr) => meta.dst_addr = addr,
                SockJ1939Cmsg::DestName(name) => meta.dst_name = name,
                SockJ1939Cmsg::Priority(priority) => meta.priority = priority,
                SockJ1939Cmsg::Unknown { level, kind } => {
                    log::trace!("sockj1939 ignoring cmsg level:{} type:{}", level, kind)
                }
            }
            meta
        })
    }
}

fn read_int(data: &[u8]) -> Option<i64> {
    match data.len() {
        4 => Some(i32::from_ne_bytes(data.try_into().ok()?) as i64),
        8 => Some(i64::from_ne_bytes(data.try_into().ok()?)),
        _ => None,
    }
}

fn read_usize(data: &[u8], offset: usize) -> Option<usize> {
    let bytes = data.get(offset..offset + mem::size_of::<usize>())?;
    Some(usize::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_cint(data: &[u8], offset: usize) -> Option<c_int> {
    let bytes = data.get(offset..offset + mem::size_of::<c_int>())?;
    Some(c_int::from_ne_bytes(bytes.try_into().ok()?))
}

// (width of one timeval member, member 2 counts nanoseconds)
fn timestamp_layout(kind: c_int) -> Option<(usize, bool)> {
    match kind {
        cglue::can_SOCK_x_SO_TIMESTAMP_NEW => Some((mem::size_of::<i64>(), false)),
        cglue::can_SOCK_x_SO_TIMESTAMPNS_NEW => Some((mem::size_of::<i64>(), true)),
        kind if kind == cglue::can_SOCK_x_SO_TIMESTAMP => Some((mem::size_of::<c_long>(), false)),
        kind if kind == cglue::can_SOCK_x_SO_TIMESTAMPNS => Some((mem::size_of::<c_long>(), true)),
        _ => None,
    }
}

fn cmsg_item(level: c_int, kind: c_int, data: &[u8]) -> Result<SockJ1939Cmsg, CanError> {
    let malformed = || {
        CanError::protocol(
            "j1939-cmsg-malformed",
            format!("control item level:{} type:{} unexpected size:{}", level, kind, data.len()),
        )
    };

    if level == cglue::can_SOCK_x_SOL_SOCKET {
        if let Some((width, nanosec)) = timestamp_layout(kind) {
            if data.len() != 2 * width {
                return Err(malformed());
            }
            let sec = read_int(&data[..width]).ok_or_else(malformed)?;
            let frac = read_int(&data[width..]).ok_or_else(malformed)?;
            let usec = if nanosec { frac / 1000 } else { frac };
            return Ok(SockJ1939Cmsg::Timestamp { sec, usec });
        }
    }

    if level == cglue::can_J1939_x_SOL_CAN_J1939 {
        match kind {
            cglue::can_J1939_x_SCM_DEST_ADDR => {
                let [addr] = data else { return Err(malformed()) };
                return Ok(SockJ1939Cmsg::DestAddr(*addr));
            }
            cglue::can_J1939_x_SCM_DEST_NAME => {
                let bytes: [u8; 8] = data.try_into().map_err(|_| malformed())?;
                return Ok(SockJ1939Cmsg::DestName(u64::from_ne_bytes(bytes)));
            }
            cglue::can_J1939_x_SCM_PRIO => {
                let [priority] = data else { return Err(malformed()) };
                return Ok(SockJ1939Cmsg::Priority(*priority));
            }
            _ => {}
        }
    }

    Ok(SockJ1939Cmsg::Unknown { level, kind })
}

/// Walk an ancillary buffer in kernel layout. Items may come in any order.
pub fn cmsg_parse(control: &[u8]) -> Result<Vec<SockJ1939Cmsg>, CanError> {
    let hdrlen = cglue::cmsg_hdrlen();
    let mut items = Vec::new();
    let mut offset = 0;

    while offset + hdrlen <= control.len() {
        let header_error = || CanError::protocol("j1939-cmsg-malformed", "truncated control header");
        let length = read_usize(control, offset).ok_or_else(header_error)?;
        let level = read_cint(control, offset + cglue::CMSG_LEN_SZ).ok_or_else(header_error)?;
        let kind = read_cint(control, offset + cglue::CMSG_LEN_SZ + mem::size_of::<c_int>())
            .ok_or_else(header_error)?;

        if length < hdrlen || length > control.len() - offset {
            return Err(CanError::protocol(
                "j1939-cmsg-malformed",
                format!("control item length:{} at offset:{} overflows buffer:{}", length, offset, control.len()),
            ));
        }

        items.push(cmsg_item(level, kind, &control[offset + hdrlen..offset + length])?);
        offset += cglue::cmsg_align(length);
    }

    Ok(items)
}

/// Build an ancillary buffer in the same layout `recvmsg` returns.
pub fn cmsg_build(items: &[SockJ1939Cmsg]) -> Result<Vec<u8>, CanError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(cglue::CMSG_J1939_SPACE.max(items.len() * cglue::cmsg_space(16)))
        .map_err(|error| CanError::resource("j1939-cmsg-alloc", error.to_string()))?;

    for item in items {
        match *item {
            SockJ1939Cmsg::Timestamp { sec, usec } => {
                let mut stamp = [0u8; 16];
                stamp[..8].copy_from_slice(&sec.to_ne_bytes());
                stamp[8..].copy_from_slice(&usec.to_ne_bytes());
                cglue::cmsg_push(
                    &mut buffer,
                    cglue::can_SOCK_x_SOL_SOCKET,
                    cglue::can_SOCK_x_SO_TIMESTAMP_NEW,
                    &stamp,
                );
            }
            SockJ1939Cmsg::DestAddr(addr) => cglue::cmsg_push(
                &mut buffer,
                cglue::can_J1939_x_SOL_CAN_J1939,
                cglue::can_J1939_x_SCM_DEST_ADDR,
                &[addr],
            ),
            SockJ1939Cmsg::DestName(name) => cglue::cmsg_push(
                &mut buffer,
                cglue::can_J1939_x_SOL_CAN_J1939,
                cglue::can_J1939_x_SCM_DEST_NAME,
                &name.to_ne_bytes(),
            ),
            SockJ1939Cmsg::Priority(priority) => cglue::cmsg_push(
                &mut buffer,
                cglue::can_J1939_x_SOL_CAN_J1939,
                cglue::can_J1939_x_SCM_PRIO,
                &[priority],
            ),
            SockJ1939Cmsg::Unknown { level, kind } => cglue::cmsg_push(&mut buffer, level, kind, &[]),
        }
    }
    Ok(buffer)
}

// PGN layout: | EDP | DP | PF (8) | PS (8) |
pub fn pgn_pdu_specific(pgn: u32) -> u8 {
    pgn.view_bits::<Lsb0>()[0..8].load_le::<u8>()
}

pub fn pgn_pdu_format(pgn: u32) -> u8 {
    pgn.view_bits::<Lsb0>()[8..16].load_le::<u8>()
}

/// extended data page and data page bits, `(EDP << 1) | DP`
pub fn pgn_data_page(pgn: u32) -> u8 {
    pgn.view_bits::<Lsb0>()[16..18].load_le::<u8>()
}

/// PF < 240: destination specific, the PS byte carries the destination address
pub fn pgn_is_pdu1(pgn: u32) -> bool {
    pgn_pdu_format(pgn) < 240
}

pub fn pgn_is_valid(pgn: u32) -> bool {
    pgn <= J1939_PGN_MAX
}

/// PDU1 pgn must carry a zero PS byte, the kernel rejects anything else
pub fn pgn_is_clean(pgn: u32) -> bool {
    !pgn_is_pdu1(pgn) || pgn_pdu_specific(pgn) == 0
}

/// One J1939 message as delivered by (or handed to) the kernel transport.
/// Payloads above 8 bytes travel through the kernel TP/ETP session.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SockJ1939Msg {
    ifname: String,
    name: u64,
    addr: u8,
    dst_name: u64,
    dst_addr: u8,
    pgn: u32,
    priority: u8,
    data: Vec<u8>,
    stamp: i64,
}

impl SockJ1939Msg {
    /// Outgoing message, broadcast with default priority until told otherwise.
    pub fn new(pgn: u32, data: &[u8]) -> Self {
        SockJ1939Msg {
            ifname: String::new(),
            name: J1939_NO_NAME,
            addr: J1939_NO_ADDR,
            dst_name: J1939_NO_NAME,
            dst_addr: J1939_NO_ADDR,
            pgn,
            priority: J1939_NO_PRIO,
            data: data.to_vec(),
            stamp: 0,
        }
    }

    pub fn with_dst(mut self, name: u64, addr: u8) -> Self {
        self.dst_name = name;
        self.dst_addr = addr;
        self
    }

    pub fn with_src(mut self, name: u64, addr: u8) -> Self {
        self.name = name;
        self.addr = addr;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ifname(mut self, ifname: &str) -> Self {
        self.ifname = ifname.to_string();
        self
    }

    pub fn with_stamp(mut self, stamp: i64) -> Self {
        self.stamp = stamp;
        self
    }

    pub fn get_ifname(&self) -> &str {
        &self.ifname
    }

    pub fn get_name(&self) -> u64 {
        self.name
    }

    pub fn get_addr(&self) -> u8 {
        self.addr
    }

    pub fn get_dst_name(&self) -> u64 {
        self.dst_name
    }

    pub fn get_dst_addr(&self) -> u8 {
        self.dst_addr
    }

    pub fn get_pgn(&self) -> u32 {
        self.pgn
    }

    pub fn get_priority(&self) -> u8 {
        self.priority
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn get_len(&self) -> usize {
        self.data.len()
    }

    pub fn get_stamp(&self) -> i64 {
        self.stamp
    }

    pub fn get_source(&self) -> SockJ1939Addr {
        SockJ1939Addr::new(self.name, self.addr, self.pgn)
    }
}

impl fmt::Display for SockJ1939Msg {
    // stamp,ifname,name,addr,dst_name,dst_addr,pgn,len,priority,hexdata
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            format,
            "{},{},{:016x},{:02x},{:016x},{:02x},{:05x},{},{},",
            self.stamp,
            self.ifname,
            self.name,
            self.addr,
            self.dst_name,
            self.dst_addr,
            self.pgn,
            self.data.len(),
            self.priority
        )?;
        for byte in &self.data {
            write!(format, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// What one `recvmsg` returns: source address, payload and ancillary bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SockJ1939Wire {
    pub iface: i32,
    pub peer: SockJ1939Addr,
    pub data: Vec<u8>,
    /// byte count reported by the kernel, may exceed `data` on truncation
    pub count: usize,
    pub flags: CanRecvFlags,
    pub control: Vec<u8>,
}

fn copy_payload(data: &[u8], uid: &'static str) -> Result<Vec<u8>, CanError> {
    let mut payload = Vec::new();
    payload
        .try_reserve_exact(data.len())
        .map_err(|error| CanError::resource(uid, error.to_string()))?;
    payload.extend_from_slice(data);
    Ok(payload)
}

/// Reject an outgoing message the kernel would refuse, without copying it.
pub fn check_outgoing(msg: &SockJ1939Msg) -> Result<(), CanError> {
    if msg.data.len() > J1939_MAX_TP_PACKET_SIZE {
        return Err(CanError::invalid(
            "j1939-msg-oversize",
            format!("payload:{} exceeds max:{}", msg.data.len(), J1939_MAX_TP_PACKET_SIZE),
        ));
    }
    if !pgn_is_valid(msg.pgn) || !pgn_is_clean(msg.pgn) {
        return Err(CanError::invalid("j1939-msg-pgn", format!("invalid pgn:{:#x}", msg.pgn)));
    }
    if msg.priority != J1939_NO_PRIO && msg.priority > J1939_PRIO_MAX {
        return Err(CanError::invalid("j1939-msg-priority", format!("invalid priority:{}", msg.priority)));
    }
    Ok(())
}

/// Check an outgoing message and lay it out as the wire record the kernel
/// would hand back to the receiver: source as peer, destination and priority
/// as control items.
pub fn encode(msg: &SockJ1939Msg, iface: i32) -> Result<SockJ1939Wire, CanError> {
    check_outgoing(msg)?;

    let mut items = vec![SockJ1939Cmsg::DestAddr(msg.dst_addr)];
    if msg.dst_name != J1939_NO_NAME {
        items.push(SockJ1939Cmsg::DestName(msg.dst_name));
    }
    if msg.priority != J1939_NO_PRIO {
        items.push(SockJ1939Cmsg::Priority(msg.priority));
    }

    Ok(SockJ1939Wire {
        iface,
        peer: msg.get_source(),
        data: copy_payload(&msg.data, "j1939-msg-alloc")?,
        count: msg.data.len(),
        flags: CanRecvFlags::empty(),
        control: cmsg_build(&items)?,
    })
}

/// Turn one received wire record into a message, joining payload and
/// ancillary data from the same receive call.
pub fn decode(wire: &SockJ1939Wire, ifname: &str) -> Result<SockJ1939Msg, CanError> {
    if wire.flags.contains(CanRecvFlags::TRUNC) || wire.count > wire.data.len() {
        return Err(CanError::protocol(
            "j1939-recv-truncated",
            format!("received:{} buffer:{}", wire.count, wire.data.len()),
        ));
    }
    if wire.flags.contains(CanRecvFlags::CTRUNC) {
        return Err(CanError::protocol("j1939-cmsg-truncated", "control items truncated by kernel"));
    }

    let meta = SockJ1939Meta::fold(&cmsg_parse(&wire.control)?);

    Ok(SockJ1939Msg {
        ifname: ifname.to_string(),
        name: wire.peer.name,
        addr: wire.peer.addr,
        dst_name: meta.dst_name,
        dst_addr: meta.dst_addr,
        pgn: wire.peer.pgn,
        priority: meta.priority,
        data: copy_payload(&wire.data[..wire.count], "j1939-recv-alloc")?,
        stamp: meta.stamp,
    })
}
