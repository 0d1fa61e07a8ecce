/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
*/

// Scripted SockCanSys used by unit tests, records every call it receives.

use crate::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

// kernel default for SO_J1939_SEND_PRIO
const MOCK_SEND_PRIO: i32 = 6;
// unscripted polls wait at most this long before reporting a timeout
const MOCK_POLL_MS: u64 = 5;

pub struct MockRecv {
    pub data: Vec<u8>,
    pub count: usize,
    pub control: Vec<u8>,
    pub flags: c_int,
    pub addr: CanSockAddr,
}

impl MockRecv {
    pub fn new(addr: CanSockAddr, data: &[u8], control: Vec<u8>) -> Self {
        MockRecv { data: data.to_vec(), count: data.len(), control, flags: 0, addr }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    next_fd: RawFd,
    ifaces: Vec<(u32, String)>,
    failures: HashMap<&'static str, i32>,
    options: HashMap<(c_int, c_int), Vec<u8>>,
    recv: VecDeque<MockRecv>,
    polls: VecDeque<i16>,
    sent: Vec<(Vec<u8>, CanSockAddr)>,
    sent_prio: Vec<Option<i32>>,
    bound: Vec<CanSockAddr>,
    send_count: Option<usize>,
}

pub struct MockCan {
    state: Mutex<MockState>,
}

impl MockCan {
    pub fn new() -> Arc<Self> {
        let mut state = MockState { next_fd: 10, ..Default::default() };
        state.options.insert((107, 3), MOCK_SEND_PRIO.to_ne_bytes().to_vec());
        Arc::new(MockCan { state: Mutex::new(state) })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_iface(&self, index: u32, ifname: &str) {
        self.state().ifaces.push((index, ifname.to_string()));
    }

    /// Make every later call to `op` fail with `errno`.
    pub fn fail(&self, op: &'static str, errno: i32) {
        self.state().failures.insert(op, errno);
    }

    pub fn set_raw_option(&self, level: c_int, name: c_int, value: &[u8]) {
        self.state().options.insert((level, name), value.to_vec());
    }

    pub fn raw_option(&self, level: c_int, name: c_int) -> Option<Vec<u8>> {
        self.state().options.get(&(level, name)).cloned()
    }

    pub fn push_recv(&self, recv: MockRecv) {
        self.state().recv.push_back(recv);
    }

    pub fn push_poll(&self, revents: i16) {
        self.state().polls.push_back(revents);
    }

    pub fn set_send_count(&self, count: usize) {
        self.state().send_count = Some(count);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|call| call.as_str() == op).count()
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, CanSockAddr)> {
        self.state().sent.clone()
    }

    /// SO_J1939_SEND_PRIO in effect at each sendto
    pub fn sent_prio(&self) -> Vec<Option<i32>> {
        self.state().sent_prio.clone()
    }

    pub fn bound(&self) -> Vec<CanSockAddr> {
        self.state().bound.clone()
    }

    fn enter(&self, op: &'static str) -> io::Result<MutexGuard<'_, MockState>> {
        let mut state = self.state();
        state.calls.push(op.to_string());
        let failure = state.failures.get(op).copied();
        match failure {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(state),
        }
    }
}

impl SockCanSys for MockCan {
    fn socket(&self, _family: c_int, _kind: c_int, _proto: c_int) -> io::Result<RawFd> {
        let mut state = self.enter("socket")?;
        state.next_fd += 1;
        Ok(state.next_fd)
    }

    fn bind(&self, _sockfd: RawFd, addr: &CanSockAddr) -> io::Result<()> {
        let mut state = self.enter("bind")?;
        if !state.bound.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.bound.push(*addr);
        Ok(())
    }

    fn connect(&self, _sockfd: RawFd, addr: &CanSockAddr) -> io::Result<()> {
        let mut state = self.enter("connect")?;
        state.bound.push(*addr);
        Ok(())
    }

    fn close(&self, _sockfd: RawFd) -> io::Result<()> {
        self.enter("close")?;
        Ok(())
    }

    fn sendto(&self, _sockfd: RawFd, data: &[u8], addr: &CanSockAddr) -> io::Result<usize> {
        let mut state = self.enter("sendto")?;
        let prio: Option<[u8; 4]> = state.options.get(&(107, 3)).and_then(|value| value.as_slice().try_into().ok());
        state.sent_prio.push(prio.map(i32::from_ne_bytes));
        state.sent.push((data.to_vec(), *addr));
        Ok(state.send_count.unwrap_or(data.len()))
    }

    fn recvmsg(&self, _sockfd: RawFd, data: &mut [u8], control: &mut [u8]) -> io::Result<CanRecvInfo> {
        let mut state = self.enter("recvmsg")?;
        let recv = match state.recv.pop_front() {
            Some(recv) => recv,
            None => return Err(io::Error::from_raw_os_error(libc::EAGAIN)),
        };
        let copied = recv.data.len().min(data.len());
        data[..copied].copy_from_slice(&recv.data[..copied]);
        let ctrl_len = recv.control.len().min(control.len());
        control[..ctrl_len].copy_from_slice(&recv.control[..ctrl_len]);
        Ok(CanRecvInfo { count: recv.count, flags: recv.flags, ctrl_len, addr: recv.addr })
    }

    fn setsockopt(&self, _sockfd: RawFd, level: c_int, name: c_int, value: &[u8]) -> io::Result<()> {
        let mut state = self.enter("setsockopt")?;
        state.options.insert((level, name), value.to_vec());
        Ok(())
    }

    fn getsockopt(&self, _sockfd: RawFd, level: c_int, name: c_int, value: &mut [u8]) -> io::Result<usize> {
        let state = self.enter("getsockopt")?;
        match state.options.get(&(level, name)) {
            Some(option) => {
                let count = option.len().min(value.len());
                value[..count].copy_from_slice(&option[..count]);
                Ok(count)
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT)),
        }
    }

    fn nametoindex(&self, ifname: &CStr) -> io::Result<u32> {
        let state = self.enter("nametoindex")?;
        let ifname = ifname.to_string_lossy();
        state
            .ifaces
            .iter()
            .find(|(_, name)| *name == ifname)
            .map(|(index, _)| *index)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
    }

    fn indextoname(&self, iface: u32) -> io::Result<String> {
        let state = self.enter("indextoname")?;
        state
            .ifaces
            .iter()
            .find(|(index, _)| *index == iface)
            .map(|(_, name)| name.clone())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENXIO))
    }

    fn poll(&self, _sockfd: RawFd, _events: i16, timeout_ms: c_int) -> io::Result<i16> {
        let mut state = self.enter("poll")?;
        if let Some(revents) = state.polls.pop_front() {
            return Ok(revents);
        }
        if !state.recv.is_empty() {
            return Ok(libc::POLLIN);
        }
        drop(state);
        let wait = (timeout_ms.max(0) as u64).min(MOCK_POLL_MS);
        thread::sleep(Duration::from_millis(wait));
        Ok(0)
    }
}
