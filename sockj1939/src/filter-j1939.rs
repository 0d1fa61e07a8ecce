/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/j1939.html#api-calls (SO_J1939_FILTER)
 *    https://github.com/linux-can/can-utils/blob/master/testj1939.c
 *
*/

use super::cglue;
use crate::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One J1939 receive rule. A message is matched when for every field
/// `(incoming & mask) == (rule & mask)`; a zero mask means "don't care",
/// `!0` means exact match.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockJ1939Filter {
    pub name: u64,
    pub name_mask: u64,
    pub addr: u8,
    pub addr_mask: u8,
    pub pgn: u32,
    pub pgn_mask: u32,
}

impl SockJ1939Filter {
    /// rule with every mask cleared, matches anything
    pub fn new() -> Self {
        SockJ1939Filter::default()
    }

    pub fn set_name(mut self, name: u64, mask: u64) -> Self {
        self.name = name;
        self.name_mask = mask;
        self
    }

    pub fn set_addr(mut self, addr: u8, mask: u8) -> Self {
        self.addr = addr;
        self.addr_mask = mask;
        self
    }

    pub fn set_pgn(mut self, pgn: u32, mask: u32) -> Self {
        self.pgn = pgn;
        self.pgn_mask = mask;
        self
    }

    pub fn matches(&self, source: &SockJ1939Addr) -> bool {
        (source.name & self.name_mask) == (self.name & self.name_mask)
            && (source.addr & self.addr_mask) == (self.addr & self.addr_mask)
            && (source.pgn & self.pgn_mask) == (self.pgn & self.pgn_mask)
    }

    fn as_raw(&self) -> cglue::j1939_filter {
        cglue::j1939_filter {
            name: self.name,
            name_mask: self.name_mask,
            pgn: self.pgn,
            pgn_mask: self.pgn_mask,
            addr: self.addr,
            addr_mask: self.addr_mask,
        }
    }
}

/// Ordered rule set installed on a J1939 socket in one set-replace call.
/// An empty table accepts nothing.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SockJ1939Filters {
    filters: Vec<SockJ1939Filter>,
}

impl SockJ1939Filters {
    pub fn new() -> Self {
        SockJ1939Filters { filters: Vec::new() }
    }

    pub fn add(&mut self, filter: SockJ1939Filter) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn add_pgn(&mut self, pgn: u32) -> &mut Self {
        self.add(SockJ1939Filter::new().set_pgn(pgn, !0))
    }

    pub fn add_name(&mut self, name: u64) -> &mut Self {
        self.add(SockJ1939Filter::new().set_name(name, !0))
    }

    pub fn add_addr(&mut self, addr: u8) -> &mut Self {
        self.add(SockJ1939Filter::new().set_addr(addr, !0))
    }

    pub fn get_filters(&self) -> &[SockJ1939Filter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Same decision the kernel takes for an incoming message source.
    pub fn matches(&self, source: &SockJ1939Addr) -> bool {
        self.filters.iter().any(|filter| filter.matches(source))
    }

    /// Replace the socket's whole filter set.
    pub fn apply(&self, sock: &SockCanHandle) -> Result<(), CanError> {
        if sock.get_mode() != SockCanMod::J1939 {
            return Err(CanError::invalid("invalid-socketcan-mod", "not a J1939 socket can"));
        }

        if self.filters.len() > J1939_FILTER_MAX {
            return Err(CanError::resource(
                "j1939-filter-number",
                format!("too many j1939 filters:{} max:{}", self.filters.len(), J1939_FILTER_MAX),
            ));
        }

        for filter in &self.filters {
            if filter.pgn & filter.pgn_mask > J1939_PGN_MAX {
                return Err(CanError::invalid(
                    "j1939-filter-pgn",
                    format!("pgn:{:#x} out of range", filter.pgn),
                ));
            }
        }

        let mut rules: Vec<cglue::j1939_filter> = Vec::new();
        rules
            .try_reserve_exact(self.filters.len().max(1))
            .map_err(|error| CanError::resource("j1939-filter-alloc", error.to_string()))?;

        if self.filters.is_empty() {
            // the kernel reads an empty list as "accept all", install one rule
            // no valid 18 bit pgn can match
            rules.push(cglue::j1939_filter {
                pgn: J1939_NO_PGN,
                pgn_mask: !0,
                ..Default::default()
            });
        } else {
            rules.extend(self.filters.iter().map(SockJ1939Filter::as_raw));
        }

        let buffer = cglue::j1939_filter::to_bytes(&rules)
            .map_err(|error| CanError::resource("j1939-filter-alloc", error.to_string()))?;

        let sockfd = sock.get_fd()?;
        sock.sys()
            .setsockopt(
                sockfd,
                cglue::can_J1939_x_SOL_CAN_J1939,
                cglue::can_J1939_x_SO_FILTER,
                &buffer,
            )
            .map_err(|error| CanError::io("fail-j1939-filter", &error))?;

        log::debug!("sockj1939 fd:{} installed {} filter(s)", sockfd, self.filters.len());
        Ok(())
    }
}
