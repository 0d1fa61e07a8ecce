/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
*/

use super::cglue;
use crate::prelude::*;
use std::ffi::CString;

/// longest interface name accepted by the kernel (IFNAMSIZ minus the trailing NUL)
pub const CAN_IFACE_NAME_MAX: usize = cglue::can_SOCK_x_IFACE_LEN - 1;

impl SockCanHandle {
    /// Resolve an interface name to its kernel index.
    pub fn index_of(&self, ifname: &str) -> Result<i32, CanError> {
        if ifname.len() > CAN_IFACE_NAME_MAX {
            return Err(CanError::invalid(
                "can-ifname-too-long",
                format!("iface:{} longer than {} bytes", ifname, CAN_IFACE_NAME_MAX),
            ));
        }
        let cname = CString::new(ifname)
            .map_err(|_| CanError::invalid("can-ifname-invalid", "interface name holds a NUL byte"))?;
        self.get_fd()?;

        let index = self
            .sys()
            .nametoindex(&cname)
            .map_err(|error| CanError::io("can-ifindex-fail", format!("iface:{ifname} {error}")))?;

        i32::try_from(index)
            .map_err(|_| CanError::io("can-ifindex-fail", format!("iface:{ifname} index:{index} out of range")))
    }

    /// Resolve a kernel interface index back to its name.
    pub fn name_of(&self, iface: i32) -> Result<String, CanError> {
        let index = u32::try_from(iface)
            .map_err(|_| CanError::invalid("can-ifname-fail", format!("negative interface index:{iface}")))?;
        self.get_fd()?;

        self.sys()
            .indextoname(index)
            .map_err(|error| CanError::io("can-ifname-fail", format!("index:{iface} {error}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysmock::MockCan;

    #[test]
    fn name_index_round_trip() {
        let sys = MockCan::new();
        sys.add_iface(3, "vcan0");
        sys.add_iface(5, "can-0123456789a");
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();

        for ifname in ["vcan0", "can-0123456789a"] {
            let index = sock.index_of(ifname).unwrap();
            assert_eq!(sock.name_of(index).unwrap(), ifname);
        }
    }

    #[test]
    fn oversize_name_fails_before_os() {
        let sys = MockCan::new();
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        let before = sys.calls().len();

        let error = sock.index_of("0123456789abcdef").unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        assert_eq!(sys.calls().len(), before);
    }

    #[test]
    fn embedded_nul_is_invalid() {
        let sys = MockCan::new();
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();
        let error = sock.index_of("can\0").unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::InvalidArgument);
        assert_eq!(sys.count("nametoindex"), 0);
    }

    #[test]
    fn unknown_name_or_index_is_io_error() {
        let sys = MockCan::new();
        let sock = SockCanHandle::open_with(sys.clone(), SockCanMod::J1939).unwrap();

        let error = sock.index_of("can9").unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Io);
        assert!(error.get_info().starts_with("iface:can9"));

        let error = sock.name_of(42).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::Io);
    }
}
