/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
*/

#![doc(
    html_logo_url = "https://iot.bzh/images/defaults/company/512-479-max-transp.png",
    html_favicon_url = "https://iot.bzh/images/defaults/favicon.ico"
)]
extern crate bitflags;

#[cfg(feature = "serde")]
extern crate serde;

#[path = "./cglue-mod.rs"]
mod cglue;

#[path = "./utils-mod.rs"]
mod utils;

#[path = "./syscall-mod.rs"]
mod syscall;

#[path = "./socket-can.rs"]
mod sockcan;

#[path = "./iface-mod.rs"]
mod iface;

#[path = "./option-mod.rs"]
mod sockopt;

#[path = "./filter-j1939.rs"]
mod filter;

#[path = "./codec-j1939.rs"]
mod codec;

#[path = "./socket-j1939.rs"]
mod sockj1939;

#[cfg(test)]
#[path = "./sysmock-mod.rs"]
mod sysmock;

pub mod prelude {
    pub use crate::codec::*;
    pub use crate::filter::*;
    pub use crate::iface::*;
    pub use crate::sockcan::*;
    pub use crate::sockj1939::*;
    pub use crate::sockopt::*;
    pub use crate::syscall::*;
    pub use crate::utils::*;
}
