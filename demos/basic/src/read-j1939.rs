/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * Usage: j1939-read [--json] [candev] [pgn ...]
 *   j1939-read vcan0 0xFECA 0xFEE5
 *
 */

extern crate sockj1939;
use env_logger::Env;
use sockj1939::prelude::*;

fn parse_pgn(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hexa) => u32::from_str_radix(hexa, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|error| format!("invalid pgn:{text} {error}"))
}

fn main() -> Result<(), String> {
    // Initialize logging backend for the `log` facade (idempotent).
    let env = Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let json = match args.iter().position(|arg| arg == "--json") {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    };
    let candev = if args.is_empty() { "vcan0".to_string() } else { args.remove(0) };

    // bare listener, receives broadcast and anything addressed to us
    let sock = match SockCanHandle::open_j1939(candev.as_str(), SockJ1939Addr::any(), CanTimeStamp::CLASSIC) {
        Err(error) => return Err(format!("fail opening candev:{candev} {error}")),
        Ok(value) => value,
    };

    if !args.is_empty() {
        let mut filters = SockJ1939Filters::new();
        for arg in &args {
            filters.add_pgn(parse_pgn(arg)?);
        }
        match filters.apply(&sock) {
            Err(error) => return Err(format!("j1939-filter fail Error:{error}")),
            Ok(()) => log::info!("sockj1939 filter {} pgn(s) ready", filters.len()),
        }
    }

    log::info!("sockj1939 waiting for packet on {candev}");
    let mut count = 0;
    loop {
        match sock.wait_readable(5) {
            Ok(SockCanPoll::Timeout) => {
                log::debug!("sockj1939 idle");
                continue;
            }
            Ok(SockCanPoll::Ready) => {}
            Err(error) => return Err(format!("sockj1939 poll {error}")),
        }

        match sock.recv_j1939() {
            Ok(msg) => {
                count += 1;
                if json {
                    match serde_json::to_string(&msg) {
                        Ok(line) => println!("{line}"),
                        Err(error) => log::warn!("json encoding fail {error}"),
                    }
                } else {
                    println!("({:4}) {}", count, msg);
                }
            }
            // protocol errors only lose one message, keep listening
            Err(error) if error.get_kind() == CanErrorKind::Protocol => log::warn!("{error:?}"),
            Err(error) => return Err(format!("sockj1939 receive {error}")),
        }
    }
}
