/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * Usage: j1939-send candev src-addr pgn hexdata [dst-addr]
 *   j1939-send vcan0 0x20 0xFECA 0102030405060708090a
 *
 */

extern crate sockj1939;
use env_logger::Env;
use sockj1939::prelude::*;

fn parse_num(text: &str, what: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hexa) => u32::from_str_radix(hexa, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|error| format!("invalid {what}:{text} {error}"))
}

fn parse_addr(text: &str) -> Result<u8, String> {
    let value = parse_num(text, "addr")?;
    u8::try_from(value).map_err(|_| format!("addr:{text} out of range"))
}

fn parse_hexa(text: &str) -> Result<Vec<u8>, String> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(format!("hexdata:{text} not an even count of hex digits"));
    }
    (0..text.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&text[index..index + 2], 16).map_err(|error| format!("hexdata:{text} {error}"))
        })
        .collect()
}

fn main() -> Result<(), String> {
    let env = Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        return Err("usage: j1939-send candev src-addr pgn hexdata [dst-addr]".to_string());
    }
    let candev = args[0].as_str();
    let src_addr = parse_addr(&args[1])?;
    let pgn = parse_num(&args[2], "pgn")?;
    let data = parse_hexa(&args[3])?;
    let dst_addr = match args.get(4) {
        Some(text) => parse_addr(text)?,
        None => J1939_NO_ADDR,
    };

    let sock = match SockCanHandle::open_j1939(
        candev,
        SockJ1939Addr::new(J1939_NO_NAME, src_addr, J1939_NO_PGN),
        CanTimeStamp::NONE,
    ) {
        Err(error) => return Err(format!("fail opening candev:{candev} {error}")),
        Ok(value) => value,
    };

    let msg = SockJ1939Msg::new(pgn, &data).with_dst(J1939_NO_NAME, dst_addr);
    match sock.send_j1939(&msg) {
        Err(error) => return Err(format!("sockj1939 send {error}")),
        Ok(()) => log::info!("sockj1939 sent pgn:{:#x} len:{} to addr:{:#x}", pgn, data.len(), dst_addr),
    }

    sock.close().map_err(|error| format!("sockj1939 close {error}"))
}
