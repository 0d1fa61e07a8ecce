/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
*/

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Error classes surfaced by every sockj1939 operation.
///
/// - `Resource`: descriptor or memory exhaustion, caller may back off and retry
/// - `InvalidArgument`: caller supplied data violates a precondition, never retry as is
/// - `Io`: the OS rejected an otherwise well formed request
/// - `Protocol`: wire data is internally inconsistent (partial transfer, bad option size, ...)
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanErrorKind {
    Resource,
    InvalidArgument,
    Io,
    Protocol,
}

impl fmt::Display for CanErrorKind {
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CanErrorKind::Resource => "resource",
            CanErrorKind::InvalidArgument => "invalid-argument",
            CanErrorKind::Io => "io",
            CanErrorKind::Protocol => "protocol",
        };
        format.pad(kind)
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, PartialEq, Eq)]
pub struct CanError {
    kind: CanErrorKind,
    uid: String,
    info: String,
}

pub trait MakeError<T> {
    fn make(kind: CanErrorKind, uid: &str, msg: T) -> CanError;
}

impl MakeError<&str> for CanError {
    fn make(kind: CanErrorKind, uid: &str, msg: &str) -> CanError {
        CanError { kind, uid: uid.to_string(), info: msg.to_string() }
    }
}

impl MakeError<String> for CanError {
    fn make(kind: CanErrorKind, uid: &str, msg: String) -> CanError {
        CanError { kind, uid: uid.to_string(), info: msg }
    }
}

impl MakeError<&io::Error> for CanError {
    fn make(kind: CanErrorKind, uid: &str, msg: &io::Error) -> CanError {
        CanError { kind, uid: uid.to_string(), info: msg.to_string() }
    }
}

impl CanError {
    pub fn new<T>(kind: CanErrorKind, uid: &str, msg: T) -> CanError
    where
        CanError: MakeError<T>,
    {
        Self::make(kind, uid, msg)
    }

    pub fn resource<T>(uid: &str, msg: T) -> CanError
    where
        CanError: MakeError<T>,
    {
        Self::make(CanErrorKind::Resource, uid, msg)
    }

    pub fn invalid<T>(uid: &str, msg: T) -> CanError
    where
        CanError: MakeError<T>,
    {
        Self::make(CanErrorKind::InvalidArgument, uid, msg)
    }

    pub fn io<T>(uid: &str, msg: T) -> CanError
    where
        CanError: MakeError<T>,
    {
        Self::make(CanErrorKind::Io, uid, msg)
    }

    pub fn protocol<T>(uid: &str, msg: T) -> CanError
    where
        CanError: MakeError<T>,
    {
        Self::make(CanErrorKind::Protocol, uid, msg)
    }

    #[must_use]
    pub fn get_kind(&self) -> CanErrorKind {
        self.kind
    }

    #[must_use]
    pub fn get_uid(&self) -> String {
        self.uid.clone()
    }

    #[must_use]
    pub fn get_info(&self) -> String {
        self.info.clone()
    }
}

impl fmt::Display for CanError {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        write!(format, "uid:{} info:{}", self.uid, self.info)
    }
}

impl fmt::Debug for CanError {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        write!(format, "[{}] uid:{} info:{}", self.kind, self.uid, self.info)
    }
}

impl std::error::Error for CanError {}
