// Copyright (c) 2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::error;
use std::fmt;
use std::result;

use crm_core;

#[derive(Debug)]
pub enum Error {
    /// Total length field below the header size or above the protocol
    /// maximum.
    BadLength(u32),
    /// Message id that exists in neither direction.
    BadId(u32),
    /// Subscription bitmap with bits for events that do not exist.
    BadBitmap(u32),
    /// String length inconsistent with the remaining payload or above
    /// its bound.
    BadString,
    /// Debug info carries more strings than the protocol allows.
    TooManyStrings(u32),
    /// Payload bytes left over after a complete message.
    TrailingData,
    UnknownDbgType(u32),
    UnknownCause(u32),
    /// Attempt to send a message against its allowed direction.
    Direction(u32),
    Io(crm_core::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::BadLength(len) => write!(f, "bad message size ({})", len),
            Error::BadId(id) => write!(f, "unknown message id ({})", id),
            Error::BadBitmap(bits) => write!(f, "invalid events bitmap (0x{:08x})", bits),
            Error::BadString => write!(f, "malformed string in message"),
            Error::TooManyStrings(nb) => write!(f, "too many debug data strings ({})", nb),
            Error::TrailingData => write!(f, "extra data at end of message"),
            Error::UnknownDbgType(v) => write!(f, "unknown debug info type ({})", v),
            Error::UnknownCause(v) => write!(f, "unknown restart cause ({})", v),
            Error::Direction(id) => write!(f, "message id {} not valid for this direction", id),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::BadLength(_) => "bad message size",
            Error::BadId(_) => "unknown message id",
            Error::BadBitmap(_) => "invalid events bitmap",
            Error::BadString => "malformed string in message",
            Error::TooManyStrings(_) => "too many debug data strings",
            Error::TrailingData => "extra data at end of message",
            Error::UnknownDbgType(_) => "unknown debug info type",
            Error::UnknownCause(_) => "unknown restart cause",
            Error::Direction(_) => "message not valid for this direction",
            Error::Io(_) => "socket I/O error",
        }
    }
}

impl From<crm_core::Error> for Error {
    fn from(err: crm_core::Error) -> Error {
        Error::Io(err)
    }
}
