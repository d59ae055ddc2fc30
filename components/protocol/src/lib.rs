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

//! Wire protocol between the CRM daemon and its clients.
//!
//! Every message is framed `{u32 id, u32 total_length, payload...}` in
//! network byte order, `total_length` covering the 8-byte header.
//! Strings are `{u32 length, raw bytes}` without a NUL terminator.
//! Byte-for-byte compatibility with deployed clients is part of this
//! crate's contract; the framing never changes shape.

#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate crm_core;

pub mod error;
pub mod message;
pub mod wire;

pub use error::{Error, Result};
pub use message::{DbgInfo, DbgType, EventKind, Events, Message, RestartCause};

/// Name of the client socket for a CRM instance.
pub fn socket_name(instance: u32) -> String {
    format!("crm{}", instance)
}
