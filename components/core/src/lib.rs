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

//! OS substrate shared by the CRM daemon and its client library.
//!
//! Everything in here wraps a raw POSIX contract (pipes, fork, poll,
//! unix sockets) behind a typed API. Nothing in this crate knows about
//! the modem; the daemon composes these pieces into its supervision
//! engine.

#[macro_use]
extern crate lazy_static;
extern crate libc;
#[macro_use]
extern crate log;
extern crate time;

pub mod at;
pub mod error;
pub mod factory;
pub mod file;
pub mod ipc;
pub mod property;
pub mod socket;
pub mod thread;

pub use error::{Error, Result};
