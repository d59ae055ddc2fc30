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

//! The CRM daemon: a supervisory service owning the lifecycle of one
//! attached cellular modem and multiplexing access to it across local
//! client processes.
//!
//! The supervision engine is a single-threaded event loop
//! ([`manager`]) feeding two state machines: the client abstraction,
//! which folds every connected client's acquire/release/restart intent
//! into one coherent request stream, and the control FSM, which drives
//! the modem through boot, flash, configure, run, reset and shutdown,
//! delegating crash-prone steps to isolated worker processes.

extern crate byteorder;
extern crate crm_core;
extern crate crm_protocol as protocol;
extern crate libc;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate time;
extern crate toml;

pub mod config;
pub mod error;
pub mod manager;

pub use error::{Error, Result};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
