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

//! Hardware abstraction seam.
//!
//! The control machine only knows "power / boot / reset / shutdown"
//! plus an asynchronous event stream; everything device-specific lives
//! behind this trait. Variants come from a closed registry selected by
//! configuration; there is no runtime plugin loading.

pub mod stub;

use std::os::unix::io::RawFd;

use protocol::DbgInfo;

use config::Config;
use error::{Error, Result};
use manager::control::ResetType;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HalEventKind {
    Off,
    FlashReady,
    Run,
    Crash,
    DumpReady,
    LinkDown,
    Unresponsive,
}

/// One event from the modem. `nodes` carries the device nodes usable
/// for the announced condition (flash port, dump port), `;`-separated.
#[derive(Clone, Debug)]
pub struct HalEvent {
    pub kind: HalEventKind,
    pub nodes: String,
    pub debug: Option<DbgInfo>,
}

pub trait Hal: Send {
    /// Power the modem on. Asynchronous: the outcome arrives as
    /// events.
    fn power_on(&self) -> Result<()>;

    /// Boot the modem out of its flash-ready state.
    fn boot(&self) -> Result<()>;

    fn reset(&self, kind: ResetType) -> Result<()>;

    /// Shut the modem down for good.
    fn shutdown(&self) -> Result<()>;

    /// Readiness fd for the event stream.
    fn poll_fd(&self) -> RawFd;

    /// Fetch at most one pending event.
    fn try_event(&self) -> Option<HalEvent>;

    /// Hangup-signalling fd of the MUX line, when the variant has one.
    fn mux_fd(&self) -> Option<RawFd> {
        None
    }

    fn dispose(&mut self);
}

/// Closed variant registry.
pub fn init(config: &Config) -> Result<Box<Hal>> {
    match config.hal.variant.as_str() {
        "stub" => {
            let (hal, _) = stub::StubHal::new(config)?;
            Ok(Box::new(hal))
        }
        other => Err(Error::UnknownHal(other.to_string())),
    }
}
