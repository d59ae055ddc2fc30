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

//! Stub HAL: a thread simulating a flashless modem, used on hosts
//! without hardware and by the integration tests. Faults (crash,
//! link loss, unresponsiveness, boot refusal) are injectable through
//! the handle returned at creation.

use std::os::unix::io::RawFd;

use libc;

use crm_core::ipc::{Channel, Msg};
use crm_core::thread::WorkerThread;

use config::Config;
use error::Result;
use manager::control::ResetType;
use manager::hal::{Hal, HalEvent, HalEventKind};

const CMD_POWER_ON: i64 = 1;
const CMD_BOOT: i64 = 2;
const CMD_RESET_WARM: i64 = 3;
const CMD_RESET_COLD: i64 = 4;
const CMD_RESET_BACKUP: i64 = 5;
const CMD_SHUTDOWN: i64 = 6;

const INJECT_CRASH: i64 = 10;
const INJECT_LINK_DOWN: i64 = 11;
const INJECT_UNRESPONSIVE: i64 = 12;
const INJECT_REFUSE_BOOT: i64 = 13;

const EVT_OFF: i64 = 1;
const EVT_FLASH_READY: i64 = 2;
const EVT_RUN: i64 = 3;
const EVT_CRASH: i64 = 4;
const EVT_DUMP_READY: i64 = 5;
const EVT_LINK_DOWN: i64 = 6;
const EVT_UNRESPONSIVE: i64 = 7;

pub struct StubHal {
    thread: Option<WorkerThread>,
}

/// Fault-injection handle for tests.
#[derive(Clone)]
pub struct StubHandle {
    tx: Channel,
}

impl StubHandle {
    pub fn inject_crash(&self) {
        self.tx.send(Msg::scalar(INJECT_CRASH)).ok();
    }

    pub fn inject_link_down(&self) {
        self.tx.send(Msg::scalar(INJECT_LINK_DOWN)).ok();
    }

    pub fn inject_unresponsive(&self) {
        self.tx.send(Msg::scalar(INJECT_UNRESPONSIVE)).ok();
    }

    /// The next power-on or cold reset produces no flash-ready event.
    pub fn inject_refuse_boot(&self) {
        self.tx.send(Msg::scalar(INJECT_REFUSE_BOOT)).ok();
    }
}

impl StubHal {
    pub fn new(config: &Config) -> Result<(StubHal, StubHandle)> {
        let flash_nodes = config.node.flash.to_string_lossy().into_owned();
        let dump_nodes = config.node.dump.to_string_lossy().into_owned();
        let thread = WorkerThread::spawn("hal-stub", move |rx, tx| {
            modem_loop(rx, tx, flash_nodes, dump_nodes)
        })?;
        let handle = StubHandle {
            tx: thread_sender(&thread),
        };
        Ok((StubHal { thread: Some(thread) }, handle))
    }

    fn send(&self, cmd: i64) -> Result<()> {
        match self.thread {
            Some(ref thread) => thread.send(Msg::scalar(cmd)).map_err(From::from),
            None => Ok(()),
        }
    }
}

// The handle needs its own sender clone; WorkerThread only exposes the
// parent-side pair, so the command channel is threaded back out here.
fn thread_sender(thread: &WorkerThread) -> Channel {
    thread.sender()
}

impl Hal for StubHal {
    fn power_on(&self) -> Result<()> {
        self.send(CMD_POWER_ON)
    }

    fn boot(&self) -> Result<()> {
        self.send(CMD_BOOT)
    }

    fn reset(&self, kind: ResetType) -> Result<()> {
        let cmd = match kind {
            ResetType::Warm => CMD_RESET_WARM,
            ResetType::Cold => CMD_RESET_COLD,
            ResetType::Backup => CMD_RESET_BACKUP,
        };
        self.send(cmd)
    }

    fn shutdown(&self) -> Result<()> {
        self.send(CMD_SHUTDOWN)
    }

    fn poll_fd(&self) -> RawFd {
        self.thread.as_ref().map(|t| t.poll_fd()).unwrap_or(-1)
    }

    fn try_event(&self) -> Option<HalEvent> {
        let msg = match self.thread {
            Some(ref thread) => thread.try_get()?,
            None => return None,
        };
        let kind = match msg.scalar {
            EVT_OFF => HalEventKind::Off,
            EVT_FLASH_READY => HalEventKind::FlashReady,
            EVT_RUN => HalEventKind::Run,
            EVT_CRASH => HalEventKind::Crash,
            EVT_DUMP_READY => HalEventKind::DumpReady,
            EVT_LINK_DOWN => HalEventKind::LinkDown,
            EVT_UNRESPONSIVE => HalEventKind::Unresponsive,
            other => {
                warn!("unknown stub modem event {}", other);
                return None;
            }
        };
        let nodes = msg
            .data
            .map(|data| String::from_utf8_lossy(&data).into_owned())
            .unwrap_or_default();
        Some(HalEvent {
            kind: kind,
            nodes: nodes,
            debug: None,
        })
    }

    fn dispose(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.dispose();
        }
    }
}

fn emit(tx: &Channel, kind: i64, nodes: &str) {
    let msg = if nodes.is_empty() {
        Msg::scalar(kind)
    } else {
        Msg::with_data(kind, nodes.as_bytes().to_vec())
    };
    tx.send(msg).ok();
}

/// The simulated modem. Powered off until told otherwise; flashless,
/// so every boot goes through a flash-ready phase.
fn modem_loop(rx: Channel, tx: Channel, flash_nodes: String, dump_nodes: String) {
    let mut running = false;
    let mut refuse_boot = false;
    loop {
        let mut pfd = libc::pollfd {
            fd: rx.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, -1) } < 0 {
            break;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            break;
        }
        let msg = match rx.try_get() {
            Some(msg) => msg,
            None => continue,
        };
        match msg.scalar {
            CMD_POWER_ON => {
                running = false;
                if refuse_boot {
                    refuse_boot = false;
                } else {
                    emit(&tx, EVT_FLASH_READY, &flash_nodes);
                }
            }
            CMD_BOOT => {
                running = true;
                emit(&tx, EVT_RUN, "");
            }
            CMD_RESET_COLD | CMD_RESET_BACKUP => {
                running = false;
                emit(&tx, EVT_LINK_DOWN, "");
                if refuse_boot {
                    refuse_boot = false;
                } else {
                    emit(&tx, EVT_FLASH_READY, &flash_nodes);
                }
            }
            CMD_RESET_WARM => {
                running = false;
                emit(&tx, EVT_FLASH_READY, &dump_nodes);
            }
            CMD_SHUTDOWN => {
                running = false;
                emit(&tx, EVT_LINK_DOWN, "");
                emit(&tx, EVT_OFF, "");
            }
            INJECT_CRASH => {
                if running {
                    running = false;
                    emit(&tx, EVT_CRASH, "");
                    emit(&tx, EVT_DUMP_READY, &dump_nodes);
                }
            }
            INJECT_LINK_DOWN => {
                emit(&tx, EVT_LINK_DOWN, "");
            }
            INJECT_UNRESPONSIVE => {
                running = false;
                emit(&tx, EVT_UNRESPONSIVE, "");
            }
            INJECT_REFUSE_BOOT => {
                refuse_boot = true;
            }
            other => warn!("stub modem ignoring command {}", other),
        }
    }
}
