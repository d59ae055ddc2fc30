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

//! Modem configuration task: ping the modem until it answers, mount
//! the MUX line, AT-probe the first DLC. Blocking work, so it runs on
//! its own thread and posts a single completion message.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use libc;

use crm_core::at;
use crm_core::ipc::{Channel, Msg};
use crm_core::thread::WorkerThread;

use config::Config;
use error::Result;
use manager::workers::{MSG_CFG_DONE, MSG_CFG_FAILED};

const PING_ATTEMPTS: usize = 5;
const PING_TIMEOUT_MS: i64 = 1000;

pub fn spawn(config: &Config) -> Result<WorkerThread> {
    let at_probe = config.hal.at_probe;
    let ping_node = config.node.ping.clone();
    let mux_node = config.node.mux.clone();
    let thread = WorkerThread::spawn("mdm-configure", move |rx, tx| {
        let ok = if at_probe {
            configure(&ping_node, &mux_node, &rx)
        } else {
            // Stub modems have no AT endpoint; they are configured by
            // construction.
            true
        };
        let scalar = if ok { MSG_CFG_DONE } else { MSG_CFG_FAILED };
        tx.send(Msg::scalar(scalar)).ok();
    })?;
    Ok(thread)
}

fn configure(ping_node: &PathBuf, mux_node: &PathBuf, rx: &Channel) -> bool {
    if !ping(ping_node, rx) {
        return false;
    }
    // Mounting the MUX is the line-discipline setup on the modem tty;
    // the AT probe on the first DLC confirms it carries commands.
    let mux = match OpenOptions::new().read(true).write(true).open(mux_node) {
        Ok(mux) => mux,
        Err(err) => {
            error!("unable to open MUX node {}: {}", mux_node.display(), err);
            return false;
        }
    };
    at::send(mux.as_raw_fd(), "AT", PING_TIMEOUT_MS).is_ok()
}

fn ping(node: &PathBuf, rx: &Channel) -> bool {
    for _ in 0..PING_ATTEMPTS {
        if aborted(rx) {
            return false;
        }
        let tty = match OpenOptions::new().read(true).write(true).open(node) {
            Ok(tty) => tty,
            Err(_) => continue,
        };
        if at::send(tty.as_raw_fd(), "AT", PING_TIMEOUT_MS).is_ok() {
            return true;
        }
    }
    error!("modem did not answer ping on {}", node.display());
    false
}

fn aborted(rx: &Channel) -> bool {
    let mut pfd = libc::pollfd {
        fd: rx.poll_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut pfd, 1, 0) } <= 0 {
        return false;
    }
    pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}
