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

//! NVM synchronization lifecycle.
//!
//! The calibration sync helper is an external service; this task
//! starts and stops it through the service-control properties and
//! reports the transitions back to the control machine. Stopping
//! always flushes: the historical prepare-for-reset / prepare-for-
//! shutdown split collapsed into the single flush performed by the
//! sync helper on a stop request.
//!
//! The calibration *backup* is not done here: the control machine owns
//! the copy so that exactly one writer ever touches the file.

use std::fs;
use std::path::PathBuf;

use libc;

use crm_core::ipc::{Channel, Msg};
use crm_core::property;
use crm_core::thread::WorkerThread;

use config::Config;
use error::Result;
use manager::workers::{CMD_NVM_START, CMD_NVM_STOP, MSG_NVM_RUNNING, MSG_NVM_STOPPED};

const SERVICE_KEY: &'static str = "crm.service.nvm_server";

pub fn spawn(config: &Config) -> Result<WorkerThread> {
    let folder = config.nvm.folder.clone();
    let thread = WorkerThread::spawn("mdm-nvm", move |rx, tx| nvm_loop(rx, tx, folder))?;
    Ok(thread)
}

fn nvm_loop(rx: Channel, tx: Channel, folder: PathBuf) {
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
            None => break,
        };
        match msg.scalar {
            CMD_NVM_START => {
                if let Err(err) = fs::create_dir_all(&folder) {
                    warn!("unable to create NVM folder {}: {}", folder.display(), err);
                }
                property::set(SERVICE_KEY, "start");
                tx.send(Msg::scalar(MSG_NVM_RUNNING)).ok();
            }
            CMD_NVM_STOP => {
                // Flush happens inside the sync helper on stop.
                property::set(SERVICE_KEY, "stop");
                tx.send(Msg::scalar(MSG_NVM_STOPPED)).ok();
            }
            other => warn!("NVM task ignoring command {}", other),
        }
    }
}
