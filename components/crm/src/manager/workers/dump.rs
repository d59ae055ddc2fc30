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

//! Core dump retrieval worker.
//!
//! Runs in its own process and streams the post-crash memory snapshot
//! from the dump node to disk. The parent learns about completion via
//! one final status message; killing the worker (pipe hangup) aborts
//! the read promptly.
//!
//! Init payload: `<dump_nodes>\n<output_dir>` (the node list itself
//! is `;`-separated).

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crm_core::ipc::{Channel, Msg};

use manager::workers::{MSG_DUMP_DONE, MSG_DUMP_FAILED};

const CHUNK: usize = 16 * 1024;

pub fn worker_main(ipc_in: &Channel, ipc_out: &Channel, init: &[u8]) {
    let init = String::from_utf8_lossy(init).into_owned();
    let mut parts = init.splitn(2, '\n');
    let nodes = parts.next().unwrap_or("").to_string();
    let out_dir = parts.next().unwrap_or("").to_string();

    let node = nodes.split(';').next().unwrap_or("");
    match read_dump(node, Path::new(&out_dir), ipc_in) {
        Ok(bytes) => {
            debug!("dump complete, {} bytes", bytes);
            ipc_out.send(Msg::scalar(MSG_DUMP_DONE)).ok();
        }
        Err(err) => {
            error!("dump retrieval from {} failed: {}", node, err);
            ipc_out.send(Msg::scalar(MSG_DUMP_FAILED)).ok();
        }
    }
}

fn read_dump(node: &str, out_dir: &Path, ipc_in: &Channel) -> ::std::io::Result<u64> {
    fs::create_dir_all(out_dir)?;
    let mut src = File::open(node)?;
    let out_path = out_dir.join("modem_core_dump.bin");
    let mut out = File::create(&out_path)?;
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        // A hangup on the inbound channel means the parent gave up on
        // this dump.
        if hangup(ipc_in) {
            return Err(::std::io::Error::new(
                ::std::io::ErrorKind::Interrupted,
                "dump aborted",
            ));
        }
        let read = src.read(&mut buf)?;
        if read == 0 {
            break;
        }
        out.write_all(&buf[..read])?;
        total += read as u64;
    }
    out.sync_all().ok();
    Ok(total)
}

fn hangup(channel: &Channel) -> bool {
    let mut pfd = ::libc::pollfd {
        fd: channel.poll_fd(),
        events: ::libc::POLLIN,
        revents: 0,
    };
    if unsafe { ::libc::poll(&mut pfd, 1, 0) } <= 0 {
        return false;
    }
    pfd.revents & (::libc::POLLERR | ::libc::POLLHUP | ::libc::POLLNVAL) != 0
}
