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

//! TLV customization task: streams every customization script found
//! in the TLV directory to the modem, chunked and AT-wrapped, then
//! reports completion. An empty or absent directory is a successful
//! no-op.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crm_core::ipc::Msg;
use crm_core::thread::WorkerThread;

use config::Config;
use error::Result;
use manager::workers::{MSG_CUSTO_DONE, MSG_CUSTO_FAILED};

const TLV_CHUNK: usize = 256;

pub fn spawn(config: &Config) -> Result<WorkerThread> {
    let tlv_dir = config.firmware.tlv_dir.clone();
    let tlv_node = config.node.tlv.clone();
    let thread = WorkerThread::spawn("mdm-custo", move |_rx, tx| {
        let scalar = match apply_all(&tlv_dir, &tlv_node) {
            Ok(count) => {
                debug!("applied {} TLV script(s)", count);
                MSG_CUSTO_DONE
            }
            Err(err) => {
                error!("TLV customization failed: {}", err);
                MSG_CUSTO_FAILED
            }
        };
        tx.send(Msg::scalar(scalar)).ok();
    })?;
    Ok(thread)
}

fn apply_all(tlv_dir: &Path, tlv_node: &PathBuf) -> ::std::io::Result<usize> {
    let mut scripts: Vec<PathBuf> = match fs::read_dir(tlv_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "tlv"))
            .collect(),
        // No customization payload on this platform.
        Err(_) => return Ok(0),
    };
    scripts.sort();
    if scripts.is_empty() {
        return Ok(0);
    }
    let mut node = OpenOptions::new().write(true).create(true).open(tlv_node)?;
    for script in &scripts {
        apply_one(script, &mut node)?;
    }
    Ok(scripts.len())
}

fn apply_one(script: &Path, node: &mut Write) -> ::std::io::Result<()> {
    let data = fs::read(script)?;
    debug!("applying {}", script.display());
    for (index, chunk) in data.chunks(TLV_CHUNK).enumerate() {
        let mut line = format!("AT@tlv:config_script[{}]={{", index * TLV_CHUNK);
        for byte in chunk {
            line.push_str(&format!("{:02x}", byte));
        }
        line.push_str("}\r\n");
        node.write_all(line.as_bytes())?;
    }
    Ok(())
}
