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

//! Firmware upload worker.
//!
//! Runs in its own process: the flashing step drives third-party
//! protocol code that is not crash-safe. The worker packages the
//! firmware image (parses its section table), then streams every
//! section to the flash node. Code sections are flashed strictly
//! before customization sections, and success is only reported once
//! both sets went through.
//!
//! Init payload: `<flash_nodes>\n<firmware_path>\n<fail_flag>` (the
//! node list itself is `;`-separated).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crm_core::ipc::{Channel, Msg};

use manager::workers::{MSG_FW_FAILED, MSG_FW_FLASHED, MSG_FW_PACKAGED};

const CLASS_CODE: u8 = 0;
const CLASS_CUST: u8 = 1;

struct Section {
    class: u8,
    data: Vec<u8>,
}

pub fn worker_main(_ipc_in: &Channel, ipc_out: &Channel, init: &[u8]) {
    let init = String::from_utf8_lossy(init).into_owned();
    let mut parts = init.splitn(3, '\n');
    let nodes = parts.next().unwrap_or("").to_string();
    let fw_path = parts.next().unwrap_or("").to_string();
    let fail = parts.next().unwrap_or("0") == "1";

    let sections = match package(Path::new(&fw_path)) {
        Ok(sections) => sections,
        Err(err) => {
            error!("unable to package firmware {}: {}", fw_path, err);
            ipc_out.send(Msg::scalar(MSG_FW_FAILED)).ok();
            return;
        }
    };
    ipc_out.send(Msg::scalar(MSG_FW_PACKAGED)).ok();

    if fail {
        // Verification failure injected for host runs.
        ipc_out.send(Msg::scalar(MSG_FW_FAILED)).ok();
        return;
    }

    // First flash node carries the boot protocol stream.
    let node = nodes.split(';').next().unwrap_or("");
    match flash(node, &sections) {
        Ok(()) => {
            ipc_out.send(Msg::scalar(MSG_FW_FLASHED)).ok();
        }
        Err(err) => {
            error!("flashing on {} failed: {}", node, err);
            ipc_out.send(Msg::scalar(MSG_FW_FAILED)).ok();
        }
    }
}

/// Parse the packaged image: a sequence of
/// `{u8 class, u32 length, bytes}` records.
fn package(path: &Path) -> ::std::io::Result<Vec<Section>> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    let mut sections = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        if pos + 5 > raw.len() {
            return Err(::std::io::Error::new(
                ::std::io::ErrorKind::InvalidData,
                "truncated section header",
            ));
        }
        let class = raw[pos];
        let len = BigEndian::read_u32(&raw[pos + 1..pos + 5]) as usize;
        pos += 5;
        if pos + len > raw.len() || (class != CLASS_CODE && class != CLASS_CUST) {
            return Err(::std::io::Error::new(
                ::std::io::ErrorKind::InvalidData,
                "bad firmware section",
            ));
        }
        sections.push(Section {
            class: class,
            data: raw[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(sections)
}

fn flash(node: &str, sections: &[Section]) -> ::std::io::Result<()> {
    let mut out = OpenOptions::new().write(true).create(true).open(node)?;
    for class in &[CLASS_CODE, CLASS_CUST] {
        for section in sections.iter().filter(|s| s.class == *class) {
            out.write_all(&section.data)?;
        }
    }
    out.sync_all().ok();
    Ok(())
}

#[cfg(test)]
mod test {
    extern crate tempfile;

    use std::fs;

    use byteorder::{BigEndian, WriteBytesExt};

    use super::*;

    fn image(sections: &[(u8, &[u8])]) -> Vec<u8> {
        let mut raw = Vec::new();
        for &(class, data) in sections {
            raw.push(class);
            raw.write_u32::<BigEndian>(data.len() as u32).unwrap();
            raw.extend_from_slice(data);
        }
        raw
    }

    #[test]
    fn code_sections_flash_before_cust() {
        let dir = self::tempfile::tempdir().unwrap();
        let fw = dir.path().join("modem.fls");
        let node = dir.path().join("flash_node");
        fs::write(
            &fw,
            image(&[(CLASS_CUST, b"cust1"), (CLASS_CODE, b"code1"), (CLASS_CUST, b"cust2")]),
        ).unwrap();
        let sections = package(&fw).unwrap();
        flash(node.to_str().unwrap(), &sections).unwrap();
        assert_eq!(fs::read(&node).unwrap(), b"code1cust1cust2");
    }

    #[test]
    fn truncated_image_is_rejected() {
        let dir = self::tempfile::tempdir().unwrap();
        let fw = dir.path().join("modem.fls");
        let mut raw = image(&[(CLASS_CODE, b"code")]);
        raw.truncate(raw.len() - 1);
        fs::write(&fw, raw).unwrap();
        assert!(package(&fw).is_err());
    }
}
