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

//! End-to-end lifecycle scenarios: a full daemon with the stub modem,
//! driven through the public client library.
//!
//! Everything runs inside one test function: the worker factory forks
//! its supervisor, which must happen exactly once and before the
//! process grows threads.

extern crate byteorder;
extern crate crm;
extern crate crm_client;
extern crate crm_core;
extern crate crm_protocol as protocol;
extern crate tempfile;

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};

use crm::config::Config;
use crm::manager::hal::stub::StubHal;
use crm::manager::{workers, Manager, KEY_STUB_FW_FAIL};
use crm_client::MdmClient;
use crm_core::factory::ProcessFactory;
use crm_core::property;
use protocol::{DbgInfo, DbgType, EventKind, Events, RestartCause};

type Evt = (EventKind, Option<DbgInfo>);

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.instance = 0;
    config.daemon.run_dir = dir.to_path_buf();
    config.hal.variant = String::from("stub");
    config.hal.at_probe = false;
    config.node.flash = dir.join("flash_node");
    config.node.dump = dir.join("dump_node");
    config.node.shutdown = dir.join("shutdown_node");
    config.node.tlv = dir.join("tlv_node");
    config.firmware.path = dir.join("modem.fls");
    config.firmware.tlv_dir = dir.join("tlv");
    config.firmware.dump_dir = dir.join("dumps");
    config.nvm.folder = dir.join("nvm");
    config
}

/// One firmware image with a code and a customization section.
fn write_firmware(path: &Path) {
    let mut raw = Vec::new();
    for &(class, data) in &[(0u8, &b"code-section"[..]), (1u8, &b"cust-section"[..])] {
        raw.push(class);
        raw.write_u32::<BigEndian>(data.len() as u32).unwrap();
        raw.extend_from_slice(data);
    }
    fs::write(path, raw).unwrap();
}

fn expect(rx: &mpsc::Receiver<Evt>, kind: EventKind) -> Option<DbgInfo> {
    match rx.recv_timeout(Duration::from_secs(15)) {
        Ok((got, debug)) => {
            assert_eq!(got, kind, "expected {}, got {}", kind, got);
            debug
        }
        Err(_) => panic!("timed out waiting for {}", kind),
    }
}

fn expect_dbg(rx: &mpsc::Receiver<Evt>, kind: DbgType) -> DbgInfo {
    let debug = expect(rx, EventKind::DbgInfo).expect("debug event without payload");
    assert_eq!(debug.kind, kind);
    debug
}

fn expect_quiet(rx: &mpsc::Receiver<Evt>, ms: u64) {
    if let Ok((kind, _)) = rx.recv_timeout(Duration::from_millis(ms)) {
        panic!("unexpected event {}", kind);
    }
}

#[test]
fn modem_lifecycle_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    fs::create_dir_all(&config.firmware.tlv_dir).unwrap();
    fs::write(config.firmware.tlv_dir.join("carrier.tlv"), &[0x01u8, 0x02]).unwrap();
    fs::write(&config.node.dump, b"post-crash snapshot").unwrap();
    write_firmware(&config.firmware.path);

    // The factory's supervisor fork must precede every thread below.
    let factory = ProcessFactory::init(2, workers::REGISTRY).unwrap();
    let (hal, modem) = StubHal::new(&config).unwrap();
    let mut manager = Manager::with_hal(config, factory, Box::new(hal)).unwrap();
    let shutdown = manager.shutdown_handle();
    let (exit_tx, exit_rx) = mpsc::channel();
    let daemon = thread::spawn(move || {
        let code = manager.run();
        manager.dispose();
        exit_tx.send(code).unwrap();
    });

    // -------------------------------------------------------------
    // Happy path: register, immediate MDM_DOWN, acquire to MDM_UP
    // with the customization report in between.
    let (a_tx, a_rx) = mpsc::channel();
    let client_a = MdmClient::connect(
        dir.path(),
        0,
        "test",
        Events::MDM_UP | Events::MDM_DOWN | Events::MDM_DBG_INFO,
        move |kind, debug| {
            a_tx.send((kind, debug.cloned())).ok();
        },
    ).unwrap();
    expect(&a_rx, EventKind::Down);

    client_a.acquire().unwrap();
    expect_dbg(&a_rx, DbgType::TlvSuccess);
    expect(&a_rx, EventKind::Up);

    // The firmware worker flashed code before customization data.
    let flashed = fs::read(dir.path().join("flash_node")).unwrap();
    assert_eq!(flashed, b"code-sectioncust-section");

    // -------------------------------------------------------------
    // Cold reset with debug info: MDM_DOWN, the same debug payload,
    // MDM_UP.
    let debug = DbgInfo {
        kind: DbgType::Apimr,
        ap_logs_size: 1234,
        bp_logs_size: 5678,
        bp_logs_time: 9012,
        data: vec![
            String::from("First"),
            String::from("Second"),
            String::from("Third"),
            String::from("Fourth"),
        ],
    };
    client_a
        .restart(RestartCause::MdmErr, Some(debug.clone()))
        .unwrap();
    expect(&a_rx, EventKind::Down);
    let echoed = expect_dbg(&a_rx, DbgType::Apimr);
    assert_eq!(echoed, debug);
    expect(&a_rx, EventKind::Up);

    // -------------------------------------------------------------
    // Self-reset: the link drops behind the daemon's back.
    modem.inject_link_down();
    expect(&a_rx, EventKind::Down);
    expect_dbg(&a_rx, DbgType::SelfReset);
    expect(&a_rx, EventKind::Up);

    // -------------------------------------------------------------
    // Crash and core dump: MDM_DOWN, dump start/end markers, MDM_UP
    // once the modem rebooted.
    modem.inject_crash();
    expect(&a_rx, EventKind::Down);
    expect_dbg(&a_rx, DbgType::DumpStart);
    expect_dbg(&a_rx, DbgType::DumpEnd);
    expect(&a_rx, EventKind::Up);
    let dump = fs::read(dir.path().join("dumps").join("modem_core_dump.bin")).unwrap();
    assert_eq!(dump, b"post-crash snapshot");

    // -------------------------------------------------------------
    // Two clients, interleaved acquire/release; the second release
    // negotiates the shutdown and the silent client only delays it.
    let (b_tx, b_rx) = mpsc::channel();
    let client_b = MdmClient::connect(
        dir.path(),
        0,
        "observer",
        Events::MDM_UP | Events::MDM_DOWN | Events::MDM_SHUTDOWN | Events::MDM_OOS,
        move |kind, debug| {
            b_tx.send((kind, debug.cloned())).ok();
        },
    ).unwrap();
    expect(&b_rx, EventKind::Up);

    client_b.acquire().unwrap();
    client_a.release().unwrap();
    // B still holds the modem: no teardown.
    expect_quiet(&a_rx, 300);

    client_b.release().unwrap();
    expect(&b_rx, EventKind::Shutdown);
    expect(&b_rx, EventKind::Down);
    expect(&a_rx, EventKind::Down);
    // B never acknowledges; the 1 s deadline drives the stop and B
    // stays connected.

    // -------------------------------------------------------------
    // Firmware verification failing twice: FW_FAILURE then OOS, and
    // further acquires answered with OOS only.
    property::set(KEY_STUB_FW_FAIL, "2");
    client_a.acquire().unwrap();
    expect_dbg(&a_rx, DbgType::FwFailure);
    expect(&b_rx, EventKind::Oos);

    client_b.acquire().unwrap();
    expect(&b_rx, EventKind::Oos);
    expect_quiet(&b_rx, 300);
    property::set(KEY_STUB_FW_FAIL, "0");

    client_a.disconnect();
    client_b.disconnect();

    shutdown.shutdown();
    daemon.join().unwrap();
    let code = exit_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(code.unwrap(), 0);
}
