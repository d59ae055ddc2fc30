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

extern crate crm_core;
extern crate libc;

use std::thread;
use std::time::Duration;

use crm_core::factory::{ProcessFactory, Registry};
use crm_core::ipc::{Channel, Msg};

fn poll_in(fd: ::std::os::unix::io::RawFd, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd: fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
}

/// Publishes its init payload length plus one message, then exits.
fn oneshot_worker(_ipc_in: &Channel, ipc_out: &Channel, init: &[u8]) {
    ipc_out
        .send(Msg::with_data(init.len() as i64, init.to_vec()))
        .ok();
}

/// Sits on its inbound channel until the parent kills it or the pipes
/// hang up.
fn sleeper_worker(ipc_in: &Channel, _ipc_out: &Channel, _init: &[u8]) {
    loop {
        let mut pfd = libc::pollfd {
            fd: ipc_in.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, -1) } < 0 {
            break;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            break;
        }
        if ipc_in.try_get().is_none() {
            break;
        }
    }
}

static REGISTRY: Registry = &[
    ("oneshot", oneshot_worker),
    ("sleeper", sleeper_worker),
];

/// Spawn, message, kill, clean and dispose workers; every id must be
/// reusable, nothing may leak and nothing may be reaped twice.
#[test]
fn spawn_kill_clean_dispose() {
    let factory = ProcessFactory::init(2, REGISTRY).expect("factory init");
    assert_eq!(factory.capacity(), 2);

    // Unknown worker names are rejected by the supervisor.
    assert!(factory.create("no-such-worker", &[]).is_err());

    // A one-shot worker publishes its init payload back and exits;
    // clean() frees its id once the message is read.
    let id = factory.create("oneshot", b"init-data").expect("create oneshot");
    assert!(poll_in(factory.poll_fd(id), 5000));
    let msg = factory.try_get(id).expect("oneshot result");
    assert_eq!(msg.scalar, 9);
    assert_eq!(msg.data, Some(b"init-data".to_vec()));
    factory.clean(id).unwrap();

    // A killed worker is reaped without parent-side waiting.
    let sleeper = factory.create("sleeper", &[]).expect("create sleeper");
    factory.send(sleeper, Msg::scalar(1)).unwrap();
    factory.kill(sleeper).unwrap();

    // Give the supervisor time to observe both deaths.
    thread::sleep(Duration::from_millis(300));

    // Both ids must be free again: the factory has capacity 2 and two
    // more creations succeed.
    let a = factory.create("sleeper", &[]).expect("reuse slot a");
    let b = factory.create("sleeper", &[]).expect("reuse slot b");
    assert_ne!(a, b);

    // Capacity exhausted: a third creation fails.
    assert!(factory.create("sleeper", &[]).is_err());

    // Dispose kills the remaining workers and joins the supervisor.
    factory.dispose();
}
