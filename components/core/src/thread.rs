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

//! A worker thread bundled with its IPC channel pair.
//!
//! The channels are closed before joining in `dispose`, so a thread
//! routine can treat hangup on its inbound poll fd as the stop signal.

use std::os::unix::io::RawFd;
use std::thread;
use std::thread::JoinHandle;

use error::{Error, Result};
use ipc::{Channel, Kind, Msg};

pub struct WorkerThread {
    to_thread: Channel,
    from_thread: Channel,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn `routine` on a named thread. The routine receives the
    /// inbound channel (its poll fd hangs up on dispose) and the
    /// outbound channel it publishes results on.
    pub fn spawn<F>(name: &str, routine: F) -> Result<WorkerThread>
    where
        F: FnOnce(Channel, Channel) + Send + 'static,
    {
        let to_thread = Channel::new(Kind::Thread)?;
        let from_thread = Channel::new(Kind::Thread)?;
        let rx = to_thread.clone();
        let tx = from_thread.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || routine(rx, tx))
            .map_err(Error::SpawnThread)?;
        Ok(WorkerThread {
            to_thread: to_thread,
            from_thread: from_thread,
            handle: Some(handle),
        })
    }

    /// Poll fd signalling messages published by the thread.
    pub fn poll_fd(&self) -> RawFd {
        self.from_thread.poll_fd()
    }

    /// Clone of the inbound channel, for callers needing an extra
    /// sender handle onto the thread.
    pub fn sender(&self) -> Channel {
        self.to_thread.clone()
    }

    pub fn send(&self, msg: Msg) -> Result<()> {
        self.to_thread.send(msg)
    }

    pub fn try_get(&self) -> Option<Msg> {
        self.from_thread.try_get()
    }

    /// Close both channels, then wait for the thread to finish.
    pub fn dispose(mut self) {
        self.to_thread.close();
        self.from_thread.close();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.to_thread.close();
        self.from_thread.close();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod test {
    use libc;

    use super::*;
    use ipc::Msg;

    #[test]
    fn round_trip_and_hangup() {
        let worker = WorkerThread::spawn("test-echo", |rx, tx| loop {
            let mut pfd = libc::pollfd {
                fd: rx.poll_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            if unsafe { libc::poll(&mut pfd, 1, 5000) } <= 0 {
                break;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                break;
            }
            match rx.try_get() {
                Some(msg) => {
                    tx.send(Msg::scalar(msg.scalar * 2)).ok();
                }
                None => break,
            }
        }).unwrap();

        worker.send(Msg::scalar(21)).unwrap();
        let mut pfd = libc::pollfd {
            fd: worker.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        assert!(unsafe { libc::poll(&mut pfd, 1, 5000) } > 0);
        assert_eq!(worker.try_get().unwrap().scalar, 42);
        worker.dispose();
    }
}
