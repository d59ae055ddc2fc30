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

//! Monodirectional message queue between two endpoints, each of which
//! may be a thread or a process.
//!
//! A message carries a 64-bit scalar and an optional payload. In
//! thread mode the payload is moved through an in-memory ring and only
//! a wake-up byte crosses the pipe; in process mode the payload bytes
//! are copied across the pipe. The receiver side exposes one file
//! descriptor suitable for readiness polling; closing either endpoint
//! makes the peer's descriptor signal hangup.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use libc;

use error::{Error, Result};

/// Maximum number of in-flight messages on a thread-mode channel.
/// Sending to a full queue fails, it never blocks.
pub const QUEUE_DEPTH: usize = 8;

const HDR_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Thread,
    Process,
}

/// One IPC message. `scalar` is free-form tag space for the two
/// endpoints; `data` is an opaque payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Msg {
    pub scalar: i64,
    pub data: Option<Vec<u8>>,
}

impl Msg {
    pub fn scalar(scalar: i64) -> Msg {
        Msg {
            scalar: scalar,
            data: None,
        }
    }

    pub fn with_data(scalar: i64, data: Vec<u8>) -> Msg {
        Msg {
            scalar: scalar,
            data: Some(data),
        }
    }
}

struct Inner {
    kind: Kind,
    r_fd: RawFd,
    w_fd: RawFd,
    closed: AtomicBool,
    /// Thread mode: ring of pending messages, cursor protected here.
    queue: Mutex<VecDeque<Msg>>,
    /// Process mode: serializes writers so frames never interleave.
    wlock: Mutex<()>,
    /// Process mode: serializes readers.
    rlock: Mutex<()>,
}

/// One endpoint handle. Clones share the same underlying channel; for
/// process mode the handle is meant to be inherited across `fork` and
/// used from one side only.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(kind: Kind) -> Result<Channel> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        unsafe {
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                return Err(Error::CreatePipe(io::Error::last_os_error()));
            }
        }
        Ok(Channel {
            inner: Arc::new(Inner {
                kind: kind,
                r_fd: fds[0],
                w_fd: fds[1],
                closed: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::with_capacity(QUEUE_DEPTH)),
                wlock: Mutex::new(()),
                rlock: Mutex::new(()),
            }),
        })
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// File descriptor to poll (`POLLIN`) for message notifications.
    /// It must only be used for readiness polling, never read from or
    /// closed by the caller.
    pub fn poll_fd(&self) -> RawFd {
        self.inner.r_fd
    }

    /// Write-side descriptor, for same-crate plumbing that must emit
    /// a frame from signal context without going through `send`.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.inner.w_fd
    }

    /// Send a message. Never blocks on a full queue: returns
    /// `Error::ChannelFull` when no room is left, `Error::ChannelClosed`
    /// once the peer is gone.
    pub fn send(&self, msg: Msg) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        match self.inner.kind {
            Kind::Thread => self.send_thread(msg),
            Kind::Process => self.send_process(msg),
        }
    }

    /// Fetch at most one message. Returns `None` once the queue is
    /// drained or the peer hung up. Must be called repeatedly after
    /// the poll fd signals readability, until it returns `None`.
    pub fn try_get(&self) -> Option<Msg> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        match self.inner.kind {
            Kind::Thread => self.get_thread(),
            Kind::Process => self.get_process(),
        }
    }

    /// Close this endpoint. The peer's poll fd will signal hangup.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.inner.r_fd);
                libc::close(self.inner.w_fd);
            }
        }
    }

    fn send_thread(&self, msg: Msg) -> Result<()> {
        let mut queue = self.inner.queue.lock().expect("ipc queue lock poisoned");
        if queue.len() >= QUEUE_DEPTH {
            return Err(Error::ChannelFull);
        }
        let dummy = [0u8; 1];
        if write_all(self.inner.w_fd, &dummy).is_err() {
            return Err(Error::ChannelClosed);
        }
        queue.push_back(msg);
        Ok(())
    }

    fn get_thread(&self) -> Option<Msg> {
        let mut queue = self.inner.queue.lock().expect("ipc queue lock poisoned");
        match queue.pop_front() {
            Some(msg) => {
                let mut dummy = [0u8; 1];
                read_exact(self.inner.r_fd, &mut dummy).ok();
                Some(msg)
            }
            None => None,
        }
    }

    fn send_process(&self, msg: Msg) -> Result<()> {
        let _guard = self.inner.wlock.lock().expect("ipc write lock poisoned");
        if !poll_writable(self.inner.w_fd) {
            return Err(Error::ChannelFull);
        }
        let data_len = msg.data.as_ref().map_or(0, |d| d.len());
        let mut buf = Vec::with_capacity(HDR_SIZE + data_len);
        buf.extend_from_slice(&encode_i64(msg.scalar));
        buf.extend_from_slice(&encode_i64(data_len as i64));
        if let Some(ref data) = msg.data {
            buf.extend_from_slice(data);
        }
        write_all(self.inner.w_fd, &buf).map_err(|_| Error::ChannelClosed)
    }

    fn get_process(&self) -> Option<Msg> {
        let _guard = self.inner.rlock.lock().expect("ipc read lock poisoned");
        let mut hdr = [0u8; HDR_SIZE];
        match read_exact(self.inner.r_fd, &mut hdr) {
            Ok(true) => (),
            // Zero-length first read: peer hung up.
            _ => return None,
        }
        let scalar = decode_i64(&hdr[0..8]);
        let data_len = decode_i64(&hdr[8..16]) as usize;
        let data = if data_len > 0 {
            let mut payload = vec![0u8; data_len];
            match read_exact(self.inner.r_fd, &mut payload) {
                Ok(true) => Some(payload),
                _ => return None,
            }
        } else {
            None
        };
        Some(Msg {
            scalar: scalar,
            data: data,
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.r_fd);
                libc::close(self.w_fd);
            }
        }
    }
}

fn encode_i64(value: i64) -> [u8; 8] {
    unsafe { mem::transmute(value) }
}

fn decode_i64(buf: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(buf);
    unsafe { mem::transmute(raw) }
}

fn poll_writable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd: fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret >= 0 {
            return ret > 0 && (pfd.revents & libc::POLLOUT) != 0;
        }
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return false;
        }
    }
}

fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let ret = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += ret as usize;
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` reports end-of-file
/// before the first byte (peer hangup).
fn read_exact(fd: RawFd, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        let ret = unsafe {
            libc::read(
                fd,
                buf[read..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - read,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed mid-message",
            ));
        }
        read += ret as usize;
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use std::thread;

    use libc;

    use super::*;
    use error::Error;

    fn poll_in(fd: ::std::os::unix::io::RawFd, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: fd,
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
    }

    #[test]
    fn thread_mode_preserves_order() {
        let channel = Channel::new(Kind::Thread).unwrap();
        for i in 0..5 {
            channel.send(Msg::scalar(i)).unwrap();
        }
        for i in 0..5 {
            assert!(poll_in(channel.poll_fd(), 100));
            let msg = channel.try_get().unwrap();
            assert_eq!(msg.scalar, i);
        }
        assert!(channel.try_get().is_none());
    }

    #[test]
    fn thread_mode_full_queue_fails() {
        let channel = Channel::new(Kind::Thread).unwrap();
        for i in 0..QUEUE_DEPTH {
            channel.send(Msg::scalar(i as i64)).unwrap();
        }
        match channel.send(Msg::scalar(99)) {
            Err(Error::ChannelFull) => (),
            other => panic!("expected ChannelFull, got {:?}", other.map(|_| ())),
        }
        // Draining one slot makes room again.
        channel.try_get().unwrap();
        channel.send(Msg::scalar(99)).unwrap();
    }

    #[test]
    fn thread_mode_moves_payload() {
        let channel = Channel::new(Kind::Thread).unwrap();
        let tx = channel.clone();
        let handle = thread::spawn(move || {
            tx.send(Msg::with_data(7, vec![1, 2, 3])).unwrap();
        });
        handle.join().unwrap();
        assert!(poll_in(channel.poll_fd(), 1000));
        let msg = channel.try_get().unwrap();
        assert_eq!(msg.scalar, 7);
        assert_eq!(msg.data, Some(vec![1, 2, 3]));
    }

    #[test]
    fn process_mode_copies_payload() {
        let channel = Channel::new(Kind::Process).unwrap();
        channel
            .send(Msg::with_data(42, b"calibration".to_vec()))
            .unwrap();
        channel.send(Msg::scalar(-1)).unwrap();
        assert!(poll_in(channel.poll_fd(), 1000));
        let first = channel.try_get().unwrap();
        assert_eq!(first.scalar, 42);
        assert_eq!(first.data, Some(b"calibration".to_vec()));
        let second = channel.try_get().unwrap();
        assert_eq!(second.scalar, -1);
        assert_eq!(second.data, None);
    }

    #[test]
    fn close_makes_send_fail() {
        let channel = Channel::new(Kind::Thread).unwrap();
        channel.close();
        match channel.send(Msg::scalar(1)) {
            Err(Error::ChannelClosed) => (),
            other => panic!("expected ChannelClosed, got {:?}", other.map(|_| ())),
        }
    }
}
