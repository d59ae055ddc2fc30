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

//! Unix-socket helpers with poll-bounded I/O.
//!
//! All reads and writes on the client wire carry a deadline so a stuck
//! peer can never wedge the daemon's event loop.

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use libc;
use time::SteadyTime;

use error::{Error, Result};

const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_RETRY_MS: u64 = 250;

/// Filesystem path of the `crm<instance>` socket under `run_dir`.
pub fn path(run_dir: &Path, name: &str) -> PathBuf {
    run_dir.join(name)
}

/// Bind the server socket, replacing any stale socket file left over
/// from a previous run.
pub fn listen(run_dir: &Path, name: &str) -> Result<UnixListener> {
    let path = path(run_dir, name);
    if path.exists() {
        ::std::fs::remove_file(&path).map_err(Error::SocketIo)?;
    }
    let listener = UnixListener::bind(&path).map_err(Error::SocketIo)?;
    listener.set_nonblocking(true).map_err(Error::SocketIo)?;
    Ok(listener)
}

/// Connect to the server socket, retrying while the daemon is still
/// coming up.
pub fn connect(run_dir: &Path, name: &str) -> Result<UnixStream> {
    let path = path(run_dir, name);
    let mut last = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(&path) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = Some(err),
        }
        thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
    }
    Err(Error::SocketIo(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "socket connect failed")
    })))
}

/// Read exactly `buf.len()` bytes within `timeout_ms`.
pub fn read_exact(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> Result<()> {
    let end = SteadyTime::now() + ::time::Duration::milliseconds(timeout_ms);
    let mut done = 0;
    while done < buf.len() {
        wait(fd, libc::POLLIN, &end)?;
        let ret = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if ret == 0 {
            return Err(Error::SocketIo(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed socket",
            )));
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted
                || err.kind() == io::ErrorKind::WouldBlock
            {
                continue;
            }
            return Err(Error::SocketIo(err));
        }
        done += ret as usize;
    }
    Ok(())
}

/// Write all of `buf` within `timeout_ms`.
pub fn write_all(fd: RawFd, buf: &[u8], timeout_ms: i64) -> Result<()> {
    let end = SteadyTime::now() + ::time::Duration::milliseconds(timeout_ms);
    let mut done = 0;
    while done < buf.len() {
        wait(fd, libc::POLLOUT, &end)?;
        let ret = unsafe {
            libc::write(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted
                || err.kind() == io::ErrorKind::WouldBlock
            {
                continue;
            }
            return Err(Error::SocketIo(err));
        }
        done += ret as usize;
    }
    Ok(())
}

fn wait(fd: RawFd, events: libc::c_short, end: &SteadyTime) -> Result<()> {
    loop {
        let remaining = (*end - SteadyTime::now()).num_milliseconds();
        if remaining <= 0 {
            return Err(Error::SocketTimeout);
        }
        let mut pfd = libc::pollfd {
            fd: fd,
            events: events,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, remaining as libc::c_int) };
        if ret > 0 {
            if pfd.revents & libc::POLLNVAL != 0 {
                return Err(Error::SocketIo(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket gone",
                )));
            }
            return Ok(());
        }
        if ret == 0 {
            return Err(Error::SocketTimeout);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Poll(err));
        }
    }
}

#[cfg(test)]
mod test {
    extern crate tempfile;

    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    #[test]
    fn bounded_read_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut buf = [0u8; 4];
        match read_exact(a.as_raw_fd(), &mut buf, 50) {
            Err(Error::SocketTimeout) => (),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn listen_and_connect() {
        let dir = self::tempfile::tempdir().unwrap();
        let listener = listen(dir.path(), "crm0").unwrap();
        let client = thread::spawn({
            let dir = dir.path().to_path_buf();
            move || {
                let mut stream = connect(&dir, "crm0").unwrap();
                stream.write_all(b"ping").unwrap();
            }
        });
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok((stream, _)) => {
                    accepted = Some(stream);
                    break;
                }
                Err(_) => thread::sleep(::std::time::Duration::from_millis(10)),
            }
        }
        let stream = accepted.expect("no client accepted");
        let mut buf = [0u8; 4];
        read_exact(stream.as_raw_fd(), &mut buf, 1000).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();
    }
}
