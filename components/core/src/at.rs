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

//! Minimal AT command helper: one command out, wait for the final
//! result code within a deadline. Command formatting beyond that is a
//! collaborator concern, not ours.

use std::os::unix::io::RawFd;
use std::str;

use error::{Error, Result};
use socket;

/// Send `cmd` (without line ending) and wait for `OK` or `ERROR`.
pub fn send(fd: RawFd, cmd: &str, timeout_ms: i64) -> Result<()> {
    let mut line = String::with_capacity(cmd.len() + 2);
    line.push_str(cmd);
    line.push_str("\r\n");
    socket::write_all(fd, line.as_bytes(), timeout_ms)?;
    wait_final(fd, cmd, timeout_ms)
}

/// Send `cmd` without waiting for any answer (used for best-effort
/// commands like the shutdown `AT+CFUN=0`).
pub fn send_no_answer(fd: RawFd, cmd: &str, timeout_ms: i64) -> Result<()> {
    let mut line = String::with_capacity(cmd.len() + 2);
    line.push_str(cmd);
    line.push_str("\r\n");
    socket::write_all(fd, line.as_bytes(), timeout_ms)
}

fn wait_final(fd: RawFd, cmd: &str, timeout_ms: i64) -> Result<()> {
    let mut window = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        socket::read_exact(fd, &mut byte, timeout_ms)?;
        window.push(byte[0]);
        if window.len() > 64 {
            window.remove(0);
        }
        if ends_with(&window, b"OK\r\n") || ends_with(&window, b"OK\n") {
            return Ok(());
        }
        if ends_with(&window, b"ERROR\r\n") || ends_with(&window, b"ERROR\n") {
            return Err(Error::AtCommand(cmd.to_string()));
        }
    }
}

fn ends_with(window: &[u8], pattern: &[u8]) -> bool {
    window.len() >= pattern.len() && &window[window.len() - pattern.len()..] == pattern
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    #[test]
    fn ok_and_error_answers() {
        let (modem, crm) = UnixStream::pair().unwrap();
        let answers = thread::spawn(move || {
            let mut modem = modem;
            modem.write_all(b"\r\nOK\r\n").unwrap();
            modem.write_all(b"\r\nERROR\r\n").unwrap();
        });
        send(crm.as_raw_fd(), "AT", 1000).unwrap();
        assert!(send(crm.as_raw_fd(), "AT+XGENDATA", 1000).is_err());
        answers.join().unwrap();
    }
}
