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

//! Serializer / deserializer for the client wire protocol.
//!
//! `send` serializes straight to the socket; `encode` returns the
//! frame so the same bytes can be broadcast to many clients. All
//! socket I/O is bounded by [`SOCKET_TIMEOUT_MS`]. Deserialization
//! never panics on hostile input: every malformed frame is an error
//! and the caller is expected to drop the connection.

use std::os::unix::io::RawFd;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crm_core::socket;

use error::{Error, Result};
use message::*;

/// I/O budget for one frame in either direction.
pub const SOCKET_TIMEOUT_MS: i64 = 1000;

pub const HEADER_SIZE: usize = 8;
const RESTART_CAUSE_SIZE: usize = 4;
const DBG_FIXED_SIZE: usize = 5 * 4;
const DBG_DYN_SIZE_MAX: usize = MAX_NB_DATA * (4 + MAX_LEN_DATA);

/// Largest legal frame: a RESTART carrying a full debug info payload.
pub const MSG_SIZE_MAX: usize =
    HEADER_SIZE + RESTART_CAUSE_SIZE + DBG_FIXED_SIZE + DBG_DYN_SIZE_MAX;

/// Serialize `msg` into a standalone frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.write_u32::<BigEndian>(msg.id()).expect("vec write");
    // Placeholder for the total length, patched below.
    buf.write_u32::<BigEndian>(0).expect("vec write");
    match *msg {
        Message::Register {
            ref events,
            ref name,
        }
        | Message::RegisterDbg {
            ref events,
            ref name,
        } => {
            buf.write_u32::<BigEndian>(events.bits()).expect("vec write");
            put_string(&mut buf, name, NAME_LEN)?;
        }
        Message::Restart { cause, ref debug } => {
            buf.write_u32::<BigEndian>(cause as u32).expect("vec write");
            if let Some(ref debug) = *debug {
                put_dbg_info(&mut buf, debug)?;
            }
        }
        Message::NotifyDbg(ref debug) | Message::DbgInfo(ref debug) => {
            if let Some(ref debug) = *debug {
                put_dbg_info(&mut buf, debug)?;
            }
        }
        Message::Event(kind) => {
            debug_assert!(kind != EventKind::DbgInfo);
        }
        Message::Acquire
        | Message::Release
        | Message::Shutdown
        | Message::NvmBackup
        | Message::AckColdReset
        | Message::AckShutdown => (),
    }
    let total = buf.len() as u32;
    BigEndian::write_u32(&mut buf[4..8], total);
    Ok(buf)
}

/// Serialize and send one message.
pub fn send(fd: RawFd, msg: &Message) -> Result<()> {
    let buf = encode(msg)?;
    send_encoded(fd, &buf)
}

/// Send an already-encoded frame (broadcast path).
pub fn send_encoded(fd: RawFd, buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::BadLength(buf.len() as u32));
    }
    let total = BigEndian::read_u32(&buf[4..8]) as usize;
    if total < HEADER_SIZE || total > buf.len() {
        return Err(Error::BadLength(total as u32));
    }
    socket::write_all(fd, &buf[..total], SOCKET_TIMEOUT_MS)?;
    Ok(())
}

/// Receive one message. Any failure (short read, bad length, bad
/// payload) is an error; the connection must be considered broken.
pub fn recv(fd: RawFd) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    socket::read_exact(fd, &mut header, SOCKET_TIMEOUT_MS)?;
    let id = BigEndian::read_u32(&header[0..4]);
    let total = BigEndian::read_u32(&header[4..8]) as usize;
    if total < HEADER_SIZE || total > MSG_SIZE_MAX {
        return Err(Error::BadLength(total as u32));
    }
    let mut payload = vec![0u8; total - HEADER_SIZE];
    if !payload.is_empty() {
        socket::read_exact(fd, &mut payload, SOCKET_TIMEOUT_MS)?;
    }
    parse(id, &payload)
}

/// Decode a standalone frame (header included).
pub fn decode(buf: &[u8]) -> Result<Message> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::BadLength(buf.len() as u32));
    }
    let id = BigEndian::read_u32(&buf[0..4]);
    let total = BigEndian::read_u32(&buf[4..8]) as usize;
    if total < HEADER_SIZE || total > MSG_SIZE_MAX || total != buf.len() {
        return Err(Error::BadLength(total as u32));
    }
    parse(id, &buf[HEADER_SIZE..])
}

fn parse(id: u32, payload: &[u8]) -> Result<Message> {
    let mut reader = Reader {
        buf: payload,
        pos: 0,
    };
    let msg = match id {
        REQ_REGISTER | REQ_REGISTER_DBG => {
            let bits = reader.u32()?;
            let events = Events::from_bits(bits).ok_or(Error::BadBitmap(bits))?;
            let name = reader.string(NAME_LEN)?;
            if id == REQ_REGISTER {
                Message::Register {
                    events: events,
                    name: name,
                }
            } else {
                Message::RegisterDbg {
                    events: events,
                    name: name,
                }
            }
        }
        REQ_RESTART => {
            let cause = RestartCause::from_u32(reader.u32()?)?;
            let debug = if reader.remaining() > 0 {
                Some(reader.dbg_info()?)
            } else {
                None
            };
            Message::Restart {
                cause: cause,
                debug: debug,
            }
        }
        REQ_NOTIFY_DBG => {
            let debug = if reader.remaining() > 0 {
                Some(reader.dbg_info()?)
            } else {
                None
            };
            Message::NotifyDbg(debug)
        }
        REQ_ACQUIRE => Message::Acquire,
        REQ_RELEASE => Message::Release,
        REQ_SHUTDOWN => Message::Shutdown,
        REQ_NVM_BACKUP => Message::NvmBackup,
        REQ_ACK_COLD_RESET => Message::AckColdReset,
        REQ_ACK_SHUTDOWN => Message::AckShutdown,
        id if id < NUM_EVENTS => {
            let kind = EventKind::from_u32(id).expect("event id bounds checked");
            if kind == EventKind::DbgInfo {
                let debug = if reader.remaining() > 0 {
                    Some(reader.dbg_info()?)
                } else {
                    None
                };
                Message::DbgInfo(debug)
            } else {
                Message::Event(kind)
            }
        }
        id => return Err(Error::BadId(id)),
    };
    if reader.remaining() != 0 {
        return Err(Error::TrailingData);
    }
    Ok(msg)
}

fn put_string(buf: &mut Vec<u8>, value: &str, max_len: usize) -> Result<()> {
    if value.len() > max_len {
        return Err(Error::BadString);
    }
    buf.write_u32::<BigEndian>(value.len() as u32)
        .expect("vec write");
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_dbg_info(buf: &mut Vec<u8>, debug: &DbgInfo) -> Result<()> {
    if debug.data.len() > MAX_NB_DATA {
        return Err(Error::TooManyStrings(debug.data.len() as u32));
    }
    buf.write_u32::<BigEndian>(debug.kind as u32).expect("vec write");
    buf.write_u32::<BigEndian>(debug.ap_logs_size).expect("vec write");
    buf.write_u32::<BigEndian>(debug.bp_logs_size).expect("vec write");
    buf.write_u32::<BigEndian>(debug.bp_logs_time).expect("vec write");
    buf.write_u32::<BigEndian>(debug.data.len() as u32)
        .expect("vec write");
    for item in &debug.data {
        put_string(buf, item, MAX_LEN_DATA)?;
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(Error::BadString);
        }
        let value = BigEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(value)
    }

    fn string(&mut self, max_len: usize) -> Result<String> {
        let len = self.u32()? as usize;
        if len > max_len || len > self.remaining() {
            return Err(Error::BadString);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::BadString)
    }

    fn dbg_info(&mut self) -> Result<DbgInfo> {
        let kind = DbgType::from_u32(self.u32()?)?;
        let ap_logs_size = self.u32()?;
        let bp_logs_size = self.u32()?;
        let bp_logs_time = self.u32()?;
        let nb_data = self.u32()?;
        if nb_data as usize > MAX_NB_DATA {
            return Err(Error::TooManyStrings(nb_data));
        }
        let mut data = Vec::with_capacity(nb_data as usize);
        for _ in 0..nb_data {
            data.push(self.string(MAX_LEN_DATA)?);
        }
        Ok(DbgInfo {
            kind: kind,
            ap_logs_size: ap_logs_size,
            bp_logs_size: bp_logs_size,
            bp_logs_time: bp_logs_time,
            data: data,
        })
    }
}
