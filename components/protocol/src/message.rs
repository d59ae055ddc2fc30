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

use std::fmt;

use error::{Error, Result};

/// Maximum number of strings in a debug info payload.
pub const MAX_NB_DATA: usize = 5;
/// Maximum byte length of one debug info string.
pub const MAX_LEN_DATA: usize = 256;
/// Maximum byte length of a client name.
pub const NAME_LEN: usize = 16;

/// Sentinel log sizes for debug info payloads.
pub const DBG_DEFAULT_LOG_SIZE: u32 = 0xFFFF_FFFF;
pub const DBG_DEFAULT_LOG_TIME: u32 = 0xFFFF_FFFF;
pub const DBG_DEFAULT_NO_LOG: u32 = 0;

/// Events the daemon can deliver to clients. Wire message ids for the
/// server-to-client direction are the enum values themselves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Down = 0,
    On = 1,
    Up = 2,
    Oos = 3,
    ColdReset = 4,
    Shutdown = 5,
    DbgInfo = 6,
}

pub const NUM_EVENTS: u32 = 7;

impl EventKind {
    pub fn from_u32(id: u32) -> Option<EventKind> {
        match id {
            0 => Some(EventKind::Down),
            1 => Some(EventKind::On),
            2 => Some(EventKind::Up),
            3 => Some(EventKind::Oos),
            4 => Some(EventKind::ColdReset),
            5 => Some(EventKind::Shutdown),
            6 => Some(EventKind::DbgInfo),
            _ => None,
        }
    }

    pub fn flag(&self) -> Events {
        Events::from_bits_truncate(1 << (*self as u32))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            EventKind::Down => "MDM_DOWN",
            EventKind::On => "MDM_ON",
            EventKind::Up => "MDM_UP",
            EventKind::Oos => "MDM_OOS",
            EventKind::ColdReset => "MDM_COLD_RESET",
            EventKind::Shutdown => "MDM_SHUTDOWN",
            EventKind::DbgInfo => "MDM_DBG_INFO",
        };
        write!(f, "{}", name)
    }
}

bitflags! {
    /// Client subscription mask; one bit per `EventKind`.
    pub struct Events: u32 {
        const MDM_DOWN = 1 << 0;
        const MDM_ON = 1 << 1;
        const MDM_UP = 1 << 2;
        const MDM_OOS = 1 << 3;
        const MDM_COLD_RESET = 1 << 4;
        const MDM_SHUTDOWN = 1 << 5;
        const MDM_DBG_INFO = 1 << 6;
    }
}

/// Request ids, following the event id space.
pub const REQ_REGISTER: u32 = NUM_EVENTS;
pub const REQ_REGISTER_DBG: u32 = NUM_EVENTS + 1;
pub const REQ_ACQUIRE: u32 = NUM_EVENTS + 2;
pub const REQ_RELEASE: u32 = NUM_EVENTS + 3;
pub const REQ_RESTART: u32 = NUM_EVENTS + 4;
pub const REQ_SHUTDOWN: u32 = NUM_EVENTS + 5;
pub const REQ_NVM_BACKUP: u32 = NUM_EVENTS + 6;
pub const REQ_ACK_COLD_RESET: u32 = NUM_EVENTS + 7;
pub const REQ_ACK_SHUTDOWN: u32 = NUM_EVENTS + 8;
pub const REQ_NOTIFY_DBG: u32 = NUM_EVENTS + 9;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbgType {
    Info = 0,
    Error = 1,
    Stats = 2,
    SelfReset = 3,
    Apimr = 4,
    DumpStart = 5,
    DumpEnd = 6,
    FwFailure = 7,
    TlvSuccess = 8,
    NvmBackupSuccess = 9,
    PlatformReboot = 10,
}

impl DbgType {
    pub fn from_u32(value: u32) -> Result<DbgType> {
        match value {
            0 => Ok(DbgType::Info),
            1 => Ok(DbgType::Error),
            2 => Ok(DbgType::Stats),
            3 => Ok(DbgType::SelfReset),
            4 => Ok(DbgType::Apimr),
            5 => Ok(DbgType::DumpStart),
            6 => Ok(DbgType::DumpEnd),
            7 => Ok(DbgType::FwFailure),
            8 => Ok(DbgType::TlvSuccess),
            9 => Ok(DbgType::NvmBackupSuccess),
            10 => Ok(DbgType::PlatformReboot),
            v => Err(Error::UnknownDbgType(v)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartCause {
    MdmErr = 0,
    ApplyUpdate = 1,
}

impl RestartCause {
    pub fn from_u32(value: u32) -> Result<RestartCause> {
        match value {
            0 => Ok(RestartCause::MdmErr),
            1 => Ok(RestartCause::ApplyUpdate),
            v => Err(Error::UnknownCause(v)),
        }
    }
}

/// Debug information payload, carried by RESTART, NOTIFY_DBG and
/// MDM_DBG_INFO messages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DbgInfo {
    pub kind: DbgType,
    pub ap_logs_size: u32,
    pub bp_logs_size: u32,
    pub bp_logs_time: u32,
    pub data: Vec<String>,
}

impl DbgInfo {
    /// Payload with no log-size hints and no strings.
    pub fn bare(kind: DbgType) -> DbgInfo {
        DbgInfo {
            kind: kind,
            ap_logs_size: DBG_DEFAULT_NO_LOG,
            bp_logs_size: DBG_DEFAULT_NO_LOG,
            bp_logs_time: DBG_DEFAULT_NO_LOG,
            data: Vec::new(),
        }
    }

    pub fn with_data(kind: DbgType, data: Vec<String>) -> DbgInfo {
        DbgInfo {
            kind: kind,
            ap_logs_size: DBG_DEFAULT_NO_LOG,
            bp_logs_size: DBG_DEFAULT_NO_LOG,
            bp_logs_time: DBG_DEFAULT_NO_LOG,
            data: data,
        }
    }
}

/// One wire message, either direction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Server to client: lifecycle event without payload.
    Event(EventKind),
    /// Server to client: MDM_DBG_INFO with its (optional) payload.
    DbgInfo(Option<DbgInfo>),
    Register { events: Events, name: String },
    RegisterDbg { events: Events, name: String },
    Acquire,
    Release,
    Restart {
        cause: RestartCause,
        debug: Option<DbgInfo>,
    },
    Shutdown,
    NvmBackup,
    AckColdReset,
    AckShutdown,
    NotifyDbg(Option<DbgInfo>),
}

impl Message {
    pub fn id(&self) -> u32 {
        match *self {
            Message::Event(kind) => kind as u32,
            Message::DbgInfo(_) => EventKind::DbgInfo as u32,
            Message::Register { .. } => REQ_REGISTER,
            Message::RegisterDbg { .. } => REQ_REGISTER_DBG,
            Message::Acquire => REQ_ACQUIRE,
            Message::Release => REQ_RELEASE,
            Message::Restart { .. } => REQ_RESTART,
            Message::Shutdown => REQ_SHUTDOWN,
            Message::NvmBackup => REQ_NVM_BACKUP,
            Message::AckColdReset => REQ_ACK_COLD_RESET,
            Message::AckShutdown => REQ_ACK_SHUTDOWN,
            Message::NotifyDbg(_) => REQ_NOTIFY_DBG,
        }
    }

    /// True for client-to-server messages.
    pub fn is_request(&self) -> bool {
        self.id() >= NUM_EVENTS
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Message::Event(kind) => write!(f, "{}", kind),
            Message::DbgInfo(_) => write!(f, "MDM_DBG_INFO"),
            Message::Register { ref name, .. } => write!(f, "REGISTER('{}')", name),
            Message::RegisterDbg { ref name, .. } => write!(f, "REGISTER_DBG('{}')", name),
            Message::Acquire => write!(f, "ACQUIRE"),
            Message::Release => write!(f, "RELEASE"),
            Message::Restart { cause, .. } => write!(f, "RESTART({:?})", cause),
            Message::Shutdown => write!(f, "SHUTDOWN"),
            Message::NvmBackup => write!(f, "NVM_BACKUP"),
            Message::AckColdReset => write!(f, "ACK_COLD_RESET"),
            Message::AckShutdown => write!(f, "ACK_SHUTDOWN"),
            Message::NotifyDbg(_) => write!(f, "NOTIFY_DBG"),
        }
    }
}
