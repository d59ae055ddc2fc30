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

use std::error;
use std::fmt;
use std::io;
use std::result;

#[derive(Debug)]
pub enum Error {
    /// Peer closed its end of an IPC channel.
    ChannelClosed,
    /// Channel queue is at capacity; the message was not enqueued.
    ChannelFull,
    /// AT command was answered with `ERROR`.
    AtCommand(String),
    CreatePipe(io::Error),
    Fork(io::Error),
    FileIo(io::Error),
    Poll(io::Error),
    SocketIo(io::Error),
    SocketTimeout,
    SpawnThread(io::Error),
    /// The supervisor declined to create a worker (no free slot or
    /// unknown worker name).
    WorkerCreate(String),
    /// The supervisor did not acknowledge a command in time.
    WorkerAck,
    Wait(io::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ChannelClosed => write!(f, "IPC channel closed by peer"),
            Error::ChannelFull => write!(f, "IPC channel queue full"),
            Error::AtCommand(ref cmd) => write!(f, "AT command '{}' rejected by modem", cmd),
            Error::CreatePipe(ref e) => write!(f, "Unable to create pipe, {}", e),
            Error::Fork(ref e) => write!(f, "Unable to fork, {}", e),
            Error::FileIo(ref e) => write!(f, "File I/O error, {}", e),
            Error::Poll(ref e) => write!(f, "Error in poll system call, {}", e),
            Error::SocketIo(ref e) => write!(f, "Socket I/O error, {}", e),
            Error::SocketTimeout => write!(f, "Time-out on socket I/O"),
            Error::SpawnThread(ref e) => write!(f, "Unable to spawn thread, {}", e),
            Error::WorkerCreate(ref name) => write!(f, "Unable to create worker '{}'", name),
            Error::WorkerAck => write!(f, "Worker supervisor did not acknowledge command"),
            Error::Wait(ref e) => write!(f, "Unable to wait for child process, {}", e),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::ChannelClosed => "IPC channel closed by peer",
            Error::ChannelFull => "IPC channel queue full",
            Error::AtCommand(_) => "AT command rejected by modem",
            Error::CreatePipe(_) => "unable to create pipe",
            Error::Fork(_) => "unable to fork",
            Error::FileIo(_) => "file I/O error",
            Error::Poll(_) => "error in poll system call",
            Error::SocketIo(_) => "socket I/O error",
            Error::SocketTimeout => "time-out on socket I/O",
            Error::SpawnThread(_) => "unable to spawn thread",
            Error::WorkerCreate(_) => "unable to create worker",
            Error::WorkerAck => "worker supervisor did not acknowledge command",
            Error::Wait(_) => "unable to wait for child process",
        }
    }
}
