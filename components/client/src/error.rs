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
use std::result;

use crm_core;
use protocol;

#[derive(Debug)]
pub enum Error {
    /// The connection to the daemon is down; the request was not sent.
    NotConnected,
    /// The client name exceeds the protocol bound.
    BadName(String),
    Core(crm_core::Error),
    Protocol(protocol::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NotConnected => write!(f, "not connected to CRM server"),
            Error::BadName(ref name) => write!(f, "invalid client name '{}'", name),
            Error::Core(ref e) => write!(f, "{}", e),
            Error::Protocol(ref e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::NotConnected => "not connected to CRM server",
            Error::BadName(_) => "invalid client name",
            Error::Core(_) => "system error",
            Error::Protocol(_) => "protocol error",
        }
    }
}

impl From<crm_core::Error> for Error {
    fn from(err: crm_core::Error) -> Error {
        Error::Core(err)
    }
}

impl From<protocol::Error> for Error {
    fn from(err: protocol::Error) -> Error {
        Error::Protocol(err)
    }
}
