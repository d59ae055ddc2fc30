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

use crm_core;
use protocol;
use toml;

#[derive(Debug)]
pub enum Error {
    ConfigIo(io::Error),
    ConfigParse(toml::de::Error),
    /// Configuration names a HAL variant absent from the registry.
    UnknownHal(String),
    Core(crm_core::Error),
    Protocol(protocol::Error),
    /// An internal invariant was violated; the daemon must abort and
    /// let the service manager restart it.
    Fatal(&'static str),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ConfigIo(ref e) => write!(f, "Unable to read configuration, {}", e),
            Error::ConfigParse(ref e) => write!(f, "Unable to parse configuration, {}", e),
            Error::UnknownHal(ref name) => write!(f, "Unknown HAL variant '{}'", name),
            Error::Core(ref e) => write!(f, "{}", e),
            Error::Protocol(ref e) => write!(f, "{}", e),
            Error::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::ConfigIo(_) => "unable to read configuration",
            Error::ConfigParse(_) => "unable to parse configuration",
            Error::UnknownHal(_) => "unknown HAL variant",
            Error::Core(_) => "system error",
            Error::Protocol(_) => "protocol error",
            Error::Fatal(_) => "fatal error",
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
