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

//! Client library for the CRM daemon.
//!
//! A [`MdmClient`] owns one connection to a `crm<instance>` socket.
//! After REGISTER, a background thread polls the socket and dispatches
//! subscribed events to the caller's callback. When the connection
//! breaks, the thread synthesizes `MDM_DOWN` and `MDM_COLD_RESET` to
//! the subscriber (the modem must be assumed gone) and reconnects with
//! a 1 s backoff, replaying REGISTER and any outstanding ACQUIRE.

extern crate crm_core;
extern crate crm_protocol as protocol;
extern crate libc;
#[macro_use]
extern crate log;

pub mod error;

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use crm_core::ipc::{Channel, Kind, Msg};
use protocol::{DbgInfo, EventKind, Events, Message, RestartCause};
use protocol::wire;

pub use error::{Error, Result};

const RECONNECT_BACKOFF_MS: libc::c_int = 1000;

/// Callback invoked by the dispatch thread for every subscribed event.
pub type EventCallback = Box<Fn(EventKind, Option<&DbgInfo>) + Send + Sync + 'static>;

struct State {
    stream: Option<UnixStream>,
    reconnect: bool,
    acquired: bool,
}

struct Inner {
    run_dir: PathBuf,
    socket: String,
    name: String,
    events: Events,
    debug_register: bool,
    state: Mutex<State>,
    callback: EventCallback,
}

pub struct MdmClient {
    inner: Arc<Inner>,
    ctrl: Channel,
    thread: Option<JoinHandle<()>>,
}

impl MdmClient {
    /// Connect and REGISTER under `name`, subscribing to `events`.
    pub fn connect<F>(
        run_dir: &Path,
        instance: u32,
        name: &str,
        events: Events,
        callback: F,
    ) -> Result<MdmClient>
    where
        F: Fn(EventKind, Option<&DbgInfo>) + Send + Sync + 'static,
    {
        Self::connect_internal(run_dir, instance, name, events, false, Box::new(callback))
    }

    /// Connect with REGISTER_DBG. Only accepted by the daemon when its
    /// debug property is set; meant for test tooling.
    pub fn connect_dbg<F>(
        run_dir: &Path,
        instance: u32,
        name: &str,
        events: Events,
        callback: F,
    ) -> Result<MdmClient>
    where
        F: Fn(EventKind, Option<&DbgInfo>) + Send + Sync + 'static,
    {
        Self::connect_internal(run_dir, instance, name, events, true, Box::new(callback))
    }

    fn connect_internal(
        run_dir: &Path,
        instance: u32,
        name: &str,
        events: Events,
        debug_register: bool,
        callback: EventCallback,
    ) -> Result<MdmClient> {
        if name.is_empty() || name.len() > protocol::message::NAME_LEN {
            return Err(Error::BadName(name.to_string()));
        }
        let socket = protocol::socket_name(instance);
        let stream = crm_core::socket::connect(run_dir, &socket)?;
        let inner = Arc::new(Inner {
            run_dir: run_dir.to_path_buf(),
            socket: socket,
            name: name.to_string(),
            events: events,
            debug_register: debug_register,
            state: Mutex::new(State {
                stream: Some(stream),
                reconnect: false,
                acquired: false,
            }),
            callback: callback,
        });
        register(&inner)?;
        let ctrl = Channel::new(Kind::Thread)?;
        let thread = {
            let inner = inner.clone();
            let ctrl = ctrl.clone();
            thread::Builder::new()
                .name(format!("mdmcli-{}", name))
                .spawn(move || event_loop(inner, ctrl))
                .map_err(crm_core::Error::SpawnThread)?
        };
        Ok(MdmClient {
            inner: inner,
            ctrl: ctrl,
            thread: Some(thread),
        })
    }

    /// State the modem is needed; CRM powers it on if this is the
    /// first outstanding acquire.
    pub fn acquire(&self) -> Result<()> {
        self.send_tracked(Message::Acquire, Some(true))
    }

    /// Drop this client's hold on the modem.
    pub fn release(&self) -> Result<()> {
        self.send_tracked(Message::Release, Some(false))
    }

    /// Request a modem restart, optionally attaching debug info that
    /// CRM broadcasts to every subscribed client.
    pub fn restart(&self, cause: RestartCause, debug: Option<DbgInfo>) -> Result<()> {
        self.send_tracked(
            Message::Restart {
                cause: cause,
                debug: debug,
            },
            None,
        )
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_tracked(Message::Shutdown, None)
    }

    pub fn nvm_backup(&self) -> Result<()> {
        self.send_tracked(Message::NvmBackup, None)
    }

    pub fn ack_cold_reset(&self) -> Result<()> {
        self.send_tracked(Message::AckColdReset, None)
    }

    pub fn ack_shutdown(&self) -> Result<()> {
        self.send_tracked(Message::AckShutdown, None)
    }

    pub fn notify_dbg(&self, debug: DbgInfo) -> Result<()> {
        self.send_tracked(Message::NotifyDbg(Some(debug)), None)
    }

    /// Close the connection and stop the dispatch thread.
    pub fn disconnect(mut self) {
        self.shutdown_thread();
    }

    fn send_tracked(&self, msg: Message, acquired: Option<bool>) -> Result<()> {
        let mut state = self.inner.state.lock().expect("client state poisoned");
        if let Some(acquired) = acquired {
            state.acquired = acquired;
        }
        if state.reconnect {
            debug!("[{}] => {} [ignored]", self.inner.name, msg);
            return Err(Error::NotConnected);
        }
        let fd = match state.stream {
            Some(ref stream) => stream.as_raw_fd(),
            None => return Err(Error::NotConnected),
        };
        debug!("[{}] => {}", self.inner.name, msg);
        wire::send(fd, &msg)?;
        Ok(())
    }

    fn shutdown_thread(&mut self) {
        self.ctrl.send(Msg::scalar(0)).ok();
        self.ctrl.close();
        if let Some(handle) = self.thread.take() {
            handle.join().ok();
        }
        let mut state = self.inner.state.lock().expect("client state poisoned");
        state.stream = None;
    }
}

impl Drop for MdmClient {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_thread();
        }
    }
}

fn register(inner: &Inner) -> Result<()> {
    let state = inner.state.lock().expect("client state poisoned");
    let fd = match state.stream {
        Some(ref stream) => stream.as_raw_fd(),
        None => return Err(Error::NotConnected),
    };
    let msg = if inner.debug_register {
        Message::RegisterDbg {
            events: inner.events,
            name: inner.name.clone(),
        }
    } else {
        Message::Register {
            events: inner.events,
            name: inner.name.clone(),
        }
    };
    debug!("[{}] => {}(0x{:08x})", inner.name, msg, inner.events.bits());
    wire::send(fd, &msg)?;
    Ok(())
}

fn dispatch(inner: &Inner, kind: EventKind, debug: Option<&DbgInfo>) {
    if inner.events.contains(kind.flag()) {
        debug!("[{}] <= {}", inner.name, kind);
        (inner.callback)(kind, debug);
    }
}

/// The server socket broke: surface the loss to the subscriber and
/// schedule a reconnect.
fn handle_error(inner: &Inner) {
    {
        let mut state = inner.state.lock().expect("client state poisoned");
        state.stream = None;
        state.reconnect = true;
    }
    warn!("[{}] lost connection to CRM server", inner.name);
    dispatch(inner, EventKind::Down, None);
    dispatch(inner, EventKind::ColdReset, None);
}

fn reconnect(inner: &Inner) {
    let stream = match crm_core::socket::connect(&inner.run_dir, &inner.socket) {
        Ok(stream) => stream,
        Err(_) => return,
    };
    let mut state = inner.state.lock().expect("client state poisoned");
    state.stream = Some(stream);
    state.reconnect = false;
    drop(state);
    if register(inner).is_err() {
        handle_silent_error(inner);
        return;
    }
    let acquired = inner
        .state
        .lock()
        .expect("client state poisoned")
        .acquired;
    if acquired {
        let state = inner.state.lock().expect("client state poisoned");
        if let Some(ref stream) = state.stream {
            if wire::send(stream.as_raw_fd(), &Message::Acquire).is_err() {
                drop(state);
                handle_silent_error(inner);
                return;
            }
        }
    }
    debug!("[{}] reconnected to CRM server", inner.name);
}

/// Like `handle_error` but without callbacks; used when a reconnect
/// attempt fails half-way (the loss was already reported).
fn handle_silent_error(inner: &Inner) {
    let mut state = inner.state.lock().expect("client state poisoned");
    state.stream = None;
    state.reconnect = true;
}

fn event_loop(inner: Arc<Inner>, ctrl: Channel) {
    loop {
        let (sock_fd, reconnecting) = {
            let state = inner.state.lock().expect("client state poisoned");
            (
                state.stream.as_ref().map(|s| s.as_raw_fd()),
                state.reconnect,
            )
        };
        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(2);
        pfds.push(libc::pollfd {
            fd: ctrl.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let timeout = if reconnecting || sock_fd.is_none() {
            RECONNECT_BACKOFF_MS
        } else {
            pfds.push(libc::pollfd {
                fd: sock_fd.unwrap(),
                events: libc::POLLIN,
                revents: 0,
            });
            -1
        };
        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            let err = ::std::io::Error::last_os_error();
            if err.kind() == ::std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("[{}] poll failed, {}", inner.name, err);
            return;
        }
        if ret == 0 {
            reconnect(&inner);
            continue;
        }
        // Stop request or control channel teardown.
        if pfds[0].revents != 0 {
            return;
        }
        if pfds.len() < 2 {
            continue;
        }
        if pfds[1].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            handle_error(&inner);
            continue;
        }
        if pfds[1].revents & libc::POLLIN != 0 {
            match read_event(pfds[1].fd) {
                Ok((kind, debug)) => dispatch(&inner, kind, debug.as_ref()),
                Err(_) => handle_error(&inner),
            }
        }
    }
}

fn read_event(fd: RawFd) -> protocol::Result<(EventKind, Option<DbgInfo>)> {
    match wire::recv(fd)? {
        Message::Event(kind) => Ok((kind, None)),
        Message::DbgInfo(debug) => Ok((EventKind::DbgInfo, debug)),
        other => Err(protocol::Error::Direction(other.id())),
    }
}
