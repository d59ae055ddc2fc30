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

//! Worker-process factory.
//!
//! Long-running or crash-prone subtasks (firmware flashing, core dump
//! extraction) run in their own OS processes so a fault in one of them
//! cannot corrupt the daemon. The factory forks one internal
//! *supervisor* process at init; the supervisor owns all worker
//! fork/wait logic, keeping `SIGCHLD` and pipe management out of the
//! daemon's main process. Commands travel to the supervisor over a
//! control channel, create acknowledgements come back over an event
//! channel.
//!
//! Workers are selected from a closed registry of entry points by
//! name. Every worker entry has the signature
//! `fn(ipc_in, ipc_out, init_bytes)`: it loops on `ipc_in`, publishes
//! progress on `ipc_out`, and must terminate promptly once `ipc_in`'s
//! poll fd signals hangup.

use std::io;
use std::os::unix::io::RawFd;
use std::process;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

use libc;

use error::{Error, Result};
use ipc::{Channel, Kind, Msg};

/// Entry point of a worker process.
pub type WorkerFn = fn(&Channel, &Channel, &[u8]);

/// Closed registry of worker entry points, selected by name.
pub type Registry = &'static [(&'static str, WorkerFn)];

/// A worker that died without being killed or cleaned within this
/// budget is a bug in the parent; the supervisor aborts.
const CLEAN_WATCHDOG_MS: libc::c_int = 500;

/// How long the parent waits for the supervisor to acknowledge a
/// `Create` command.
const CREATE_ACK_MS: libc::c_int = 30_000;

const CMD_CREATE: i64 = 0;
const CMD_CLEAN: i64 = 1;
const CMD_KILL: i64 = 2;
const CMD_DEAD: i64 = 3;
const CMD_DISPOSE: i64 = 4;

const FLAG_CLEAN: u32 = 1 << CMD_CLEAN;
const FLAG_KILL: u32 = 1 << CMD_KILL;
const FLAG_DEAD: u32 = 1 << CMD_DEAD;

fn gen_scalar(cmd: i64, id: usize) -> i64 {
    ((id as i64) & 0x7FFF_FFFF) << 8 | (cmd & 0xFF)
}

fn scalar_cmd(scalar: i64) -> i64 {
    scalar & 0xFF
}

fn scalar_id(scalar: i64) -> usize {
    ((scalar >> 8) & 0x7FFF_FFFF) as usize
}

struct Slot {
    p2c: Channel,
    c2p: Channel,
}

pub struct ProcessFactory {
    slots: Vec<Slot>,
    ctrl: Channel,
    evt: Channel,
    supervisor_pid: libc::pid_t,
    create_lock: Mutex<()>,
}

impl ProcessFactory {
    /// Fork the supervisor and return the parent-side handle.
    ///
    /// Must be called before the process grows threads or opens
    /// descriptors the workers should not inherit.
    pub fn init(nb: usize, registry: Registry) -> Result<ProcessFactory> {
        let ctrl = Channel::new(Kind::Process)?;
        let evt = Channel::new(Kind::Process)?;
        let mut slots = Vec::with_capacity(nb);
        for _ in 0..nb {
            slots.push(Slot {
                p2c: Channel::new(Kind::Process)?,
                c2p: Channel::new(Kind::Process)?,
            });
        }
        let parent_pid = unsafe { libc::getpid() };
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::Fork(io::Error::last_os_error()));
        }
        if pid == 0 {
            let supervisor = Supervisor {
                registry: registry,
                ctrl: ctrl,
                evt: evt,
                parent_pid: parent_pid,
                workers: slots
                    .into_iter()
                    .map(|slot| SupWorker {
                        slot: slot,
                        pid: -1,
                        events: 0,
                    })
                    .collect(),
            };
            supervisor.run();
        }
        debug!("worker supervisor started, pid[{}]", pid);
        Ok(ProcessFactory {
            slots: slots,
            ctrl: ctrl,
            evt: evt,
            supervisor_pid: pid,
            create_lock: Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Spawn a worker process running the registered entry point
    /// `name`, handing it `init` as start-up payload. Returns the
    /// worker id, reusable after the worker is reaped.
    pub fn create(&self, name: &str, init: &[u8]) -> Result<usize> {
        let _guard = self.create_lock.lock().expect("factory create lock poisoned");
        debug!("creating worker '{}'", name);
        let mut payload = Vec::with_capacity(name.len() + 1 + init.len());
        payload.extend_from_slice(name.as_bytes());
        payload.push(b';');
        payload.extend_from_slice(init);
        self.ctrl
            .send(Msg::with_data(gen_scalar(CMD_CREATE, 0), payload))?;
        if !poll_readable(self.evt.poll_fd(), CREATE_ACK_MS) {
            return Err(Error::WorkerAck);
        }
        match self.evt.try_get() {
            Some(msg) if msg.scalar >= 0 => Ok(msg.scalar as usize),
            Some(_) => Err(Error::WorkerCreate(name.to_string())),
            None => Err(Error::WorkerAck),
        }
    }

    /// Acknowledge that the last message of a finished worker has been
    /// read, allowing the supervisor to reap it and free its id.
    pub fn clean(&self, id: usize) -> Result<()> {
        debug!("cleaning worker id[{}]", id);
        self.ctrl.send(Msg::scalar(gen_scalar(CMD_CLEAN, id)))
    }

    /// Kill a worker. Its pipes are drained and its id freed once the
    /// supervisor observes the death.
    pub fn kill(&self, id: usize) -> Result<()> {
        debug!("killing worker id[{}]", id);
        self.ctrl.send(Msg::scalar(gen_scalar(CMD_KILL, id)))
    }

    /// Poll fd of the worker's child-to-parent channel.
    pub fn poll_fd(&self, id: usize) -> RawFd {
        self.slots[id].c2p.poll_fd()
    }

    pub fn send(&self, id: usize, msg: Msg) -> Result<()> {
        self.slots[id].p2c.send(msg)
    }

    pub fn try_get(&self, id: usize) -> Option<Msg> {
        self.slots[id].c2p.try_get()
    }

    /// Stop the factory: kill every remaining worker and wait for the
    /// supervisor process to finish.
    pub fn dispose(self) {
        self.ctrl.send(Msg::scalar(gen_scalar(CMD_DISPOSE, 0))).ok();
        debug!(
            "waiting for supervisor termination, pid[{}]",
            self.supervisor_pid
        );
        let mut status: libc::c_int = 0;
        loop {
            let pid = unsafe { libc::waitpid(self.supervisor_pid, &mut status, 0) };
            if pid == self.supervisor_pid {
                break;
            }
            if pid < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------
// Everything below runs in the forked supervisor process.
// ---------------------------------------------------------------------

static SUP_CTRL_WFD: AtomicI32 = AtomicI32::new(-1);

/// Only writes one frame to the control pipe; the supervisor loop does
/// the actual reaping.
extern "C" fn sigchld_handler(_sig: libc::c_int) {
    let fd = SUP_CTRL_WFD.load(Ordering::SeqCst);
    if fd >= 0 {
        let mut frame = [0u8; 16];
        frame[0] = CMD_DEAD as u8;
        unsafe {
            libc::write(fd, frame.as_ptr() as *const libc::c_void, frame.len());
        }
    }
}

struct SupWorker {
    slot: Slot,
    pid: libc::pid_t,
    events: u32,
}

struct Supervisor {
    registry: Registry,
    ctrl: Channel,
    evt: Channel,
    parent_pid: libc::pid_t,
    workers: Vec<SupWorker>,
}

impl Supervisor {
    fn run(mut self) -> ! {
        // The handler needs the raw control pipe so a frame can be
        // emitted from signal context without taking any lock.
        SUP_CTRL_WFD.store(self.ctrl_write_fd(), Ordering::SeqCst);
        unsafe {
            let mut action: libc::sigaction = ::std::mem::zeroed();
            action.sa_sigaction = sigchld_handler as usize;
            libc::sigaction(libc::SIGCHLD, &action, ::std::ptr::null_mut());
        }
        let code = self.event_loop();
        process::exit(code);
    }

    fn ctrl_write_fd(&self) -> RawFd {
        self.ctrl.write_fd()
    }

    fn event_loop(&mut self) -> i32 {
        let mut stopping = false;
        loop {
            let timeout = if self.has_unclaimed_death() {
                CLEAN_WATCHDOG_MS
            } else {
                -1
            };
            let mut pfd = libc::pollfd {
                fd: self.ctrl.poll_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR)
                    || err.raw_os_error() == Some(libc::ECHILD)
                {
                    continue;
                }
                error!("supervisor poll failed, {}", err);
                self.kill_workers();
                return 1;
            }
            if ret == 0 {
                for (id, worker) in self.workers.iter().enumerate() {
                    if worker.pid > 0 && worker.events & FLAG_DEAD != 0 {
                        error!("timeout, worker id[{}] died but was never cleaned", id);
                    }
                }
                process::abort();
            }
            if pfd.revents & libc::POLLIN == 0 {
                // Control pipe hangup: the daemon is gone. Take the
                // workers down with us.
                self.kill_workers();
                return 1;
            }
            let msg = match self.ctrl.try_get() {
                Some(msg) => msg,
                None => {
                    self.kill_workers();
                    return 1;
                }
            };
            match scalar_cmd(msg.scalar) {
                CMD_CREATE => self.on_create(msg),
                CMD_CLEAN => self.on_clean(scalar_id(msg.scalar)),
                CMD_KILL => self.on_kill(scalar_id(msg.scalar)),
                CMD_DEAD => {
                    if !self.on_dead() {
                        return 1;
                    }
                }
                CMD_DISPOSE => {
                    stopping = true;
                    for (id, worker) in self.workers.iter_mut().enumerate() {
                        if worker.pid > 0 {
                            worker.events |= FLAG_KILL;
                            unsafe {
                                libc::kill(worker.pid, libc::SIGKILL);
                            }
                            debug!("worker {{id[{}],pid[{}]}} killed", id, worker.pid);
                        }
                    }
                }
                cmd => {
                    error!("command {} not supported", cmd);
                    process::abort();
                }
            }
            if stopping && !self.workers.iter().any(|w| w.pid > 0) {
                return 0;
            }
        }
    }

    fn has_unclaimed_death(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.pid > 0 && w.events & FLAG_DEAD != 0)
    }

    fn on_create(&mut self, msg: Msg) {
        let id = self.spawn(msg);
        let ack = Msg::scalar(id.map(|id| id as i64).unwrap_or(-1));
        if self.evt.send(ack).is_err() {
            error!("unable to acknowledge worker creation");
        }
    }

    fn spawn(&mut self, msg: Msg) -> Option<usize> {
        let payload = msg.data.unwrap_or_default();
        let sep = match payload.iter().position(|&b| b == b';') {
            Some(sep) => sep,
            None => return None,
        };
        let name = String::from_utf8_lossy(&payload[..sep]).into_owned();
        let entry = match self.registry.iter().find(|&&(n, _)| n == name) {
            Some(&(_, entry)) => entry,
            None => {
                error!("worker '{}' not present in registry", name);
                return None;
            }
        };
        let id = match self.workers.iter().position(|w| w.pid == -1) {
            Some(id) => id,
            None => return None,
        };
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            error!("unable to fork worker, {}", io::Error::last_os_error());
            return None;
        }
        if pid == 0 {
            unsafe {
                let mut action: libc::sigaction = ::std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(libc::SIGCHLD, &action, ::std::ptr::null_mut());
            }
            let worker = &self.workers[id];
            entry(&worker.slot.p2c, &worker.slot.c2p, &payload[sep + 1..]);
            process::exit(0);
        }
        self.workers[id].pid = pid;
        self.workers[id].events = 0;
        debug!("worker {{id[{}],pid[{}]}} started", id, pid);
        Some(id)
    }

    fn on_clean(&mut self, id: usize) {
        if id >= self.workers.len() || self.workers[id].pid <= 0 {
            return;
        }
        if self.workers[id].events & FLAG_DEAD != 0 {
            self.reap(id);
        } else {
            self.workers[id].events |= FLAG_CLEAN;
        }
    }

    fn on_kill(&mut self, id: usize) {
        if id >= self.workers.len() || self.workers[id].pid <= 0 {
            return;
        }
        if self.workers[id].events & FLAG_DEAD != 0 {
            self.reap(id);
        } else {
            debug!(
                "worker {{id[{}],pid[{}]}} killed",
                id, self.workers[id].pid
            );
            self.workers[id].events |= FLAG_KILL;
            unsafe {
                libc::kill(self.workers[id].pid, libc::SIGKILL);
            }
        }
    }

    /// Reap every exited child. Returns false when the supervisor must
    /// fail fast because a worker died behind the daemon's back.
    fn on_dead(&mut self) -> bool {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                return true;
            }
            let id = match self.workers.iter().position(|w| w.pid == pid) {
                Some(id) => id,
                None => continue,
            };
            debug!("worker {{id[{}],pid[{}]}} stopped", id, pid);
            let events = self.workers[id].events;
            if events & (FLAG_KILL | FLAG_CLEAN) != 0 {
                self.reap(id);
            } else if unsafe { libc::WIFSIGNALED(status) } {
                // A worker crashed while the daemon still believed it
                // was healthy. Nothing downstream can be trusted:
                // terminate the whole process group.
                error!(
                    "worker {{id[{}],pid[{}]}} died from a signal, failing fast",
                    id, pid
                );
                unsafe {
                    libc::kill(self.parent_pid, libc::SIGKILL);
                }
                self.kill_workers();
                return false;
            } else {
                self.workers[id].events |= FLAG_DEAD;
            }
        }
    }

    /// Free a worker slot: drain both channels so no stale message can
    /// leak into the next worker using this id.
    fn reap(&mut self, id: usize) {
        {
            let worker = &self.workers[id];
            for channel in &[&worker.slot.p2c, &worker.slot.c2p] {
                while poll_readable(channel.poll_fd(), 0) {
                    if channel.try_get().is_none() {
                        break;
                    }
                }
            }
        }
        self.workers[id].pid = -1;
        self.workers[id].events = 0;
    }

    fn kill_workers(&mut self) {
        for worker in &mut self.workers {
            if worker.pid > 0 {
                unsafe {
                    libc::kill(worker.pid, libc::SIGKILL);
                }
                worker.pid = -1;
            }
        }
    }
}

fn poll_readable(fd: RawFd, timeout_ms: libc::c_int) -> bool {
    let mut pfd = libc::pollfd {
        fd: fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret >= 0 {
            return ret > 0 && (pfd.revents & (libc::POLLIN | libc::POLLHUP)) != 0;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return false;
        }
    }
}
