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

//! The supervision engine's event loop.
//!
//! Single-threaded and cooperative: one poll set over the self-pipe,
//! the HAL event stream, the worker and task channels, the client
//! listen socket and every client connection. Components never call
//! each other back directly; the loop routes typed events into the
//! control machine, executes the effects it returns, and feeds client
//! intent in as requests. Dispatch order within a cycle: internal
//! wake-ups, HAL events, worker completions, client sockets.

pub mod clients;
pub mod control;
pub mod hal;
pub mod workers;

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc;
use time::{Duration, SteadyTime};

use crm_core;
use crm_core::at;
use crm_core::factory::ProcessFactory;
use crm_core::file;
use crm_core::ipc::Msg;
use crm_core::property;
use crm_core::socket;
use crm_core::thread::WorkerThread;
use protocol::{self, DbgInfo, DbgType, EventKind};

use config::Config;
use error::{Error, Result};
use manager::clients::{Clients, CtrlRequest};
use manager::control::{Control, CtrlEvent, Effect, ModemState};
use manager::hal::{Hal, HalEventKind};

/// Countdown property for host runs: each value above zero makes one
/// firmware upload fail and is decremented.
pub const KEY_STUB_FW_FAIL: &'static str = "crm.stub.fw_fail";

enum Source {
    Wakeup,
    HalEvents,
    Mux,
    Nvm,
    Configure,
    Custo,
    FwWorker(usize),
    DumpWorker(usize),
    Listen,
    Client(u64),
}

/// Writes one byte into the manager's self-pipe; safe to use from a
/// signal handler.
#[derive(Clone, Copy)]
pub struct ShutdownHandle {
    fd: RawFd,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let byte = [0u8; 1];
        unsafe {
            libc::write(self.fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

pub struct Manager {
    config: Config,
    factory: ProcessFactory,
    hal: Box<Hal>,
    control: Control,
    clients: Clients,
    nvm: Option<WorkerThread>,
    configure: Option<WorkerThread>,
    custo: Option<WorkerThread>,
    fw_worker: Option<usize>,
    dump_worker: Option<usize>,
    ctrl_deadline: Option<SteadyTime>,
    wake_r: RawFd,
    wake_w: RawFd,
    fatal: Option<&'static str>,
    stopping: bool,
}

impl Manager {
    /// Build a manager with the HAL variant named by the
    /// configuration.
    pub fn new(config: Config, factory: ProcessFactory) -> Result<Manager> {
        let hal = hal::init(&config)?;
        Manager::with_hal(config, factory, hal)
    }

    /// Build a manager around an explicit HAL instance (host tests
    /// inject a stub with a fault handle here).
    pub fn with_hal(config: Config, factory: ProcessFactory, hal: Box<Hal>) -> Result<Manager> {
        let listener = socket::listen(
            &config.daemon.run_dir,
            &protocol::socket_name(config.instance),
        )?;
        let clients = Clients::new(listener, &config);
        let control = Control::new(&config);
        let nvm = workers::nvm::spawn(&config)?;
        let mut fds: [libc::c_int; 2] = [-1; 2];
        unsafe {
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                return Err(Error::Core(crm_core::Error::CreatePipe(
                    io::Error::last_os_error(),
                )));
            }
        }
        Ok(Manager {
            config: config,
            factory: factory,
            hal: hal,
            control: control,
            clients: clients,
            nvm: Some(nvm),
            configure: None,
            custo: None,
            fw_worker: None,
            dump_worker: None,
            ctrl_deadline: None,
            wake_r: fds[0],
            wake_w: fds[1],
            fatal: None,
            stopping: false,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { fd: self.wake_w }
    }

    /// Run the event loop until a shutdown request or a fatal error.
    pub fn run(&mut self) -> Result<i32> {
        info!(
            "CRM instance {} ready on '{}'",
            self.config.instance,
            protocol::socket_name(self.config.instance)
        );
        // The modem starts off; seed the client abstraction so early
        // registrations learn the state immediately.
        self.clients.notify_modem_state(ModemState::Off);
        loop {
            loop {
                let requests = self.clients.take_requests();
                if requests.is_empty() {
                    break;
                }
                for request in requests {
                    self.dispatch_request(request);
                }
            }
            if let Some(msg) = self.fatal {
                self.teardown();
                return Err(Error::Fatal(msg));
            }
            if self.stopping {
                self.teardown();
                return Ok(0);
            }

            let (mut pfds, sources) = self.poll_set();
            let timeout = self.poll_timeout();
            let ret = unsafe {
                libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.teardown();
                return Err(Error::Core(crm_core::Error::Poll(err)));
            }

            self.dispatch_timeouts();

            for (pfd, source) in pfds.iter().zip(sources.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                let broken =
                    pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
                let readable = pfd.revents & libc::POLLIN != 0;
                match *source {
                    Source::Wakeup => {
                        let mut byte = [0u8; 1];
                        unsafe {
                            libc::read(self.wake_r, byte.as_mut_ptr() as *mut libc::c_void, 1);
                        }
                        info!("shutdown requested");
                        self.stopping = true;
                    }
                    Source::HalEvents => {
                        while let Some(event) = self.hal.try_event() {
                            let evt = match event.kind {
                                HalEventKind::Off => CtrlEvent::MdmOff,
                                HalEventKind::FlashReady => CtrlEvent::MdmFlashReady {
                                    nodes: event.nodes,
                                },
                                HalEventKind::Run => CtrlEvent::MdmRun,
                                HalEventKind::Crash => CtrlEvent::MdmCrash,
                                HalEventKind::DumpReady => CtrlEvent::MdmDumpReady {
                                    nodes: event.nodes,
                                },
                                HalEventKind::LinkDown => CtrlEvent::MdmLinkDown,
                                HalEventKind::Unresponsive => CtrlEvent::MdmUnresponsive {
                                    debug: event.debug,
                                },
                            };
                            self.feed(evt);
                        }
                    }
                    Source::Mux => {
                        self.feed(CtrlEvent::MuxHangup);
                    }
                    Source::Nvm => {
                        let msg = self.nvm.as_ref().and_then(|nvm| nvm.try_get());
                        if let Some(msg) = msg {
                            match msg.scalar {
                                workers::MSG_NVM_RUNNING => self.feed(CtrlEvent::NvmRun),
                                workers::MSG_NVM_STOPPED => self.feed(CtrlEvent::NvmStop),
                                other => warn!("unknown NVM message {}", other),
                            }
                        }
                    }
                    Source::Configure => {
                        let msg = self.configure.as_ref().and_then(|t| t.try_get());
                        if let Some(thread) = self.configure.take() {
                            thread.dispose();
                        }
                        match msg.map(|m| m.scalar) {
                            Some(workers::MSG_CFG_DONE) => self.feed(CtrlEvent::MdmConfigured),
                            // Configuration failure follows the same
                            // corrective path as its timer expiring.
                            _ => {
                                self.ctrl_deadline = None;
                                self.feed(CtrlEvent::Timeout);
                            }
                        }
                    }
                    Source::Custo => {
                        let msg = self.custo.as_ref().and_then(|t| t.try_get());
                        if let Some(thread) = self.custo.take() {
                            thread.dispose();
                        }
                        let success = msg.map(|m| m.scalar) == Some(workers::MSG_CUSTO_DONE);
                        self.feed(CtrlEvent::CustomizationDone { success: success });
                    }
                    Source::FwWorker(id) => {
                        if readable {
                            match self.factory.try_get(id).map(|m| m.scalar) {
                                Some(workers::MSG_FW_PACKAGED) => {
                                    self.feed(CtrlEvent::FwPackaged { success: true });
                                }
                                Some(workers::MSG_FW_FLASHED) => {
                                    self.finish_fw_worker(id, true);
                                }
                                _ => self.finish_fw_worker(id, false),
                            }
                        } else if broken {
                            self.finish_fw_worker(id, false);
                        }
                    }
                    Source::DumpWorker(id) => {
                        if readable {
                            let success = self.factory.try_get(id).map(|m| m.scalar)
                                == Some(workers::MSG_DUMP_DONE);
                            self.finish_dump_worker(id, success);
                        } else if broken {
                            self.finish_dump_worker(id, false);
                        }
                    }
                    Source::Listen => self.clients.on_listen_ready(),
                    Source::Client(token) => {
                        if readable {
                            self.clients.on_client_ready(token);
                        } else if broken {
                            self.clients.disconnect(token);
                        }
                    }
                }
            }
        }
    }

    /// Release every resource; called on the way out of `run`.
    fn teardown(&mut self) {
        if let Some(id) = self.fw_worker.take() {
            self.factory.kill(id).ok();
        }
        if let Some(id) = self.dump_worker.take() {
            self.factory.kill(id).ok();
        }
        if let Some(thread) = self.configure.take() {
            thread.dispose();
        }
        if let Some(thread) = self.custo.take() {
            thread.dispose();
        }
        if let Some(thread) = self.nvm.take() {
            thread.dispose();
        }
        self.hal.dispose();
    }

    /// Consume the manager, disposing of the worker factory.
    pub fn dispose(self) {
        unsafe {
            libc::close(self.wake_r);
            libc::close(self.wake_w);
        }
        self.factory.dispose();
    }

    fn poll_set(&self) -> (Vec<libc::pollfd>, Vec<Source>) {
        let mut pfds = Vec::new();
        let mut sources = Vec::new();
        let push = |fd: RawFd, source: Source, pfds: &mut Vec<libc::pollfd>,
                    sources: &mut Vec<Source>| {
            pfds.push(libc::pollfd {
                fd: fd,
                events: libc::POLLIN,
                revents: 0,
            });
            sources.push(source);
        };
        push(self.wake_r, Source::Wakeup, &mut pfds, &mut sources);
        push(self.hal.poll_fd(), Source::HalEvents, &mut pfds, &mut sources);
        if let Some(fd) = self.hal.mux_fd() {
            push(fd, Source::Mux, &mut pfds, &mut sources);
        }
        if let Some(ref nvm) = self.nvm {
            push(nvm.poll_fd(), Source::Nvm, &mut pfds, &mut sources);
        }
        if let Some(ref thread) = self.configure {
            push(thread.poll_fd(), Source::Configure, &mut pfds, &mut sources);
        }
        if let Some(ref thread) = self.custo {
            push(thread.poll_fd(), Source::Custo, &mut pfds, &mut sources);
        }
        if let Some(id) = self.fw_worker {
            push(self.factory.poll_fd(id), Source::FwWorker(id), &mut pfds, &mut sources);
        }
        if let Some(id) = self.dump_worker {
            push(self.factory.poll_fd(id), Source::DumpWorker(id), &mut pfds, &mut sources);
        }
        push(self.clients.listen_fd(), Source::Listen, &mut pfds, &mut sources);
        for (token, fd) in self.clients.client_fds() {
            push(fd, Source::Client(token), &mut pfds, &mut sources);
        }
        (pfds, sources)
    }

    /// Nearest armed deadline, as a poll timeout.
    fn poll_timeout(&self) -> libc::c_int {
        let deadline = match (self.ctrl_deadline, self.clients.next_deadline()) {
            (Some(a), Some(b)) => Some(if a < b { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match deadline {
            Some(deadline) => {
                let remain = (deadline - SteadyTime::now()).num_milliseconds();
                if remain <= 0 {
                    0
                } else {
                    remain as libc::c_int
                }
            }
            None => -1,
        }
    }

    fn dispatch_timeouts(&mut self) {
        let now = SteadyTime::now();
        if let Some(deadline) = self.ctrl_deadline {
            if deadline <= now {
                self.ctrl_deadline = None;
                self.feed(CtrlEvent::Timeout);
            }
        }
        self.clients.on_timeout(now);
    }

    fn dispatch_request(&mut self, request: CtrlRequest) {
        let evt = match request {
            CtrlRequest::Start => CtrlEvent::Power,
            CtrlRequest::Stop => CtrlEvent::Stop,
            CtrlRequest::Restart { kind, debug } => CtrlEvent::Reset {
                kind: kind,
                debug: debug,
            },
        };
        self.feed(evt);
    }

    fn feed(&mut self, evt: CtrlEvent) {
        let mut queue = vec![evt];
        while !queue.is_empty() {
            let evt = queue.remove(0);
            let effects = self.control.handle(evt);
            for effect in effects {
                if let Some(next) = self.execute(effect) {
                    queue.push(next);
                }
            }
        }
    }

    /// Execute one effect; a returned event is cascaded through the
    /// machine.
    fn execute(&mut self, effect: Effect) -> Option<CtrlEvent> {
        match effect {
            Effect::HalPowerOn => self.hal_call("power on", |hal| hal.power_on()),
            Effect::HalBoot => self.hal_call("boot", |hal| hal.boot()),
            Effect::HalReset(kind) => self.hal_call("reset", |hal| hal.reset(kind)),
            Effect::HalShutdown => self.hal_call("shutdown", |hal| hal.shutdown()),
            Effect::StartConfigure => {
                if let Some(thread) = self.configure.take() {
                    thread.dispose();
                }
                match workers::configure::spawn(&self.config) {
                    Ok(thread) => {
                        self.configure = Some(thread);
                        None
                    }
                    Err(err) => {
                        error!("unable to start configuration task, {}", err);
                        self.ctrl_deadline = None;
                        Some(CtrlEvent::Timeout)
                    }
                }
            }
            Effect::StartTlv => {
                if let Some(thread) = self.custo.take() {
                    thread.dispose();
                }
                match workers::custo::spawn(&self.config) {
                    Ok(thread) => {
                        self.custo = Some(thread);
                        None
                    }
                    Err(err) => {
                        error!("unable to start customization task, {}", err);
                        Some(CtrlEvent::CustomizationDone { success: false })
                    }
                }
            }
            Effect::NvmStart => self.nvm_command(workers::CMD_NVM_START),
            Effect::NvmStop => self.nvm_command(workers::CMD_NVM_STOP),
            Effect::FwFlash { nodes } => self.start_fw_worker(nodes),
            Effect::DumpRead { nodes } => self.start_dump_worker(nodes),
            Effect::DumpAbort => {
                if let Some(id) = self.dump_worker.take() {
                    self.factory.kill(id).ok();
                }
                None
            }
            Effect::AtCfunOff => {
                self.at_cfun_off();
                None
            }
            Effect::BackupCalibration => {
                self.backup_calibration();
                None
            }
            Effect::NotifyState(state) => {
                self.clients.notify_modem_state(state);
                None
            }
            Effect::OperationResult(status) => {
                self.clients.notify_operation_result(status);
                None
            }
            Effect::Broadcast(debug) => {
                self.clients.notify_client(EventKind::DbgInfo, Some(&debug));
                None
            }
            Effect::ArmTimer(ms) => {
                self.ctrl_deadline = Some(SteadyTime::now() + Duration::milliseconds(ms));
                None
            }
            Effect::DisarmTimer => {
                self.ctrl_deadline = None;
                None
            }
            Effect::Feed(evt) => Some(evt),
            Effect::Fatal(msg) => {
                self.fatal = Some(msg);
                None
            }
        }
    }

    fn hal_call<F>(&mut self, what: &str, call: F) -> Option<CtrlEvent>
    where
        F: FnOnce(&Hal) -> Result<()>,
    {
        match call(&*self.hal) {
            Ok(()) => None,
            Err(err) => {
                error!("HAL {} failed, {}", what, err);
                Some(CtrlEvent::MdmUnresponsive { debug: None })
            }
        }
    }

    fn nvm_command(&mut self, cmd: i64) -> Option<CtrlEvent> {
        let sent = match self.nvm {
            Some(ref nvm) => nvm.send(Msg::scalar(cmd)).is_ok(),
            None => false,
        };
        if sent {
            None
        } else {
            error!("NVM task unreachable");
            Some(CtrlEvent::MdmUnresponsive { debug: None })
        }
    }

    fn start_fw_worker(&mut self, nodes: String) -> Option<CtrlEvent> {
        // Host runs can make the next upload(s) fail verification.
        let mut fail = false;
        if let Ok(count) = property::get(KEY_STUB_FW_FAIL, "0").parse::<u32>() {
            if count > 0 {
                fail = true;
                property::set(KEY_STUB_FW_FAIL, &(count - 1).to_string());
            }
        }
        let init = format!(
            "{}\n{}\n{}",
            nodes,
            self.config.firmware.path.display(),
            if fail { "1" } else { "0" }
        );
        match self.factory.create("fw_upload", init.as_bytes()) {
            Ok(id) => {
                self.fw_worker = Some(id);
                None
            }
            Err(err) => {
                error!("unable to start firmware upload worker, {}", err);
                Some(CtrlEvent::FwFlashed { success: false })
            }
        }
    }

    fn start_dump_worker(&mut self, nodes: String) -> Option<CtrlEvent> {
        let init = format!("{}\n{}", nodes, self.config.firmware.dump_dir.display());
        match self.factory.create("dump", init.as_bytes()) {
            Ok(id) => {
                self.dump_worker = Some(id);
                None
            }
            Err(err) => {
                error!("unable to start dump worker, {}", err);
                Some(CtrlEvent::DumpDone { success: false })
            }
        }
    }

    fn finish_fw_worker(&mut self, id: usize, success: bool) {
        self.factory.clean(id).ok();
        self.fw_worker = None;
        self.feed(CtrlEvent::FwFlashed { success: success });
    }

    fn finish_dump_worker(&mut self, id: usize, success: bool) {
        self.factory.clean(id).ok();
        self.dump_worker = None;
        self.feed(CtrlEvent::DumpDone { success: success });
    }

    fn at_cfun_off(&self) {
        let node = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.node.shutdown)
        {
            Ok(node) => node,
            Err(err) => {
                debug!(
                    "shutdown node {} not available, {}",
                    self.config.node.shutdown.display(),
                    err
                );
                return;
            }
        };
        at::send_no_answer(node.as_raw_fd(), "AT+CFUN=0", 500).ok();
    }

    fn backup_calibration(&mut self) {
        let src = self.config.calib_path();
        let dst = self.config.backup_path();
        let result = if self.config.nvm.raw_backup {
            file::raw_copy(&src, &dst)
        } else {
            file::atomic_copy(&src, &dst)
        };
        match result {
            Ok(bytes) => {
                info!("calibration backed up to {} ({} bytes)", dst.display(), bytes);
                self.clients.notify_client(
                    EventKind::DbgInfo,
                    Some(&DbgInfo::bare(DbgType::NvmBackupSuccess)),
                );
            }
            Err(err) => {
                // Not fatal: the modem keeps running uncalibrated.
                error!("calibration backup failed, {}", err);
                self.clients.notify_client(
                    EventKind::DbgInfo,
                    Some(&DbgInfo::with_data(
                        DbgType::Error,
                        vec![String::from("calibration backup failed")],
                    )),
                );
            }
        }
    }
}
