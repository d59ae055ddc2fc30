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

//! Client abstraction: folds every connected client's intent into one
//! coherent request stream for the control machine, and sequences
//! lifecycle events back out to the clients.
//!
//! The modem is wanted exactly while at least one client holds an
//! acquire. Tearing the modem down is negotiated: MDM_SHUTDOWN and
//! MDM_COLD_RESET broadcasts collect per-client acknowledgements
//! under a deadline, and a client disconnecting counts as its
//! acknowledgement. Requests to the control machine are queued, never
//! called back into directly; the event loop drains them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use time::{Duration, SteadyTime};

use crm_core::property;
use protocol::{DbgInfo, EventKind, Events, Message, RestartCause};
use protocol::wire;

use config::Config;
use manager::control::{ModemState, RestartKind};

/// Requests emitted toward the control machine.
#[derive(Clone, Debug, PartialEq)]
pub enum CtrlRequest {
    Start,
    Stop,
    Restart {
        kind: RestartKind,
        debug: Option<DbgInfo>,
    },
}

/// Internal aggregation state, independent of the control machine's.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CliState {
    Init,
    MdmOff,
    MdmStarting,
    MdmUp,
    /// The modem bounced on its own; control is recovering it.
    MdmOscillating,
    /// A client-requested cold reset is in flight.
    MdmResetting,
    MdmStopping,
    /// Modem reported off after a stop; completion pending.
    MdmStopped,
    Unrecoverable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RoundKind {
    ColdReset,
    Shutdown,
}

struct AckRound {
    kind: RoundKind,
    pending: HashSet<u64>,
    deadline: SteadyTime,
}

struct Client {
    stream: UnixStream,
    name: String,
    events: Events,
    holds_acquire: bool,
    debug: bool,
    registered: bool,
}

pub struct Clients {
    listener: UnixListener,
    clients: HashMap<u64, Client>,
    next_token: u64,
    state: CliState,
    requests: VecDeque<CtrlRequest>,
    round: Option<AckRound>,
    /// Request to emit once the current cold-reset round completes.
    round_request: Option<CtrlRequest>,
    /// Restart received while an operation was in flight; replayed on
    /// completion. Further restarts collapse into it.
    deferred_restart: Option<(RestartKind, Option<DbgInfo>)>,
    op_in_flight: bool,
    stop_issued: bool,
    stop_result_seen: bool,
    saw_busy_while_stopping: bool,
    oos_pending: bool,
    ack_timeout_ms: i64,
    debug_allowed: bool,
}

impl Clients {
    pub fn new(listener: UnixListener, config: &Config) -> Clients {
        Clients {
            listener: listener,
            clients: HashMap::new(),
            next_token: 0,
            state: CliState::Init,
            requests: VecDeque::new(),
            round: None,
            round_request: None,
            deferred_restart: None,
            op_in_flight: false,
            stop_issued: false,
            stop_result_seen: false,
            saw_busy_while_stopping: false,
            oos_pending: false,
            ack_timeout_ms: config.timer.ack,
            debug_allowed: property::get_bool(property::KEY_DEBUG_ENABLE),
        }
    }

    pub fn listen_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn client_fds(&self) -> Vec<(u64, RawFd)> {
        self.clients
            .iter()
            .map(|(token, client)| (*token, client.stream.as_raw_fd()))
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn take_requests(&mut self) -> Vec<CtrlRequest> {
        self.requests.drain(..).collect()
    }

    pub fn next_deadline(&self) -> Option<SteadyTime> {
        self.round.as_ref().map(|round| round.deadline)
    }

    /// Accept every pending connection. Clients stay anonymous until
    /// their REGISTER arrives.
    pub fn on_listen_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!("unable to configure client socket, {}", err);
                        continue;
                    }
                    let token = self.next_token;
                    self.next_token += 1;
                    self.clients.insert(
                        token,
                        Client {
                            stream: stream,
                            name: String::new(),
                            events: Events::empty(),
                            holds_acquire: false,
                            debug: false,
                            registered: false,
                        },
                    );
                    debug!("accepted connection, token[{}]", token);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("error accepting client, {}", err);
                    break;
                }
            }
        }
    }

    /// Read and handle one message from a client socket. Any protocol
    /// failure disconnects that client only.
    pub fn on_client_ready(&mut self, token: u64) {
        let fd = match self.clients.get(&token) {
            Some(client) => client.stream.as_raw_fd(),
            None => return,
        };
        match wire::recv(fd) {
            Ok(msg) => self.handle_message(token, msg),
            Err(err) => {
                debug!("dropping client token[{}]: {}", token, err);
                self.disconnect(token);
            }
        }
    }

    fn handle_message(&mut self, token: u64, msg: Message) {
        let registered = self
            .clients
            .get(&token)
            .map(|c| c.registered)
            .unwrap_or(false);
        if !registered {
            match msg {
                Message::Register { events, name } => self.register(token, events, name, false),
                Message::RegisterDbg { events, name } => self.register(token, events, name, true),
                other => {
                    warn!("message {} before REGISTER, dropping client", other);
                    self.disconnect(token);
                }
            }
            return;
        }
        match msg {
            Message::Register { .. } | Message::RegisterDbg { .. } => {
                // Registering twice is a protocol violation; the name
                // is necessarily already in use.
                warn!("duplicate REGISTER, dropping client token[{}]", token);
                self.disconnect(token);
            }
            Message::Acquire => self.on_acquire(token),
            Message::Release => self.on_release(token),
            Message::Restart { cause, debug } => self.on_restart(cause, debug),
            Message::Shutdown => self.on_shutdown_request(),
            Message::NvmBackup => self.on_nvm_backup(),
            Message::AckColdReset => self.on_ack(token, RoundKind::ColdReset),
            Message::AckShutdown => self.on_ack(token, RoundKind::Shutdown),
            Message::NotifyDbg(debug) => {
                self.broadcast(EventKind::DbgInfo, debug.as_ref());
            }
            other => {
                warn!("unexpected {} from client, dropping token[{}]", other, token);
                self.disconnect(token);
            }
        }
    }

    fn register(&mut self, token: u64, events: Events, name: String, debug: bool) {
        if debug && !self.debug_allowed {
            warn!("REGISTER_DBG without debug property, dropping '{}'", name);
            self.disconnect(token);
            return;
        }
        let duplicate = self
            .clients
            .values()
            .any(|c| c.registered && c.name == name);
        if duplicate {
            warn!("client name '{}' already in use, dropping", name);
            self.disconnect(token);
            return;
        }
        let state_event = self.state_event();
        if let Some(client) = self.clients.get_mut(&token) {
            client.name = name;
            client.events = events;
            client.debug = debug;
            client.registered = true;
            info!(
                "client '{}' registered (0x{:08x}){}",
                client.name,
                events.bits(),
                if client.debug { " [debug]" } else { "" }
            );
            if let Some(kind) = state_event {
                if client.events.contains(kind.flag()) {
                    send_event(&client.stream, kind);
                }
            }
        }
    }

    /// Event describing the current modem state to a newly registered
    /// client.
    fn state_event(&self) -> Option<EventKind> {
        match self.state {
            CliState::Init => None,
            CliState::MdmUp => Some(EventKind::Up),
            CliState::Unrecoverable => Some(EventKind::Oos),
            _ => Some(EventKind::Down),
        }
    }

    fn on_acquire(&mut self, token: u64) {
        if self.state == CliState::Unrecoverable {
            // The modem is gone; answer with OOS only.
            if let Some(client) = self.clients.get(&token) {
                send_event(&client.stream, EventKind::Oos);
            }
            return;
        }
        if let Some(client) = self.clients.get_mut(&token) {
            client.holds_acquire = true;
        }
        if self.state == CliState::MdmOff {
            self.emit_start();
        }
    }

    fn on_release(&mut self, token: u64) {
        let held = self
            .clients
            .get_mut(&token)
            .map(|client| {
                let held = client.holds_acquire;
                client.holds_acquire = false;
                held
            })
            .unwrap_or(false);
        if held {
            self.maybe_stop();
        }
    }

    fn on_restart(&mut self, cause: RestartCause, debug: Option<DbgInfo>) {
        let kind = match cause {
            RestartCause::MdmErr => RestartKind::Restart,
            RestartCause::ApplyUpdate => RestartKind::Update,
        };
        match self.state {
            CliState::MdmUp => {
                if self.op_in_flight {
                    if self.deferred_restart.is_none() {
                        self.deferred_restart = Some((kind, debug));
                    }
                    return;
                }
                self.begin_cold_round(
                    Some(CtrlRequest::Restart {
                        kind: kind,
                        debug: debug,
                    }),
                    CliState::MdmResetting,
                );
            }
            // A restart is already in flight, or there is no modem to
            // restart: collapse the request.
            _ => debug!("restart ignored in state {:?}", self.state),
        }
    }

    fn on_nvm_backup(&mut self) {
        match self.state {
            CliState::MdmUp if !self.op_in_flight => {
                self.begin_cold_round(
                    Some(CtrlRequest::Restart {
                        kind: RestartKind::NvmBackup,
                        debug: None,
                    }),
                    CliState::MdmResetting,
                );
            }
            _ => debug!("NVM backup ignored in state {:?}", self.state),
        }
    }

    /// A client announced platform shutdown: the modem goes down
    /// regardless of who still holds an acquire.
    fn on_shutdown_request(&mut self) {
        match self.state {
            CliState::MdmUp if !self.op_in_flight => {
                for client in self.clients.values_mut() {
                    client.holds_acquire = false;
                }
                self.begin_shutdown_round();
            }
            _ => debug!("shutdown request ignored in state {:?}", self.state),
        }
    }

    fn on_ack(&mut self, token: u64, kind: RoundKind) {
        let complete = match self.round {
            Some(ref mut round) if round.kind == kind => {
                round.pending.remove(&token);
                round.pending.is_empty()
            }
            _ => false,
        };
        if complete {
            self.finish_round();
        }
    }

    fn emit_start(&mut self) {
        self.state = CliState::MdmStarting;
        self.op_in_flight = true;
        self.requests.push_back(CtrlRequest::Start);
    }

    /// Begin the stop negotiation if nothing holds the modem anymore.
    fn maybe_stop(&mut self) {
        if self.acquire_count() > 0 {
            return;
        }
        match self.state {
            CliState::MdmUp if !self.op_in_flight && self.round.is_none() => {
                self.begin_shutdown_round()
            }
            // Any other state: the stop intent is re-evaluated when
            // the in-flight cycle completes.
            _ => (),
        }
    }

    fn begin_shutdown_round(&mut self) {
        self.saw_busy_while_stopping = false;
        self.stop_issued = false;
        self.stop_result_seen = false;
        self.state = CliState::MdmStopping;
        self.broadcast(EventKind::Shutdown, None);
        self.broadcast(EventKind::Down, None);
        let pending = self.subscribers(EventKind::Shutdown);
        if pending.is_empty() {
            self.finish_shutdown_round();
        } else {
            self.round = Some(AckRound {
                kind: RoundKind::Shutdown,
                pending: pending,
                deadline: SteadyTime::now() + Duration::milliseconds(self.ack_timeout_ms),
            });
        }
    }

    fn begin_cold_round(&mut self, request: Option<CtrlRequest>, state: CliState) {
        self.state = state;
        self.round_request = request;
        self.broadcast(EventKind::Down, None);
        self.broadcast(EventKind::ColdReset, None);
        let pending = self.subscribers(EventKind::ColdReset);
        if pending.is_empty() {
            self.finish_cold_round();
        } else {
            self.round = Some(AckRound {
                kind: RoundKind::ColdReset,
                pending: pending,
                deadline: SteadyTime::now() + Duration::milliseconds(self.ack_timeout_ms),
            });
        }
    }

    fn finish_round(&mut self) {
        let kind = match self.round {
            Some(ref round) => round.kind,
            None => return,
        };
        match kind {
            RoundKind::Shutdown => self.finish_shutdown_round(),
            RoundKind::ColdReset => self.finish_cold_round(),
        }
    }

    fn finish_shutdown_round(&mut self) {
        self.round = None;
        if self.oos_pending {
            self.go_out_of_service();
            return;
        }
        if self.saw_busy_while_stopping && self.acquire_count() > 0 {
            // The modem bounced while stopping and someone wants it
            // again: turn the stop into a reset.
            self.state = CliState::MdmResetting;
            self.op_in_flight = true;
            self.requests.push_back(CtrlRequest::Restart {
                kind: RestartKind::Restart,
                debug: None,
            });
            return;
        }
        self.stop_issued = true;
        self.op_in_flight = true;
        self.requests.push_back(CtrlRequest::Stop);
    }

    fn finish_cold_round(&mut self) {
        self.round = None;
        if self.oos_pending {
            self.go_out_of_service();
            return;
        }
        if let Some(request) = self.round_request.take() {
            self.op_in_flight = true;
            self.requests.push_back(request);
        }
    }

    fn go_out_of_service(&mut self) {
        self.oos_pending = false;
        self.round = None;
        self.round_request = None;
        self.deferred_restart = None;
        self.state = CliState::Unrecoverable;
        self.broadcast(EventKind::Oos, None);
    }

    fn finalize_stop(&mut self) {
        self.stop_issued = false;
        self.stop_result_seen = false;
        self.saw_busy_while_stopping = false;
        self.state = CliState::MdmOff;
        if self.acquire_count() > 0 {
            self.emit_start();
        }
    }

    /// Replay whatever intent accumulated while an operation was in
    /// flight. A pending stop wins over a deferred restart.
    fn process_deferred(&mut self) {
        if self.state != CliState::MdmUp {
            return;
        }
        if self.acquire_count() == 0 {
            self.deferred_restart = None;
            self.begin_shutdown_round();
            return;
        }
        if let Some((kind, debug)) = self.deferred_restart.take() {
            self.begin_cold_round(
                Some(CtrlRequest::Restart {
                    kind: kind,
                    debug: debug,
                }),
                CliState::MdmResetting,
            );
        }
    }

    pub fn notify_modem_state(&mut self, state: ModemState) {
        debug!("modem state {:?} (clients in {:?})", state, self.state);
        match state {
            ModemState::Off => self.on_state_off(),
            ModemState::Ready => self.on_state_ready(),
            ModemState::Busy => self.on_state_busy(),
            ModemState::Unresponsive => self.on_state_unresponsive(),
            ModemState::Dump | ModemState::NeedReset => self.on_state_bounced(),
            ModemState::Flash => (),
        }
    }

    fn on_state_off(&mut self) {
        match self.state {
            CliState::Init => {
                self.state = CliState::MdmOff;
                self.broadcast(EventKind::Down, None);
                if self.acquire_count() > 0 {
                    self.emit_start();
                }
            }
            CliState::MdmStopping if self.stop_issued => {
                self.state = CliState::MdmStopped;
                if self.stop_result_seen {
                    self.finalize_stop();
                }
            }
            // Transitional off inside a reset or boot cycle.
            _ => (),
        }
    }

    fn on_state_ready(&mut self) {
        match self.state {
            CliState::Unrecoverable
            | CliState::MdmStopping
            | CliState::MdmStopped => (),
            CliState::MdmUp => (),
            _ => {
                self.state = CliState::MdmUp;
                self.broadcast(EventKind::Up, None);
                if !self.op_in_flight {
                    self.process_deferred();
                }
            }
        }
    }

    fn on_state_busy(&mut self) {
        match self.state {
            CliState::MdmStopping if !self.stop_issued => {
                self.saw_busy_while_stopping = true;
            }
            CliState::MdmUp if !self.op_in_flight && self.round.is_none() => {
                // Unexpected unavailability in a stable state: treat
                // as a modem error needing a cold reset.
                self.begin_cold_round(
                    Some(CtrlRequest::Restart {
                        kind: RestartKind::Restart,
                        debug: None,
                    }),
                    CliState::MdmOscillating,
                );
            }
            _ => (),
        }
    }

    fn on_state_unresponsive(&mut self) {
        match self.state {
            CliState::Unrecoverable => (),
            _ if self.round.is_some() => {
                // Let the in-flight acknowledgement round finish, then
                // declare out-of-service.
                self.oos_pending = true;
            }
            CliState::MdmUp => {
                self.oos_pending = true;
                self.begin_cold_round(None, CliState::MdmOscillating);
            }
            _ => self.go_out_of_service(),
        }
    }

    fn on_state_bounced(&mut self) {
        match self.state {
            CliState::MdmUp => {
                self.broadcast(EventKind::Down, None);
                self.state = CliState::MdmOscillating;
            }
            _ => (),
        }
    }

    pub fn notify_operation_result(&mut self, status: i32) {
        if status != 0 {
            warn!("control operation failed with status {}", status);
        }
        self.op_in_flight = false;
        match self.state {
            CliState::MdmStopping if self.stop_issued => {
                self.stop_result_seen = true;
            }
            CliState::MdmStopped => {
                self.stop_result_seen = true;
                self.finalize_stop();
            }
            CliState::MdmUp => self.process_deferred(),
            _ => (),
        }
    }

    /// Pass-through broadcast used by control for debug events.
    pub fn notify_client(&mut self, kind: EventKind, debug: Option<&DbgInfo>) {
        self.broadcast(kind, debug);
    }

    pub fn on_timeout(&mut self, now: SteadyTime) {
        let expired = match self.round {
            Some(ref round) => round.deadline <= now,
            None => false,
        };
        if expired {
            if let Some(ref round) = self.round {
                for token in &round.pending {
                    if let Some(client) = self.clients.get(token) {
                        warn!("client '{}' did not acknowledge in time", client.name);
                    }
                }
            }
            self.finish_round();
        }
    }

    fn acquire_count(&self) -> usize {
        self.clients.values().filter(|c| c.holds_acquire).count()
    }

    fn subscribers(&self, kind: EventKind) -> HashSet<u64> {
        self.clients
            .iter()
            .filter(|&(_, client)| client.registered && client.events.contains(kind.flag()))
            .map(|(token, _)| *token)
            .collect()
    }

    fn broadcast(&mut self, kind: EventKind, debug: Option<&DbgInfo>) {
        let msg = match kind {
            EventKind::DbgInfo => Message::DbgInfo(debug.cloned()),
            kind => Message::Event(kind),
        };
        let frame = match wire::encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                error!("unable to encode {} for broadcast, {}", msg, err);
                return;
            }
        };
        let targets: Vec<(u64, RawFd)> = self
            .clients
            .iter()
            .filter(|&(_, client)| client.registered && client.events.contains(kind.flag()))
            .map(|(token, client)| (*token, client.stream.as_raw_fd()))
            .collect();
        let mut dead = Vec::new();
        for (token, fd) in targets {
            if wire::send_encoded(fd, &frame).is_err() {
                dead.push(token);
            }
        }
        for token in dead {
            debug!("broadcast failed, dropping client token[{}]", token);
            self.disconnect(token);
        }
    }

    /// Remove a client. Its outstanding acknowledgements are treated
    /// as given and its acquire as released.
    pub fn disconnect(&mut self, token: u64) {
        let client = match self.clients.remove(&token) {
            Some(client) => client,
            None => return,
        };
        if client.registered {
            info!("client '{}' disconnected", client.name);
        }
        let complete = match self.round {
            Some(ref mut round) => {
                round.pending.remove(&token);
                round.pending.is_empty()
            }
            None => false,
        };
        if complete {
            self.finish_round();
        }
        if client.holds_acquire {
            self.maybe_stop();
        }
    }
}

fn send_event(stream: &UnixStream, kind: EventKind) {
    if let Err(err) = wire::send(stream.as_raw_fd(), &Message::Event(kind)) {
        debug!("unable to send {} to client, {}", kind, err);
    }
}

#[cfg(test)]
mod test {
    extern crate tempfile;

    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use libc;
    use time::{Duration, SteadyTime};

    use crm_core::socket;
    use protocol::{DbgInfo, DbgType, EventKind, Events, Message, RestartCause};
    use protocol::wire;

    use super::*;
    use config::Config;
    use manager::control::{ModemState, RestartKind};

    struct Harness {
        _dir: self::tempfile::TempDir,
        clients: Clients,
        seen_tokens: u64,
    }

    impl Harness {
        fn new() -> Harness {
            let dir = self::tempfile::tempdir().unwrap();
            let listener = socket::listen(dir.path(), "crm0").unwrap();
            let mut config = Config::default();
            config.timer.ack = 100;
            let mut harness = Harness {
                clients: Clients::new(listener, &config),
                _dir: dir,
                seen_tokens: 0,
            };
            // The control machine reports the initial OFF state before
            // the loop starts serving clients.
            harness.clients.notify_modem_state(ModemState::Off);
            harness
        }

        fn connect(&mut self, events: Events, name: &str) -> (UnixStream, u64) {
            let stream = UnixStream::connect(
                socket::path(self._dir.path(), "crm0"),
            ).unwrap();
            self.clients.on_listen_ready();
            let token = self.seen_tokens;
            self.seen_tokens += 1;
            wire::send(
                stream.as_raw_fd(),
                &Message::Register {
                    events: events,
                    name: name.to_string(),
                },
            ).unwrap();
            self.clients.on_client_ready(token);
            (stream, token)
        }

        fn send(&mut self, stream: &UnixStream, token: u64, msg: Message) {
            wire::send(stream.as_raw_fd(), &msg).unwrap();
            self.clients.on_client_ready(token);
        }

        fn requests(&mut self) -> Vec<CtrlRequest> {
            self.clients.take_requests()
        }
    }

    fn recv(stream: &UnixStream) -> Message {
        wire::recv(stream.as_raw_fd()).expect("expected an event")
    }

    fn assert_silent(stream: &UnixStream) {
        let mut pfd = libc::pollfd {
            fd: stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 50) };
        assert_eq!(ret, 0, "unexpected event pending");
    }

    fn all_events() -> Events {
        Events::all()
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut harness = Harness::new();
        let (c1, _) = harness.connect(all_events(), "Client1");
        let (c2, _) = harness.connect(all_events(), "Client1");
        // First client got the OFF state on registration; second was
        // dropped.
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));
        assert!(wire::recv(c2.as_raw_fd()).is_err());
        assert_eq!(harness.clients.client_count(), 1);
    }

    #[test]
    fn acquire_release_negotiation() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));

        harness.send(&c1, t1, Message::Acquire);
        assert_eq!(harness.requests(), vec![CtrlRequest::Start]);

        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        assert_eq!(recv(&c1), Message::Event(EventKind::Up));

        harness.send(&c1, t1, Message::Release);
        assert_eq!(recv(&c1), Message::Event(EventKind::Shutdown));
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));
        assert!(harness.requests().is_empty());

        harness.send(&c1, t1, Message::AckShutdown);
        assert_eq!(harness.requests(), vec![CtrlRequest::Stop]);

        harness.clients.notify_modem_state(ModemState::Busy);
        harness.clients.notify_modem_state(ModemState::Off);
        harness.clients.notify_operation_result(0);
        assert!(harness.requests().is_empty());
        assert_silent(&c1);
    }

    #[test]
    fn shutdown_ack_timeout_still_stops() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);

        harness.send(&c1, t1, Message::Release);
        recv(&c1); // MDM_SHUTDOWN
        recv(&c1); // MDM_DOWN
        assert!(harness.requests().is_empty());

        // No acknowledgement arrives; the deadline fires instead.
        harness
            .clients
            .on_timeout(SteadyTime::now() + Duration::milliseconds(200));
        assert_eq!(harness.requests(), vec![CtrlRequest::Stop]);
        // The silent client stays connected.
        assert_eq!(harness.clients.client_count(), 1);
    }

    #[test]
    fn restart_collects_acks_and_collapses_duplicates() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        let (c2, t2) = harness.connect(
            Events::MDM_UP | Events::MDM_DOWN | Events::MDM_OOS,
            "Client2",
        );
        assert_eq!(recv(&c2), Message::Event(EventKind::Down));

        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);
        recv(&c2);

        let debug = DbgInfo::with_data(
            DbgType::Apimr,
            vec![String::from("First"), String::from("Second")],
        );
        harness.send(
            &c1,
            t1,
            Message::Restart {
                cause: RestartCause::MdmErr,
                debug: Some(debug.clone()),
            },
        );
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));
        assert_eq!(recv(&c1), Message::Event(EventKind::ColdReset));
        assert_eq!(recv(&c2), Message::Event(EventKind::Down));
        assert!(harness.requests().is_empty());

        // A second restart while one is in flight is ignored.
        harness.send(
            &c2,
            t2,
            Message::Restart {
                cause: RestartCause::ApplyUpdate,
                debug: None,
            },
        );
        assert!(harness.requests().is_empty());
        assert_silent(&c1);

        harness.send(&c1, t1, Message::AckColdReset);
        assert_eq!(
            harness.requests(),
            vec![CtrlRequest::Restart {
                kind: RestartKind::Restart,
                debug: Some(debug),
            }]
        );

        harness.clients.notify_modem_state(ModemState::Busy);
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        assert_eq!(recv(&c1), Message::Event(EventKind::Up));
        assert_eq!(recv(&c2), Message::Event(EventKind::Up));
    }

    #[test]
    fn disconnect_counts_as_cold_reset_ack() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);

        harness.send(
            &c1,
            t1,
            Message::Restart {
                cause: RestartCause::ApplyUpdate,
                debug: None,
            },
        );
        recv(&c1); // MDM_DOWN
        recv(&c1); // MDM_COLD_RESET
        assert!(harness.requests().is_empty());

        // The only acknowledging client goes away instead of acking.
        drop(c1);
        harness.clients.on_client_ready(t1);
        assert_eq!(
            harness.requests(),
            vec![CtrlRequest::Restart {
                kind: RestartKind::Update,
                debug: None,
            }]
        );
    }

    #[test]
    fn busy_in_stable_state_is_a_modem_error() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);

        harness.clients.notify_modem_state(ModemState::Busy);
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));
        assert_eq!(recv(&c1), Message::Event(EventKind::ColdReset));
        harness.send(&c1, t1, Message::AckColdReset);
        assert_eq!(
            harness.requests(),
            vec![CtrlRequest::Restart {
                kind: RestartKind::Restart,
                debug: None,
            }]
        );
    }

    #[test]
    fn unresponsive_modem_goes_out_of_service() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);

        harness.clients.notify_modem_state(ModemState::Busy);
        recv(&c1); // MDM_DOWN
        recv(&c1); // MDM_COLD_RESET
        harness.clients.notify_modem_state(ModemState::Unresponsive);
        harness.send(&c1, t1, Message::AckColdReset);
        // No restart request: the modem is gone for good.
        assert!(harness.requests().is_empty());
        assert_eq!(recv(&c1), Message::Event(EventKind::Oos));

        // Further acquires are answered with OOS only.
        harness.send(&c1, t1, Message::Acquire);
        assert_eq!(recv(&c1), Message::Event(EventKind::Oos));
        assert!(harness.requests().is_empty());
    }

    #[test]
    fn acquire_during_stop_restarts_afterwards() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        let (c2, t2) = harness.connect(
            Events::MDM_UP | Events::MDM_DOWN,
            "Client2",
        );
        recv(&c2);

        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);
        recv(&c2);

        harness.send(&c1, t1, Message::Release);
        recv(&c1); // MDM_SHUTDOWN
        recv(&c1); // MDM_DOWN
        recv(&c2); // MDM_DOWN

        // Someone re-acquires while the shutdown handshake runs; the
        // stop still goes through first.
        harness.send(&c2, t2, Message::Acquire);
        harness.send(&c1, t1, Message::AckShutdown);
        assert_eq!(harness.requests(), vec![CtrlRequest::Stop]);

        harness.clients.notify_modem_state(ModemState::Busy);
        harness.clients.notify_modem_state(ModemState::Off);
        harness.clients.notify_operation_result(0);
        // ...and the pending acquire immediately powers it back on.
        assert_eq!(harness.requests(), vec![CtrlRequest::Start]);
    }

    #[test]
    fn release_with_other_holders_stays_up() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        let (c2, t2) = harness.connect(all_events(), "Client2");
        recv(&c2);

        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);
        recv(&c2);
        harness.send(&c2, t2, Message::Acquire);

        harness.send(&c1, t1, Message::Release);
        assert!(harness.requests().is_empty());
        assert_silent(&c1);
        assert_silent(&c2);
    }

    #[test]
    fn debug_broadcast_reaches_subscribers_only() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        let (c2, _) = harness.connect(Events::MDM_UP | Events::MDM_DOWN, "Client2");
        recv(&c2);

        let debug = DbgInfo::with_data(
            DbgType::Error,
            vec![String::from("Test"), String::from("Foo")],
        );
        harness.send(&c1, t1, Message::NotifyDbg(Some(debug.clone())));
        assert_eq!(recv(&c1), Message::DbgInfo(Some(debug)));
        assert_silent(&c2);
    }

    #[test]
    fn shutdown_request_overrides_holders() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        harness.clients.notify_operation_result(0);
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1);

        // Platform shutdown: the acquire no longer counts.
        harness.send(&c1, t1, Message::Shutdown);
        assert_eq!(recv(&c1), Message::Event(EventKind::Shutdown));
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));
        harness.send(&c1, t1, Message::AckShutdown);
        assert_eq!(harness.requests(), vec![CtrlRequest::Stop]);

        harness.clients.notify_modem_state(ModemState::Busy);
        harness.clients.notify_modem_state(ModemState::Off);
        harness.clients.notify_operation_result(0);
        // Nothing restarts the modem afterwards.
        assert!(harness.requests().is_empty());
    }

    #[test]
    fn restart_deferred_until_start_completes() {
        let mut harness = Harness::new();
        let (c1, t1) = harness.connect(all_events(), "Client1");
        recv(&c1);
        harness.send(&c1, t1, Message::Acquire);
        harness.requests();
        // The modem comes up before the start operation is
        // acknowledged.
        harness.clients.notify_modem_state(ModemState::Ready);
        recv(&c1); // MDM_UP

        harness.send(
            &c1,
            t1,
            Message::Restart {
                cause: RestartCause::MdmErr,
                debug: None,
            },
        );
        assert!(harness.requests().is_empty());
        assert_silent(&c1);

        harness.clients.notify_operation_result(0);
        assert_eq!(recv(&c1), Message::Event(EventKind::Down));
        assert_eq!(recv(&c1), Message::Event(EventKind::ColdReset));
        harness.send(&c1, t1, Message::AckColdReset);
        assert_eq!(
            harness.requests(),
            vec![CtrlRequest::Restart {
                kind: RestartKind::Restart,
                debug: None,
            }]
        );
    }
}
