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

//! Top-level modem lifecycle state machine.
//!
//! The machine is pure: it consumes typed events and returns the
//! effects to execute. The event loop owns all I/O; nothing in here
//! touches a descriptor. Every `{state, event}` pair is declared in
//! [`Control::cell`] as exactly one of no-op, action, assert, reject
//! or todo-fatal. `assert` cells are unreachable by construction and
//! abort debug builds; `reject` cells flag a request arriving while a
//! transition is in flight, which is a logic bug in the client
//! abstraction.

use std::fmt;

use protocol::{DbgInfo, DbgType};

use config::Config;
use crm_core::property;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CtrlState {
    Off,
    Booting,
    Flashing,
    Configuring,
    StartingDaemons,
    Running,
    WaitingDump,
    StoppingDaemons,
    WaitingLink,
}

impl fmt::Display for CtrlState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            CtrlState::Off => "OFF",
            CtrlState::Booting => "BOOTING",
            CtrlState::Flashing => "FLASHING",
            CtrlState::Configuring => "CONFIGURING",
            CtrlState::StartingDaemons => "STARTING_DAEMONS",
            CtrlState::Running => "RUNNING",
            CtrlState::WaitingDump => "WAITING_DUMP",
            CtrlState::StoppingDaemons => "STOPPING_DAEMONS",
            CtrlState::WaitingLink => "WAITING_LINK",
        };
        write!(f, "{}", name)
    }
}

/// External modem state reported to the client abstraction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModemState {
    Off,
    Busy,
    Ready,
    Unresponsive,
    Flash,
    Dump,
    NeedReset,
}

/// Restart flavors requested by the client abstraction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartKind {
    /// Plain cold reset after a client-visible error.
    Restart,
    /// Cold reset to apply a firmware update; customization scripts
    /// are replayed.
    Update,
    /// Cold reset cycle with a calibration backup on the way down.
    NvmBackup,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetType {
    Warm,
    Cold,
    Backup,
}

/// Events feeding the machine, partitioned by source.
#[derive(Clone, Debug, PartialEq)]
pub enum CtrlEvent {
    // Requests from the client abstraction.
    Power,
    Boot,
    Stop,
    Reset {
        kind: RestartKind,
        debug: Option<DbgInfo>,
    },
    // Asynchronous HAL events.
    MdmOff,
    MdmFlashReady { nodes: String },
    MdmRun,
    MdmCrash,
    MdmDumpReady { nodes: String },
    MdmLinkDown,
    MdmUnresponsive { debug: Option<DbgInfo> },
    // Worker completions.
    FwPackaged { success: bool },
    FwFlashed { success: bool },
    DumpDone { success: bool },
    CustomizationDone { success: bool },
    NvmRun,
    NvmStop,
    // Synthesized.
    MdmConfigured,
    MuxHangup,
    MuxDead,
    Timeout,
}

impl fmt::Display for CtrlEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            CtrlEvent::Power => "REQ: power",
            CtrlEvent::Boot => "REQ: boot",
            CtrlEvent::Stop => "REQ: stop",
            CtrlEvent::Reset { .. } => "REQ: reset",
            CtrlEvent::MdmOff => "MDM: off",
            CtrlEvent::MdmFlashReady { .. } => "MDM: flash",
            CtrlEvent::MdmRun => "MDM: run",
            CtrlEvent::MdmCrash => "MDM: crash",
            CtrlEvent::MdmDumpReady { .. } => "MDM: dump",
            CtrlEvent::MdmLinkDown => "LINK: down",
            CtrlEvent::MdmUnresponsive { .. } => "MDM: unresponsive",
            CtrlEvent::FwPackaged { .. } => "FW: packaged",
            CtrlEvent::FwFlashed { .. } => "FW: flashed",
            CtrlEvent::DumpDone { .. } => "DUMP: done",
            CtrlEvent::CustomizationDone { .. } => "TLV: done",
            CtrlEvent::NvmRun => "NVM: run",
            CtrlEvent::NvmStop => "NVM: stop",
            CtrlEvent::MdmConfigured => "MDM: configured",
            CtrlEvent::MuxHangup => "MUX: hangup",
            CtrlEvent::MuxDead => "MUX: dead",
            CtrlEvent::Timeout => "TIMEOUT",
        };
        write!(f, "{}", name)
    }
}

/// Side effects the event loop executes on the machine's behalf.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    HalPowerOn,
    HalBoot,
    HalReset(ResetType),
    HalShutdown,
    /// Spawn the configuration task (ping, MUX mount, AT probe).
    StartConfigure,
    /// Spawn the TLV customization task.
    StartTlv,
    NvmStart,
    NvmStop,
    FwFlash { nodes: String },
    DumpRead { nodes: String },
    DumpAbort,
    /// Best-effort `AT+CFUN=0` on the shutdown node.
    AtCfunOff,
    /// Copy the calibration file to its backup location.
    BackupCalibration,
    NotifyState(ModemState),
    OperationResult(i32),
    Broadcast(DbgInfo),
    ArmTimer(i64),
    DisarmTimer,
    /// Cascade an internal event through the machine.
    Feed(CtrlEvent),
    Fatal(&'static str),
}

/// Control request currently in flight, per the data model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pending {
    None,
    Power,
    Boot,
    Reset,
    Stop,
}

/// Operation requested by the client abstraction, acknowledged with
/// one `OperationResult` when its cycle completes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OpKind {
    Start,
    Stop,
    Restart,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cell {
    Noop,
    Act,
    Assert,
    Reject,
    Todo,
}

/// Implicit self-resets escalate to out-of-service once this many
/// boot chains fail in a row without reaching RUNNING.
const MAX_BOOT_ATTEMPTS: u32 = 3;
/// Firmware verification failures before declaring the modem dead.
const MAX_FW_FAILURES: u32 = 2;

pub struct Control {
    state: CtrlState,
    pending: Pending,
    op: Option<OpKind>,
    /// Calibration backup to perform on the way through the next
    /// cold-reset cycle.
    backup: bool,
    /// Restart was an update: replay customization scripts.
    update: bool,
    link_down_seen: bool,
    timeout_count: u32,
    fw_failures: u32,
    boot_attempts: u32,
    cfg_retried: bool,
    tlv_applied: bool,
    custo_done: bool,
    nvm_run_seen: bool,
    timers: Timers,
    dumps_disabled: bool,
    silent_reset: bool,
    escalation_disabled: bool,
}

#[derive(Clone, Copy)]
struct Timers {
    boot: i64,
    configure: i64,
    daemons: i64,
    link: i64,
}

impl Control {
    pub fn new(config: &Config) -> Control {
        Control {
            state: CtrlState::Off,
            pending: Pending::None,
            op: None,
            backup: false,
            update: false,
            link_down_seen: false,
            timeout_count: 0,
            fw_failures: 0,
            boot_attempts: 0,
            cfg_retried: false,
            tlv_applied: false,
            custo_done: false,
            nvm_run_seen: false,
            timers: Timers {
                boot: config.timer.boot,
                configure: config.timer.configure,
                daemons: config.timer.daemons,
                link: config.timer.link,
            },
            dumps_disabled: property::get_bool(property::KEY_DISABLE_DUMP),
            silent_reset: property::get_bool(property::KEY_SILENT_RESET),
            escalation_disabled: property::get_bool(property::KEY_DISABLE_ESCALATION),
        }
    }

    pub fn state(&self) -> CtrlState {
        self.state
    }

    /// Process one event and return the effects to execute, in order.
    pub fn handle(&mut self, evt: CtrlEvent) -> Vec<Effect> {
        let cell = self.cell(&evt);
        debug!("({}, {}) -> {:?}", self.state, evt, cell);
        match cell {
            Cell::Noop => Vec::new(),
            Cell::Act => self.act(evt),
            Cell::Reject => {
                // A request landed while a transition is in flight:
                // the client abstraction broke its sequencing contract.
                error!("rejected {} in state {}", evt, self.state);
                Vec::new()
            }
            Cell::Assert => {
                debug_assert!(false, "unreachable: {} in state {}", evt, self.state);
                error!("unreachable {} in state {}", evt, self.state);
                vec![Effect::Fatal("unreachable control transition")]
            }
            Cell::Todo => {
                error!("unhandled {} in state {}", evt, self.state);
                vec![Effect::Fatal("unhandled control transition")]
            }
        }
    }

    /// The published `{state, event}` table. Columns follow the state
    /// enum order: Off, Booting, Flashing, Configuring,
    /// StartingDaemons, Running, WaitingDump, StoppingDaemons,
    /// WaitingLink.
    fn cell(&self, evt: &CtrlEvent) -> Cell {
        use self::Cell::*;
        use self::CtrlState::*;

        match *evt {
            CtrlEvent::Power => match self.state {
                Off => Act,
                _ => Reject,
            },
            CtrlEvent::Boot => match self.state {
                Flashing => Act,
                _ => Reject,
            },
            CtrlEvent::Stop => match self.state {
                Running | WaitingDump | StoppingDaemons => Act,
                _ => Reject,
            },
            CtrlEvent::Reset { .. } => match self.state {
                Running | WaitingDump | StoppingDaemons => Act,
                _ => Reject,
            },
            CtrlEvent::MdmOff => match self.state {
                Off | WaitingDump => Noop,
                Booting | Flashing | Configuring | StartingDaemons | Running => Act,
                StoppingDaemons | WaitingLink => Act,
            },
            CtrlEvent::MdmFlashReady { .. } => match self.state {
                Booting | WaitingDump | WaitingLink => Act,
                _ => Assert,
            },
            CtrlEvent::MdmRun => match self.state {
                Configuring => Noop,
                _ => Assert,
            },
            CtrlEvent::MdmCrash => match self.state {
                Running => Act,
                WaitingDump => Assert,
                _ => Todo,
            },
            CtrlEvent::MdmDumpReady { .. } => match self.state {
                WaitingDump => Act,
                StoppingDaemons => Todo,
                _ => Assert,
            },
            CtrlEvent::MdmLinkDown => match self.state {
                Off | WaitingDump => Noop,
                Booting | Flashing | Configuring | StartingDaemons | Running => Act,
                StoppingDaemons | WaitingLink => Act,
            },
            CtrlEvent::MdmUnresponsive { .. } => Act,
            CtrlEvent::FwPackaged { .. } => Noop,
            CtrlEvent::FwFlashed { .. } => match self.state {
                Flashing => Act,
                _ => Noop,
            },
            CtrlEvent::DumpDone { .. } => match self.state {
                WaitingDump => Act,
                _ => Noop,
            },
            CtrlEvent::CustomizationDone { .. } => match self.state {
                StartingDaemons => Act,
                _ => Noop,
            },
            CtrlEvent::NvmRun => match self.state {
                StartingDaemons => Act,
                _ => Noop,
            },
            CtrlEvent::NvmStop => match self.state {
                StoppingDaemons => Act,
                _ => Noop,
            },
            CtrlEvent::MdmConfigured => match self.state {
                Configuring => Act,
                _ => Assert,
            },
            CtrlEvent::MuxHangup => match self.state {
                Configuring | StartingDaemons | Running => Act,
                Off | StoppingDaemons | WaitingLink => Noop,
                _ => Assert,
            },
            CtrlEvent::MuxDead => match self.state {
                Configuring | StartingDaemons | Running => Act,
                _ => Assert,
            },
            CtrlEvent::Timeout => match self.state {
                Booting | Configuring | StartingDaemons | StoppingDaemons | WaitingLink
                | WaitingDump => Act,
                _ => Assert,
            },
        }
    }

    fn act(&mut self, evt: CtrlEvent) -> Vec<Effect> {
        use self::CtrlState::*;

        match (self.state, evt) {
            (Off, CtrlEvent::Power) => {
                self.op = Some(OpKind::Start);
                self.pending = Pending::Power;
                self.boot_attempts = 0;
                self.enter(Booting);
                vec![Effect::HalPowerOn, Effect::ArmTimer(self.timers.boot)]
            }
            (Booting, CtrlEvent::MdmFlashReady { nodes }) => {
                self.pending = Pending::Boot;
                self.enter(Flashing);
                vec![
                    Effect::DisarmTimer,
                    Effect::NotifyState(ModemState::Flash),
                    Effect::FwFlash { nodes: nodes },
                ]
            }
            (Flashing, CtrlEvent::FwFlashed { success: true }) => {
                self.fw_failures = 0;
                vec![Effect::Feed(CtrlEvent::Boot)]
            }
            (Flashing, CtrlEvent::FwFlashed { success: false }) => {
                self.fw_failures += 1;
                if self.fw_failures >= MAX_FW_FAILURES && !self.escalation_disabled {
                    let mut effects = vec![Effect::Broadcast(DbgInfo::bare(DbgType::FwFailure))];
                    effects.extend(self.give_up());
                    effects
                } else {
                    warn!(
                        "firmware verification failed ({}/{}), retrying",
                        self.fw_failures, MAX_FW_FAILURES
                    );
                    self.pending = Pending::Reset;
                    self.link_down_seen = false;
                    self.enter(WaitingLink);
                    vec![
                        Effect::HalReset(ResetType::Cold),
                        Effect::ArmTimer(self.timers.link),
                    ]
                }
            }
            (Flashing, CtrlEvent::Boot) => {
                self.pending = Pending::Boot;
                self.custo_done = false;
                self.nvm_run_seen = false;
                self.enter(Configuring);
                vec![
                    Effect::HalBoot,
                    Effect::StartConfigure,
                    Effect::ArmTimer(self.timers.configure),
                ]
            }
            (Configuring, CtrlEvent::MdmConfigured) => {
                self.cfg_retried = false;
                self.enter(StartingDaemons);
                let mut effects = vec![Effect::DisarmTimer];
                if !self.tlv_applied || self.update {
                    effects.push(Effect::StartTlv);
                } else {
                    self.custo_done = true;
                }
                effects.push(Effect::NvmStart);
                effects.push(Effect::ArmTimer(self.timers.daemons));
                effects
            }
            (Configuring, CtrlEvent::Timeout) => {
                // Ping or MUX setup did not come up in time. One
                // corrective retry, then escalate to a reset cycle.
                if !self.cfg_retried {
                    self.cfg_retried = true;
                    vec![
                        Effect::Broadcast(DbgInfo::with_data(
                            DbgType::Error,
                            vec![String::from("modem configuration failed, retrying")],
                        )),
                        Effect::StartConfigure,
                        Effect::ArmTimer(self.timers.configure),
                    ]
                } else {
                    self.cfg_retried = false;
                    let mut effects = vec![Effect::Broadcast(DbgInfo::with_data(
                        DbgType::Error,
                        vec![String::from("modem configuration failed")],
                    ))];
                    effects.extend(self.self_reset(None));
                    effects
                }
            }
            (StartingDaemons, CtrlEvent::NvmRun) => {
                self.nvm_run_seen = true;
                if self.custo_done {
                    self.enter_running()
                } else {
                    Vec::new()
                }
            }
            (StartingDaemons, CtrlEvent::CustomizationDone { success }) => {
                self.custo_done = true;
                self.tlv_applied = true;
                let mut effects = Vec::new();
                if success {
                    effects.push(Effect::Broadcast(DbgInfo::bare(DbgType::TlvSuccess)));
                } else {
                    effects.push(Effect::Broadcast(DbgInfo::with_data(
                        DbgType::Error,
                        vec![String::from("TLV customization failed")],
                    )));
                }
                if self.nvm_run_seen {
                    effects.extend(self.enter_running());
                }
                effects
            }
            (StartingDaemons, CtrlEvent::Timeout) => self.corrective(
                Effect::NvmStart,
                self.timers.daemons,
                "NVM sync did not start",
            ),
            (Running, CtrlEvent::Reset { kind, debug }) => {
                self.op = Some(OpKind::Restart);
                self.backup = kind == RestartKind::NvmBackup;
                self.update = kind == RestartKind::Update;
                let mut effects = vec![Effect::NotifyState(ModemState::Busy)];
                if let Some(debug) = debug {
                    effects.push(Effect::Broadcast(debug));
                }
                effects.extend(self.stop_daemons(Pending::Reset));
                effects
            }
            (Running, CtrlEvent::Stop) => {
                self.op = Some(OpKind::Stop);
                let mut effects = vec![
                    Effect::NotifyState(ModemState::Busy),
                    Effect::AtCfunOff,
                ];
                effects.extend(self.stop_daemons(Pending::Stop));
                effects
            }
            (Running, CtrlEvent::MdmCrash) => {
                self.enter(WaitingDump);
                vec![
                    Effect::NotifyState(ModemState::Dump),
                    Effect::NvmStop,
                    Effect::ArmTimer(self.timers.configure),
                ]
            }
            (Running, CtrlEvent::MdmOff)
            | (Running, CtrlEvent::MdmLinkDown)
            | (Booting, CtrlEvent::MdmOff)
            | (Booting, CtrlEvent::MdmLinkDown)
            | (Flashing, CtrlEvent::MdmOff)
            | (Flashing, CtrlEvent::MdmLinkDown)
            | (Configuring, CtrlEvent::MdmOff)
            | (Configuring, CtrlEvent::MdmLinkDown)
            | (StartingDaemons, CtrlEvent::MdmOff)
            | (StartingDaemons, CtrlEvent::MdmLinkDown) => {
                // The modem went away on its own.
                let debug = if self.silent_reset {
                    None
                } else {
                    Some(DbgInfo::bare(DbgType::SelfReset))
                };
                self.self_reset(debug)
            }
            (Configuring, CtrlEvent::MuxHangup)
            | (StartingDaemons, CtrlEvent::MuxHangup)
            | (Running, CtrlEvent::MuxHangup) => {
                let mut effects = vec![Effect::Broadcast(DbgInfo::with_data(
                    DbgType::Error,
                    vec![String::from("MUX hangup")],
                ))];
                effects.extend(self.self_reset(None));
                effects
            }
            (Configuring, CtrlEvent::MuxDead)
            | (StartingDaemons, CtrlEvent::MuxDead)
            | (Running, CtrlEvent::MuxDead) => self.give_up(),
            (_, CtrlEvent::MdmUnresponsive { debug }) => {
                let mut effects = Vec::new();
                if let Some(debug) = debug {
                    effects.push(Effect::Broadcast(debug));
                }
                effects.extend(self.give_up());
                effects
            }
            (WaitingDump, CtrlEvent::MdmDumpReady { nodes }) => {
                if self.dumps_disabled {
                    let debug = if self.silent_reset {
                        None
                    } else {
                        Some(DbgInfo::bare(DbgType::SelfReset))
                    };
                    self.self_reset(debug)
                } else {
                    // Warm reset exposes a flashable port the dump is
                    // read from.
                    let _ = nodes;
                    vec![Effect::HalReset(ResetType::Warm)]
                }
            }
            (WaitingDump, CtrlEvent::MdmFlashReady { nodes }) => vec![
                Effect::Broadcast(DbgInfo::bare(DbgType::DumpStart)),
                Effect::DumpRead { nodes: nodes },
            ],
            (WaitingDump, CtrlEvent::DumpDone { success }) => {
                let mut effects = Vec::new();
                if success {
                    effects.push(Effect::Broadcast(DbgInfo::bare(DbgType::DumpEnd)));
                } else {
                    effects.push(Effect::Broadcast(DbgInfo::with_data(
                        DbgType::Error,
                        vec![String::from("core dump retrieval failed")],
                    )));
                }
                self.pending = Pending::Reset;
                self.link_down_seen = false;
                self.enter(WaitingLink);
                effects.push(Effect::HalReset(ResetType::Cold));
                effects.push(Effect::ArmTimer(self.timers.link));
                effects
            }
            (WaitingDump, CtrlEvent::Timeout) => {
                let mut effects = vec![
                    Effect::DumpAbort,
                    Effect::Broadcast(DbgInfo::with_data(
                        DbgType::Error,
                        vec![String::from("core dump retrieval timed out")],
                    )),
                ];
                self.pending = Pending::Reset;
                self.link_down_seen = false;
                self.enter(WaitingLink);
                effects.push(Effect::HalReset(ResetType::Cold));
                effects.push(Effect::ArmTimer(self.timers.link));
                effects
            }
            (WaitingDump, CtrlEvent::Stop) => {
                self.op = Some(OpKind::Stop);
                self.pending = Pending::Stop;
                self.link_down_seen = false;
                self.enter(WaitingLink);
                vec![
                    Effect::DumpAbort,
                    Effect::HalShutdown,
                    Effect::ArmTimer(self.timers.link),
                ]
            }
            (WaitingDump, CtrlEvent::Reset { kind, debug }) => {
                self.op = Some(OpKind::Restart);
                self.backup = kind == RestartKind::NvmBackup;
                self.update = kind == RestartKind::Update;
                self.pending = Pending::Reset;
                self.link_down_seen = false;
                self.enter(WaitingLink);
                let mut effects = vec![Effect::DumpAbort];
                if let Some(debug) = debug {
                    effects.push(Effect::Broadcast(debug));
                }
                effects.push(Effect::HalReset(ResetType::Cold));
                effects.push(Effect::ArmTimer(self.timers.link));
                effects
            }
            (StoppingDaemons, CtrlEvent::NvmStop) => {
                let mut effects = vec![Effect::DisarmTimer];
                match self.pending {
                    Pending::Reset => {
                        let reset = if self.backup {
                            ResetType::Backup
                        } else {
                            ResetType::Cold
                        };
                        self.link_down_seen = false;
                        self.enter(WaitingLink);
                        effects.push(Effect::HalReset(reset));
                        effects.push(Effect::ArmTimer(self.timers.link));
                    }
                    Pending::Stop => {
                        effects.push(Effect::HalShutdown);
                        if self.link_down_seen {
                            effects.extend(self.enter_off());
                        } else {
                            self.enter(WaitingLink);
                            effects.push(Effect::ArmTimer(self.timers.link));
                        }
                    }
                    pending => {
                        error!("NVM stopped with pending {:?}", pending);
                        effects.push(Effect::Fatal("NVM stop without reset or stop pending"));
                    }
                }
                effects
            }
            (StoppingDaemons, CtrlEvent::Stop) => {
                // A release overtook an in-flight reset; finish the
                // cycle as a stop.
                self.op = Some(OpKind::Stop);
                self.pending = Pending::Stop;
                self.backup = false;
                Vec::new()
            }
            (StoppingDaemons, CtrlEvent::Reset { kind, debug }) => {
                self.op = Some(OpKind::Restart);
                self.pending = Pending::Reset;
                self.backup = kind == RestartKind::NvmBackup;
                self.update = kind == RestartKind::Update;
                match debug {
                    Some(debug) => vec![Effect::Broadcast(debug)],
                    None => Vec::new(),
                }
            }
            (StoppingDaemons, CtrlEvent::MdmOff)
            | (StoppingDaemons, CtrlEvent::MdmLinkDown) => {
                self.link_down_seen = true;
                Vec::new()
            }
            (StoppingDaemons, CtrlEvent::Timeout) => self.corrective(
                Effect::NvmStop,
                self.timers.daemons,
                "NVM sync did not stop",
            ),
            (WaitingLink, CtrlEvent::MdmLinkDown) | (WaitingLink, CtrlEvent::MdmOff) => {
                self.link_down_seen = true;
                match self.pending {
                    Pending::Stop => {
                        let mut effects = vec![Effect::DisarmTimer];
                        effects.extend(self.enter_off());
                        effects
                    }
                    Pending::Reset => {
                        let mut effects = vec![Effect::DisarmTimer];
                        effects.extend(self.backup_effects());
                        self.enter(Booting);
                        effects.push(Effect::ArmTimer(self.timers.boot));
                        effects
                    }
                    pending => {
                        error!("link down with pending {:?}", pending);
                        vec![Effect::Fatal("link down without reset or stop pending")]
                    }
                }
            }
            (WaitingLink, CtrlEvent::MdmFlashReady { nodes }) => {
                // The modem came back before the link-down was seen.
                let mut effects = vec![Effect::DisarmTimer];
                effects.extend(self.backup_effects());
                self.pending = Pending::Boot;
                self.enter(Flashing);
                effects.push(Effect::NotifyState(ModemState::Flash));
                effects.push(Effect::FwFlash { nodes: nodes });
                effects
            }
            (WaitingLink, CtrlEvent::Timeout) => {
                self.timeout_count += 1;
                if self.timeout_count == 1 {
                    // One explicit retry of the stop or reset.
                    let action = match self.pending {
                        Pending::Stop => Effect::HalShutdown,
                        _ => Effect::HalReset(ResetType::Cold),
                    };
                    warn!("no link-down event, retrying once");
                    vec![action, Effect::ArmTimer(self.timers.link)]
                } else {
                    self.give_up()
                }
            }
            (Booting, CtrlEvent::Timeout) => {
                self.timeout_count += 1;
                if self.timeout_count == 1 {
                    warn!("modem did not boot, retrying power-on");
                    vec![Effect::HalPowerOn, Effect::ArmTimer(self.timers.boot)]
                } else {
                    self.give_up()
                }
            }
            (state, evt) => {
                error!("missing action for {} in state {}", evt, state);
                vec![Effect::Fatal("missing control action")]
            }
        }
    }

    fn enter(&mut self, state: CtrlState) {
        if self.state != state {
            debug!("{} -> {}", self.state, state);
            self.state = state;
            self.timeout_count = 0;
        }
    }

    fn enter_running(&mut self) -> Vec<Effect> {
        self.enter(CtrlState::Running);
        self.pending = Pending::None;
        self.boot_attempts = 0;
        self.cfg_retried = false;
        self.update = false;
        let mut effects = vec![Effect::DisarmTimer, Effect::NotifyState(ModemState::Ready)];
        if self.op.take().is_some() {
            effects.push(Effect::OperationResult(0));
        }
        effects
    }

    fn enter_off(&mut self) -> Vec<Effect> {
        self.enter(CtrlState::Off);
        self.pending = Pending::None;
        self.backup = false;
        let mut effects = vec![Effect::NotifyState(ModemState::Off)];
        if self.op.take().is_some() {
            effects.push(Effect::OperationResult(0));
        }
        effects
    }

    /// The modem cannot be recovered: report out-of-service and fall
    /// back to OFF.
    fn give_up(&mut self) -> Vec<Effect> {
        self.enter(CtrlState::Off);
        self.pending = Pending::None;
        self.op = None;
        self.backup = false;
        vec![
            Effect::DisarmTimer,
            Effect::NotifyState(ModemState::Unresponsive),
        ]
    }

    /// Implicit reset cycle after the modem bounced on its own. The
    /// client abstraction is told the modem needs a reset; recovery is
    /// driven from here without a client request.
    fn self_reset(&mut self, debug: Option<DbgInfo>) -> Vec<Effect> {
        self.boot_attempts += 1;
        if self.boot_attempts >= MAX_BOOT_ATTEMPTS && !self.escalation_disabled {
            warn!("modem failed {} boot chains in a row", self.boot_attempts);
            return self.give_up();
        }
        let mut effects = vec![Effect::DisarmTimer, Effect::NotifyState(ModemState::NeedReset)];
        if let Some(debug) = debug {
            effects.push(Effect::Broadcast(debug));
        }
        match self.state {
            CtrlState::Running | CtrlState::StartingDaemons => {
                effects.extend(self.stop_daemons(Pending::Reset));
            }
            _ => {
                self.pending = Pending::Reset;
                self.link_down_seen = false;
                self.enter(CtrlState::WaitingLink);
                effects.push(Effect::HalReset(ResetType::Cold));
                effects.push(Effect::ArmTimer(self.timers.link));
            }
        }
        effects
    }

    fn stop_daemons(&mut self, pending: Pending) -> Vec<Effect> {
        self.pending = pending;
        self.link_down_seen = false;
        self.enter(CtrlState::StoppingDaemons);
        vec![Effect::NvmStop, Effect::ArmTimer(self.timers.daemons)]
    }

    // The executor reports backup success or failure to the clients;
    // only it knows whether the copy went through.
    fn backup_effects(&mut self) -> Vec<Effect> {
        if self.backup {
            self.backup = false;
            vec![Effect::BackupCalibration]
        } else {
            Vec::new()
        }
    }

    /// Rule for recoverable timeouts: the first occurrence retries the
    /// in-flight action, the second gives the modem up.
    fn corrective(&mut self, action: Effect, rearm: i64, what: &str) -> Vec<Effect> {
        self.timeout_count += 1;
        if self.timeout_count == 1 {
            warn!("{}, retrying once", what);
            vec![action, Effect::ArmTimer(rearm)]
        } else {
            error!("{} twice, giving up", what);
            self.give_up()
        }
    }
}

#[cfg(test)]
mod test {
    use protocol::{DbgInfo, DbgType};

    use super::*;
    use config::Config;

    fn control() -> Control {
        Control::new(&Config::default())
    }

    fn flash_ready() -> CtrlEvent {
        CtrlEvent::MdmFlashReady {
            nodes: String::from("/dev/flash"),
        }
    }

    /// Drive a fresh machine from OFF to RUNNING, checking each hop.
    fn boot_to_running(control: &mut Control) {
        let effects = control.handle(CtrlEvent::Power);
        assert_eq!(effects[0], Effect::HalPowerOn);
        assert_eq!(control.state(), CtrlState::Booting);

        let effects = control.handle(flash_ready());
        assert!(effects.contains(&Effect::NotifyState(ModemState::Flash)));
        assert!(effects.iter().any(|e| match *e {
            Effect::FwFlash { .. } => true,
            _ => false,
        }));
        assert_eq!(control.state(), CtrlState::Flashing);

        let effects = control.handle(CtrlEvent::FwFlashed { success: true });
        assert_eq!(effects, vec![Effect::Feed(CtrlEvent::Boot)]);

        let effects = control.handle(CtrlEvent::Boot);
        assert!(effects.contains(&Effect::HalBoot));
        assert!(effects.contains(&Effect::StartConfigure));
        assert_eq!(control.state(), CtrlState::Configuring);

        let effects = control.handle(CtrlEvent::MdmConfigured);
        assert!(effects.contains(&Effect::NvmStart));
        assert_eq!(control.state(), CtrlState::StartingDaemons);
        if !control.tlv_applied {
            assert!(effects.contains(&Effect::StartTlv));
            let effects = control.handle(CtrlEvent::CustomizationDone { success: true });
            assert!(effects.contains(&Effect::Broadcast(DbgInfo::bare(DbgType::TlvSuccess))));
        }

        let effects = control.handle(CtrlEvent::NvmRun);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Ready)));
        assert_eq!(control.state(), CtrlState::Running);
    }

    #[test]
    fn boots_from_off_to_running() {
        let mut control = control();
        boot_to_running(&mut control);
    }

    #[test]
    fn customization_runs_once_per_lifetime() {
        let mut control = control();
        boot_to_running(&mut control);
        assert!(control.tlv_applied);
        // Cold reset cycle: daemons stop, link drops, modem reboots.
        control.handle(CtrlEvent::Reset {
            kind: RestartKind::Restart,
            debug: None,
        });
        control.handle(CtrlEvent::NvmStop);
        control.handle(CtrlEvent::MdmLinkDown);
        control.handle(flash_ready());
        control.handle(CtrlEvent::FwFlashed { success: true });
        let effects = control.handle(CtrlEvent::Boot);
        assert!(effects.contains(&Effect::StartConfigure));
        let effects = control.handle(CtrlEvent::MdmConfigured);
        assert!(!effects.contains(&Effect::StartTlv));
        let effects = control.handle(CtrlEvent::NvmRun);
        assert!(effects.contains(&Effect::OperationResult(0)));
        assert_eq!(control.state(), CtrlState::Running);
    }

    #[test]
    fn update_restart_replays_customization() {
        let mut control = control();
        boot_to_running(&mut control);
        control.handle(CtrlEvent::Reset {
            kind: RestartKind::Update,
            debug: None,
        });
        control.handle(CtrlEvent::NvmStop);
        control.handle(CtrlEvent::MdmLinkDown);
        control.handle(flash_ready());
        control.handle(CtrlEvent::FwFlashed { success: true });
        control.handle(CtrlEvent::Boot);
        let effects = control.handle(CtrlEvent::MdmConfigured);
        assert!(effects.contains(&Effect::StartTlv));
    }

    #[test]
    fn reset_broadcasts_attached_debug_info() {
        let mut control = control();
        boot_to_running(&mut control);
        let debug = DbgInfo::with_data(DbgType::Apimr, vec![String::from("First")]);
        let effects = control.handle(CtrlEvent::Reset {
            kind: RestartKind::Restart,
            debug: Some(debug.clone()),
        });
        assert_eq!(effects[0], Effect::NotifyState(ModemState::Busy));
        assert!(effects.contains(&Effect::Broadcast(debug)));
        assert!(effects.contains(&Effect::NvmStop));
        assert_eq!(control.state(), CtrlState::StoppingDaemons);
    }

    #[test]
    fn stop_issues_cfun_and_powers_off() {
        let mut control = control();
        boot_to_running(&mut control);
        let effects = control.handle(CtrlEvent::Stop);
        assert!(effects.contains(&Effect::AtCfunOff));
        assert_eq!(control.state(), CtrlState::StoppingDaemons);
        let effects = control.handle(CtrlEvent::NvmStop);
        assert!(effects.contains(&Effect::HalShutdown));
        assert_eq!(control.state(), CtrlState::WaitingLink);
        let effects = control.handle(CtrlEvent::MdmLinkDown);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Off)));
        assert!(effects.contains(&Effect::OperationResult(0)));
        assert_eq!(control.state(), CtrlState::Off);
    }

    #[test]
    fn stop_skips_link_wait_when_already_down() {
        let mut control = control();
        boot_to_running(&mut control);
        control.handle(CtrlEvent::Stop);
        control.handle(CtrlEvent::MdmLinkDown);
        let effects = control.handle(CtrlEvent::NvmStop);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Off)));
        assert_eq!(control.state(), CtrlState::Off);
    }

    #[test]
    fn backup_copies_calibration_on_the_way_down() {
        let mut control = control();
        boot_to_running(&mut control);
        control.handle(CtrlEvent::Reset {
            kind: RestartKind::NvmBackup,
            debug: None,
        });
        let effects = control.handle(CtrlEvent::NvmStop);
        assert!(effects.contains(&Effect::HalReset(ResetType::Backup)));
        let effects = control.handle(CtrlEvent::MdmLinkDown);
        assert!(effects.contains(&Effect::BackupCalibration));
        assert_eq!(control.state(), CtrlState::Booting);
    }

    #[test]
    fn crash_runs_the_dump_chain() {
        let mut control = control();
        boot_to_running(&mut control);
        let effects = control.handle(CtrlEvent::MdmCrash);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Dump)));
        assert_eq!(control.state(), CtrlState::WaitingDump);
        let effects = control.handle(CtrlEvent::MdmDumpReady {
            nodes: String::from("/dev/dump"),
        });
        assert!(effects.contains(&Effect::HalReset(ResetType::Warm)));
        let effects = control.handle(CtrlEvent::MdmFlashReady {
            nodes: String::from("/dev/dump"),
        });
        assert!(effects.contains(&Effect::Broadcast(DbgInfo::bare(DbgType::DumpStart))));
        assert!(effects.iter().any(|e| match *e {
            Effect::DumpRead { .. } => true,
            _ => false,
        }));
        let effects = control.handle(CtrlEvent::DumpDone { success: true });
        assert!(effects.contains(&Effect::Broadcast(DbgInfo::bare(DbgType::DumpEnd))));
        assert!(effects.contains(&Effect::HalReset(ResetType::Cold)));
        assert_eq!(control.state(), CtrlState::WaitingLink);
    }

    #[test]
    fn disabled_dumps_turn_crash_into_self_reset() {
        let mut control = control();
        control.dumps_disabled = true;
        boot_to_running(&mut control);
        control.handle(CtrlEvent::MdmCrash);
        let effects = control.handle(CtrlEvent::MdmDumpReady {
            nodes: String::from("/dev/dump"),
        });
        assert!(effects.contains(&Effect::NotifyState(ModemState::NeedReset)));
        assert!(effects.contains(&Effect::Broadcast(DbgInfo::bare(DbgType::SelfReset))));
        assert!(effects.contains(&Effect::HalReset(ResetType::Cold)));
        assert_eq!(control.state(), CtrlState::WaitingLink);
    }

    #[test]
    fn silent_reset_suppresses_the_debug_broadcast() {
        let mut control = control();
        control.silent_reset = true;
        boot_to_running(&mut control);
        let effects = control.handle(CtrlEvent::MdmLinkDown);
        assert!(effects.contains(&Effect::NotifyState(ModemState::NeedReset)));
        assert!(!effects
            .iter()
            .any(|e| *e == Effect::Broadcast(DbgInfo::bare(DbgType::SelfReset))));
    }

    #[test]
    fn mux_hangup_cascades_an_implicit_reset() {
        let mut control = control();
        boot_to_running(&mut control);
        let effects = control.handle(CtrlEvent::MuxHangup);
        assert!(effects.contains(&Effect::NotifyState(ModemState::NeedReset)));
        assert!(effects.iter().any(|e| match *e {
            Effect::Broadcast(ref dbg) => dbg.kind == DbgType::Error,
            _ => false,
        }));
        assert!(effects.contains(&Effect::NvmStop));
        assert_eq!(control.state(), CtrlState::StoppingDaemons);
    }

    #[test]
    fn mux_dead_is_out_of_service() {
        let mut control = control();
        boot_to_running(&mut control);
        let effects = control.handle(CtrlEvent::MuxDead);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Unresponsive)));
        assert_eq!(control.state(), CtrlState::Off);
    }

    #[test]
    fn two_firmware_failures_give_the_modem_up() {
        let mut control = control();
        control.handle(CtrlEvent::Power);
        control.handle(flash_ready());
        // First failure: one retry through a cold reset.
        let effects = control.handle(CtrlEvent::FwFlashed { success: false });
        assert!(effects.contains(&Effect::HalReset(ResetType::Cold)));
        assert_eq!(control.state(), CtrlState::WaitingLink);
        control.handle(CtrlEvent::MdmLinkDown);
        assert_eq!(control.state(), CtrlState::Booting);
        control.handle(flash_ready());
        // Second failure: FW_FAILURE then out-of-service.
        let effects = control.handle(CtrlEvent::FwFlashed { success: false });
        assert_eq!(
            effects[0],
            Effect::Broadcast(DbgInfo::bare(DbgType::FwFailure))
        );
        assert!(effects.contains(&Effect::NotifyState(ModemState::Unresponsive)));
        assert_eq!(control.state(), CtrlState::Off);
    }

    #[test]
    fn boot_timeout_retries_once_then_gives_up() {
        let mut control = control();
        control.handle(CtrlEvent::Power);
        let effects = control.handle(CtrlEvent::Timeout);
        assert!(effects.contains(&Effect::HalPowerOn));
        assert_eq!(control.state(), CtrlState::Booting);
        let effects = control.handle(CtrlEvent::Timeout);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Unresponsive)));
        assert_eq!(control.state(), CtrlState::Off);
    }

    #[test]
    fn link_timeout_retries_the_stop_once() {
        let mut control = control();
        boot_to_running(&mut control);
        control.handle(CtrlEvent::Stop);
        control.handle(CtrlEvent::NvmStop);
        assert_eq!(control.state(), CtrlState::WaitingLink);
        let effects = control.handle(CtrlEvent::Timeout);
        assert!(effects.contains(&Effect::HalShutdown));
        let effects = control.handle(CtrlEvent::Timeout);
        assert!(effects.contains(&Effect::NotifyState(ModemState::Unresponsive)));
        assert_eq!(control.state(), CtrlState::Off);
    }

    #[test]
    fn configure_failure_retries_then_resets() {
        let mut control = control();
        control.handle(CtrlEvent::Power);
        control.handle(flash_ready());
        control.handle(CtrlEvent::FwFlashed { success: true });
        control.handle(CtrlEvent::Boot);
        assert_eq!(control.state(), CtrlState::Configuring);
        let effects = control.handle(CtrlEvent::Timeout);
        assert!(effects.contains(&Effect::StartConfigure));
        assert_eq!(control.state(), CtrlState::Configuring);
        let effects = control.handle(CtrlEvent::Timeout);
        assert!(effects.contains(&Effect::NotifyState(ModemState::NeedReset)));
        assert_eq!(control.state(), CtrlState::WaitingLink);
    }

    #[test]
    fn requests_in_flight_are_rejected_without_effects() {
        let mut control = control();
        control.handle(CtrlEvent::Power);
        // Power again while booting is a sequencing bug upstream.
        assert!(control.handle(CtrlEvent::Power).is_empty());
        assert_eq!(control.state(), CtrlState::Booting);
        // Stop while off is equally rejected.
        let mut off = self::control();
        assert!(off.handle(CtrlEvent::Stop).is_empty());
        assert_eq!(off.state(), CtrlState::Off);
    }

    #[test]
    fn release_overtakes_reset_while_stopping_daemons() {
        let mut control = control();
        boot_to_running(&mut control);
        control.handle(CtrlEvent::Reset {
            kind: RestartKind::Restart,
            debug: None,
        });
        assert_eq!(control.state(), CtrlState::StoppingDaemons);
        control.handle(CtrlEvent::Stop);
        let effects = control.handle(CtrlEvent::NvmStop);
        assert!(effects.contains(&Effect::HalShutdown));
    }
}
