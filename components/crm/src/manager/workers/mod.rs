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

//! Worker modules hosting the long-running or crash-prone steps of
//! the modem lifecycle.
//!
//! Firmware upload and dump retrieval run in worker *processes*
//! through the factory (a fault in them must not take the daemon
//! down); configuration, customization and NVM sync are worker
//! threads. Every worker reports through message scalars defined
//! here and terminates when its inbound channel hangs up.

pub mod configure;
pub mod custo;
pub mod dump;
pub mod fw_upload;
pub mod nvm;

use crm_core::factory::Registry;

// Scalars published on worker child-to-parent channels.
pub const MSG_FW_PACKAGED: i64 = 1;
pub const MSG_FW_FLASHED: i64 = 2;
pub const MSG_FW_FAILED: i64 = 3;
pub const MSG_DUMP_DONE: i64 = 4;
pub const MSG_DUMP_FAILED: i64 = 5;
pub const MSG_CFG_DONE: i64 = 6;
pub const MSG_CFG_FAILED: i64 = 7;
pub const MSG_CUSTO_DONE: i64 = 8;
pub const MSG_CUSTO_FAILED: i64 = 9;
pub const MSG_NVM_RUNNING: i64 = 10;
pub const MSG_NVM_STOPPED: i64 = 11;

// Commands to the NVM worker thread.
pub const CMD_NVM_START: i64 = 1;
pub const CMD_NVM_STOP: i64 = 2;

/// The closed registry of worker-process entry points. Must be handed
/// to the factory before the daemon grows threads.
pub static REGISTRY: Registry = &[
    ("fw_upload", fw_upload::worker_main),
    ("dump", dump::worker_main),
];
