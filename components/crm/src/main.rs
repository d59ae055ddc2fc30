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

extern crate clap;
extern crate crm;
extern crate crm_core;
extern crate env_logger;
extern crate libc;
#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

use clap::{App, Arg};

use crm::VERSION;
use crm::config::Config;
use crm::error::Result;
use crm::manager::{workers, Manager};
use crm_core::factory::ProcessFactory;

static CONFIG_DIR_ENVVAR: &'static str = "CRM_CONFIG_DIR";
static DEFAULT_CONFIG_DIR: &'static str = "/etc/crm";

static SHUTDOWN_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_sig: libc::c_int) {
    // Only one byte crosses the signal boundary; the event loop does
    // the actual teardown.
    let fd = SHUTDOWN_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn main() {
    env_logger::init();
    match start() {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{}", err);
            println!("{}", err);
            process::exit(1);
        }
    }
}

fn start() -> Result<i32> {
    let matches = App::new("crm")
        .about("Cellular Resource Manager daemon")
        .version(VERSION)
        .arg(
            Arg::with_name("VERSION")
                .short("v")
                .help("Print the CRM version"),
        )
        .arg(
            Arg::with_name("INSTANCE")
                .short("i")
                .takes_value(true)
                .help("Instance id of the managed modem (default: 0)"),
        )
        .get_matches();
    if matches.is_present("VERSION") {
        println!("crm {}", VERSION);
        return Ok(0);
    }
    let instance = matches
        .value_of("INSTANCE")
        .map(|raw| match raw.parse::<u32>() {
            Ok(instance) => instance,
            Err(_) => {
                println!("invalid instance id '{}'", raw);
                process::exit(1);
            }
        })
        .unwrap_or(0);

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    // The factory must fork its supervisor before the daemon grows
    // threads or descriptors workers should not inherit.
    let factory = ProcessFactory::init(2, workers::REGISTRY)?;

    let config_dir = ::std::env::var(CONFIG_DIR_ENVVAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
    let config = Config::load(&config_dir, instance)?;
    debug!("configuration: {:?}", config);

    let mut manager = Manager::new(config, factory)?;
    SHUTDOWN_FD.store(manager.shutdown_handle().fd(), Ordering::SeqCst);
    unsafe {
        let mut action: libc::sigaction = ::std::mem::zeroed();
        action.sa_sigaction = on_signal as usize;
        libc::sigaction(libc::SIGTERM, &action, ::std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &action, ::std::ptr::null_mut());
    }

    let code = manager.run()?;
    manager.dispose();
    Ok(code)
}
