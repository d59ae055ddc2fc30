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

//! Daemon configuration (the "TCS" layer): one TOML file per
//! instance, read once at init. Every section has working defaults so
//! a bare `[hal] variant = "stub"` file is a complete host setup.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use toml;

use error::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub instance: u32,
    pub daemon: DaemonCfg,
    pub node: NodeCfg,
    pub timer: TimerCfg,
    pub nvm: NvmCfg,
    pub firmware: FirmwareCfg,
    pub hal: HalCfg,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DaemonCfg {
    /// Directory holding the `crm<instance>` client socket.
    pub run_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeCfg {
    pub modem: PathBuf,
    pub ping: PathBuf,
    pub shutdown: PathBuf,
    pub flash: PathBuf,
    pub dump: PathBuf,
    pub mux: PathBuf,
    pub tlv: PathBuf,
}

/// All values in milliseconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimerCfg {
    /// Power-on to flash-ready.
    pub boot: i64,
    /// Ping + MUX mount + AT probe budget.
    pub configure: i64,
    /// NVM sync start/stop budget.
    pub daemons: i64,
    /// Link-down wait after a reset or stop request.
    pub link: i64,
    /// Client cold-reset / shutdown acknowledgement deadline.
    pub ack: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NvmCfg {
    pub folder: PathBuf,
    pub calib_file: String,
    pub backup_file: String,
    /// Raw-partition backup target: plain write instead of
    /// write-then-rename.
    pub raw_backup: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FirmwareCfg {
    /// Packaged firmware image flashed at each boot.
    pub path: PathBuf,
    /// Directory of TLV customization scripts.
    pub tlv_dir: PathBuf,
    /// Directory dump files are written to.
    pub dump_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HalCfg {
    /// HAL variant from the closed registry: `stub` or `device`.
    pub variant: String,
    /// Flashless modem: firmware is uploaded on every boot.
    pub flashless: bool,
    /// Run the ping / AT probe during configuration. The stub modem
    /// has no AT endpoint, so its profile turns this off.
    pub at_probe: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            instance: 0,
            daemon: DaemonCfg::default(),
            node: NodeCfg::default(),
            timer: TimerCfg::default(),
            nvm: NvmCfg::default(),
            firmware: FirmwareCfg::default(),
            hal: HalCfg::default(),
        }
    }
}

impl Default for DaemonCfg {
    fn default() -> DaemonCfg {
        DaemonCfg {
            run_dir: PathBuf::from("/tmp"),
        }
    }
}

impl Default for NodeCfg {
    fn default() -> NodeCfg {
        NodeCfg {
            modem: PathBuf::from("/dev/mdm_ctrl"),
            ping: PathBuf::from("/dev/gsmtty1"),
            shutdown: PathBuf::from("/dev/gsmtty2"),
            flash: PathBuf::from("/dev/flash_ctrl"),
            dump: PathBuf::from("/dev/dump_ctrl"),
            mux: PathBuf::from("/dev/ttyACM0"),
            tlv: PathBuf::from("/dev/gsmtty9"),
        }
    }
}

impl Default for TimerCfg {
    fn default() -> TimerCfg {
        TimerCfg {
            boot: 3000,
            configure: 10_000,
            daemons: 5000,
            link: 1000,
            ack: 1000,
        }
    }
}

impl Default for NvmCfg {
    fn default() -> NvmCfg {
        NvmCfg {
            folder: PathBuf::from("/var/lib/crm/nvm"),
            calib_file: String::from("calib.nvm"),
            backup_file: String::from("calib_bkup.nvm"),
            raw_backup: false,
        }
    }
}

impl Default for FirmwareCfg {
    fn default() -> FirmwareCfg {
        FirmwareCfg {
            path: PathBuf::from("/var/lib/crm/modem.fls"),
            tlv_dir: PathBuf::from("/var/lib/crm/tlv"),
            dump_dir: PathBuf::from("/var/lib/crm/dump"),
        }
    }
}

impl Default for HalCfg {
    fn default() -> HalCfg {
        HalCfg {
            variant: String::from("device"),
            flashless: true,
            at_probe: true,
        }
    }
}

impl Config {
    /// Read `<dir>/crm<instance>.toml`; a missing file yields the
    /// defaults so a host run needs no setup.
    pub fn load(dir: &Path, instance: u32) -> Result<Config> {
        let path = dir.join(format!("crm{}.toml", instance));
        if !path.exists() {
            debug!("no configuration at {}, using defaults", path.display());
            let mut config = Config::default();
            config.instance = instance;
            return Ok(config);
        }
        let mut raw = String::new();
        File::open(&path)
            .and_then(|mut file| file.read_to_string(&mut raw))
            .map_err(Error::ConfigIo)?;
        let mut config = Config::parse(&raw)?;
        config.instance = instance;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Config> {
        toml::from_str(raw).map_err(Error::ConfigParse)
    }

    pub fn calib_path(&self) -> PathBuf {
        self.nvm.folder.join(&self.nvm.calib_file)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.nvm.folder.join(&self.nvm.backup_file)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.timer.boot, 3000);
        assert_eq!(config.timer.ack, 1000);
        assert!(config.hal.flashless);
    }

    #[test]
    fn parses_partial_file() {
        let config = Config::parse(
            r#"
            [hal]
            variant = "stub"
            at_probe = false

            [timer]
            ack = 250
            "#,
        ).unwrap();
        assert_eq!(config.hal.variant, "stub");
        assert!(!config.hal.at_probe);
        assert_eq!(config.timer.ack, 250);
        // Untouched sections keep their defaults.
        assert_eq!(config.timer.boot, 3000);
        assert_eq!(config.nvm.calib_file, "calib.nvm");
    }

    #[test]
    fn rejects_malformed_file() {
        assert!(Config::parse("timer = 12").is_err());
    }
}
