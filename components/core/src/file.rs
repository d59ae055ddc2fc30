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

//! File helpers for the calibration backup.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use error::{Error, Result};

/// Copy `src` over `dst` atomically: the data lands in a temporary
/// file next to `dst` first and is renamed over it, so a power cut can
/// never leave a half-written backup.
pub fn atomic_copy(src: &Path, dst: &Path) -> Result<u64> {
    let data = read(src)?;
    let tmp = dst.with_extension("tmp");
    {
        let mut out = File::create(&tmp).map_err(Error::FileIo)?;
        out.write_all(&data).map_err(Error::FileIo)?;
        out.sync_all().map_err(Error::FileIo)?;
    }
    fs::rename(&tmp, dst).map_err(Error::FileIo)?;
    Ok(data.len() as u64)
}

/// Copy `src` straight over `dst` without rename, for raw partition
/// targets where rename is meaningless.
pub fn raw_copy(src: &Path, dst: &Path) -> Result<u64> {
    let data = read(src)?;
    let mut out = File::create(dst).map_err(Error::FileIo)?;
    out.write_all(&data).map_err(Error::FileIo)?;
    out.sync_all().map_err(Error::FileIo)?;
    Ok(data.len() as u64)
}

fn read(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(Error::FileIo)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).map_err(Error::FileIo)?;
    Ok(data)
}

#[cfg(test)]
mod test {
    extern crate tempfile;

    use std::fs;

    use super::*;

    #[test]
    fn atomic_copy_replaces_backup() {
        let dir = self::tempfile::tempdir().unwrap();
        let src = dir.path().join("calib.nvm");
        let dst = dir.path().join("calib.nvm.bak");
        fs::write(&src, b"cal-v1").unwrap();
        fs::write(&dst, b"stale").unwrap();
        let written = atomic_copy(&src, &dst).unwrap();
        assert_eq!(written, 6);
        assert_eq!(fs::read(&dst).unwrap(), b"cal-v1");
        assert!(!dir.path().join("calib.nvm.tmp").exists());
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = self::tempfile::tempdir().unwrap();
        let src = dir.path().join("absent");
        let dst = dir.path().join("backup");
        assert!(atomic_copy(&src, &dst).is_err());
    }
}
