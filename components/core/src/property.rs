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

//! Process-wide property store.
//!
//! Stands in for the platform property bus: values are seeded from
//! `CRM_PROPERTY_<KEY>` environment variables (dots become
//! underscores, upper-cased) and can be overridden at runtime. The
//! daemon reads its behavior switches from here; tests flip them the
//! same way.

use std::collections::HashMap;
use std::env;
use std::sync::RwLock;

/// Debug clients (REGISTER_DBG) are only accepted when this is truthy.
pub const KEY_DEBUG_ENABLE: &'static str = "crm.debug_enable";
/// When truthy, a crashed modem is reset without reading a core dump.
pub const KEY_DISABLE_DUMP: &'static str = "crm.disable_dump";
/// When truthy, self-reset cycles skip the SELF_RESET debug broadcast.
pub const KEY_SILENT_RESET: &'static str = "crm.enable_silent_reset";
/// When truthy, repeated firmware failures keep retrying instead of
/// declaring the modem out of service.
pub const KEY_DISABLE_ESCALATION: &'static str = "crm.disable_escalation";

lazy_static! {
    static ref STORE: RwLock<HashMap<String, String>> = RwLock::new(HashMap::new());
}

fn env_key(key: &str) -> String {
    let mut name = String::from("CRM_PROPERTY_");
    for c in key.chars() {
        match c {
            '.' | '-' => name.push('_'),
            c => name.push(c.to_ascii_uppercase()),
        }
    }
    name
}

pub fn get(key: &str, default: &str) -> String {
    if let Some(value) = STORE.read().expect("property store poisoned").get(key) {
        return value.clone();
    }
    match env::var(env_key(key)) {
        Ok(value) => value,
        Err(_) => default.to_string(),
    }
}

pub fn get_bool(key: &str) -> bool {
    match get(key, "").as_str() {
        "1" | "true" | "on" => true,
        _ => false,
    }
}

pub fn set(key: &str, value: &str) {
    STORE
        .write()
        .expect("property store poisoned")
        .insert(key.to_string(), value.to_string());
}

pub fn clear(key: &str) {
    STORE.write().expect("property store poisoned").remove(key);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_overrides_default() {
        assert_eq!(get("crm.test_prop", "fallback"), "fallback");
        set("crm.test_prop", "1");
        assert!(get_bool("crm.test_prop"));
        clear("crm.test_prop");
        assert_eq!(get("crm.test_prop", "fallback"), "fallback");
    }
}
