// Copyright 2025 Google LLC
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

use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("dbgmux");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Path to the native debug adapter binary. The LLDB_DAP_PATH
    /// environment variable takes precedence over this, and both fall
    /// back to resolving `lldb-dap` from PATH.
    pub lldb_dap_path: Option<String>,

    /// Default deadline in milliseconds for a single wire request on
    /// either protocol. 10s if unset.
    pub request_timeout_ms: Option<u64>,

    /// Overall deadline in milliseconds for a native attach, covering
    /// every strategy tried. 30s if unset. Individual attach requests
    /// may override this.
    pub attach_deadline_ms: Option<u64>,

    /// Where to put the event log. Defaults to an in-memory database,
    /// which means events do not survive a daemon restart.
    pub event_log: Option<String>,

    /// How many console messages to keep per session before dropping
    /// the oldest.
    pub console_ring_cap: Option<usize>,

    /// How many exception records to keep per session before dropping
    /// the oldest.
    pub exception_ring_cap: Option<usize>,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms.map(Duration::from_millis).unwrap_or(consts::REQUEST_TIMEOUT)
    }

    pub fn attach_deadline(&self) -> Duration {
        self.attach_deadline_ms.map(Duration::from_millis).unwrap_or(consts::ATTACH_DEADLINE)
    }

    pub fn console_ring_cap(&self) -> usize {
        self.console_ring_cap.unwrap_or(consts::CONSOLE_RING_CAP)
    }

    pub fn exception_ring_cap(&self) -> usize {
        self.exception_ring_cap.unwrap_or(consts::EXCEPTION_RING_CAP)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            lldb_dap_path = "/opt/llvm/bin/lldb-dap"
            "#,
            r#"
            request_timeout_ms = 2500
            attach_deadline_ms = 60000
            "#,
            r#"
            event_log = "/tmp/dbgmux-events.db"
            console_ring_cap = 64
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), consts::REQUEST_TIMEOUT);
        assert_eq!(config.attach_deadline(), consts::ATTACH_DEADLINE);
    }
}
