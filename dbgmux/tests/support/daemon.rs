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

use std::{
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::Arc,
    thread, time,
};

use anyhow::Context;
use libdbgmux::{config::Config, daemon::server::Server, events::EventStore, protocol::Client};
use tempfile::TempDir;

/// An in-process daemon listening on a socket inside a tempdir. The
/// server threads die with the test process.
pub struct Daemon {
    pub socket_path: PathBuf,
    _tmp_dir: TempDir,
}

impl Daemon {
    pub fn spawn() -> anyhow::Result<Daemon> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("dbgmux-test")
            .tempdir()
            .context("creating tmp dir")?;
        let socket_path = tmp_dir.path().join("dbg.sock");

        let store = Arc::new(EventStore::open(None).context("opening store")?);
        let server = Server::new(Config::default(), store);
        let listener = UnixListener::bind(&socket_path).context("binding socket")?;
        thread::spawn(move || {
            let _ = Server::serve(server, listener);
        });

        // spin until we can dial the socket successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            }
            thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Ok(Daemon { socket_path, _tmp_dir: tmp_dir })
    }

    pub fn client(&self) -> anyhow::Result<Client> {
        Client::new(&self.socket_path)
    }
}
