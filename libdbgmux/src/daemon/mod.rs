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
    fs,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, anyhow};
use tracing::{info, instrument};

use crate::{config, events::EventStore};

pub mod server;
mod signals;

#[instrument(skip_all)]
pub fn run(config_file: Option<String>, socket: PathBuf) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let config = config::read_config(&config_file)?;
    let store = Arc::new(
        EventStore::open(config.event_log.clone().map(PathBuf::from))
            .context("opening event log")?,
    );

    let server = server::Server::new(config, Arc::clone(&store));

    let listener = claim_socket(&socket)?;

    // spawn the signal handler thread in the background
    signals::Handler::new(socket.clone(), server.manager(), Arc::clone(&store)).spawn()?;

    server::Server::serve(server, listener)?;

    store.close();
    fs::remove_file(&socket).context("cleaning up socket on exit")?;
    Ok(())
}

/// Bind the control socket without displacing a live daemon: if
/// something answers on the path, a second instance is refused; a
/// leftover socket file nobody answers on is swept and rebound.
fn claim_socket(socket: &Path) -> anyhow::Result<UnixListener> {
    if socket.exists() {
        match UnixStream::connect(socket) {
            Ok(_) => {
                return Err(anyhow!(
                    "daemon already running on {}",
                    socket.display()
                ));
            }
            Err(_) => {
                info!("removing stale socket {}", socket.display());
                fs::remove_file(socket).context("removing stale socket")?;
            }
        }
    }
    UnixListener::bind(socket)
        .with_context(|| format!("binding to socket {}", socket.display()))
}
