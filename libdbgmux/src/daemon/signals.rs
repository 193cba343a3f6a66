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
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
    thread,
};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{error, info, instrument};

use crate::{events::EventStore, session::SessionManager};

/// Orderly shutdown on a term signal. Sessions go first, because they
/// own managed target children and adapter processes that must not
/// outlive the daemon; then the event log flushes and closes so the
/// teardown's own connection events reach disk; the control socket is
/// unlinked last. A second term signal during teardown exits with
/// status 1 immediately, so a wedged session close cannot trap the
/// user.
pub struct Handler {
    sock: PathBuf,
    manager: Arc<SessionManager>,
    store: Arc<EventStore>,
}

impl Handler {
    pub fn new(sock: PathBuf, manager: Arc<SessionManager>, store: Arc<EventStore>) -> Self {
        Handler { sock, manager, store }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // The force-exit flag arms once the first signal lands;
        // conditional-shutdown must be registered before the arming
        // flag or the very first signal would exit on the spot.
        let force_exit = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&force_exit))?;
            flag::register(*sig, Arc::clone(&force_exit))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("term sig handler: got signal {}, shutting down", signal);
                self.shutdown();
            }
        });

        Ok(())
    }

    #[instrument(skip_all)]
    fn shutdown(self) {
        self.manager.close_all();
        self.store.close();

        if let Err(e) = std::fs::remove_file(&self.sock) {
            error!("error cleaning up socket file: {}", e);
        }

        info!("term sig handler: exiting");
        std::process::exit(0);
    }
}
