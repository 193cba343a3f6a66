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
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;

use crate::{
    errors::WireError,
    events::EventStore,
    session::{Capability, Protocol, state::DebuggerState},
};

/// The capability bundle a session exposes to virtual tables and
/// command handlers. Tables depend only on this seam, never on a
/// concrete transport, which is also what makes them testable without
/// a live debugger on the other end.
pub trait Executor: Send + Sync {
    /// Issue one request on the session's wire and block for the
    /// reply. `None` inherits the session's default timeout.
    fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, WireError>;

    /// The session's state. Hold the lock briefly: everything read
    /// under one acquisition is coherent at a single stop epoch.
    fn state(&self) -> Arc<Mutex<DebuggerState>>;

    /// The process-wide event log, when this session records into one.
    fn store(&self) -> Option<Arc<EventStore>>;

    fn protocol(&self) -> Protocol;

    fn capabilities(&self) -> &'static [Capability];
}
