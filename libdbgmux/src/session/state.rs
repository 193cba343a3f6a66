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

//! The uniform read-only view of a debug session that virtual tables
//! materialize rows from. Only the session's own receive path mutates
//! this; everyone else takes the mutex, reads a coherent snapshot, and
//! lets go.

use std::{collections::VecDeque, fmt};

use indexmap::IndexMap;
use serde_json::Value;

use crate::consts;

#[derive(Debug, Clone, Default)]
pub struct CallFrame {
    pub id: String,
    pub function_name: String,
    pub url: String,
    pub file: String,
    pub line: i64,
    pub col: i64,
    pub script_id: String,
    pub scope_chain: Vec<Scope>,
    pub this_object_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: String,
    pub name: Option<String>,
    pub object_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AsyncFrame {
    pub id: String,
    pub function_name: String,
    pub file: String,
    pub line: i64,
    pub parent_id: Option<String>,
    pub description: String,
}

/// A registered breakpoint. The wire id is part of the record from the
/// start: a breakpoint only lands in the table once the wire has
/// acknowledged it, so clients never see one without its wire id.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub file: String,
    pub line: i64,
    pub condition: Option<String>,
    pub hits: u64,
    pub enabled: bool,
    pub wire_id: String,
}

#[derive(Debug, Clone)]
pub struct ScriptInfo {
    pub file: String,
    pub url: String,
    pub lines: i64,
    pub source_map: Option<String>,
    pub is_module: bool,
}

#[derive(Debug, Clone)]
pub struct ConsoleEntry {
    pub ts: i64,
    pub level: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub ts: i64,
    pub uncaught: bool,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub status: Option<i64>,
    pub mime_type: Option<String>,
    pub finished: bool,
}

#[derive(Debug, Clone)]
pub struct PageEvent {
    pub ts: i64,
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct WsFrame {
    pub ts: i64,
    pub direction: String,
    pub opcode: i64,
    pub payload: String,
}

/// A network mock installed by the `mock` command, answered from the
/// fetch-paused event handler.
#[derive(Debug, Clone)]
pub struct MockRule {
    pub url_pattern: String,
    pub status: u16,
    pub body: String,
}

/// Browser-wire specific sub-state.
#[derive(Debug, Clone, Default)]
pub struct BwpState {
    pub last_ws_url: Option<String>,
    pub network_requests: IndexMap<String, NetworkRequest>,
    pub page_events: VecDeque<PageEvent>,
    pub ws_frames: VecDeque<WsFrame>,
    pub coverage_snapshot: Option<Value>,
    pub mocks: Vec<MockRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NdapPhase {
    #[default]
    Starting,
    Configuring,
    Paused,
    Running,
    /// Terminal: no further request on this session can succeed.
    Terminated,
    Error,
}

impl fmt::Display for NdapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NdapPhase::Starting => "starting",
            NdapPhase::Configuring => "configuring",
            NdapPhase::Paused => "paused",
            NdapPhase::Running => "running",
            NdapPhase::Terminated => "terminated",
            NdapPhase::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct RegisterValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub id: String,
    pub name: String,
    pub path: String,
    pub address: Option<String>,
}

/// Native-wire specific sub-state.
#[derive(Debug, Clone, Default)]
pub struct NdapState {
    pub thread_id: Option<i64>,
    pub active_threads: Vec<ThreadInfo>,
    pub registers: Vec<RegisterValue>,
    pub modules: Vec<ModuleInfo>,
    pub target_triple: Option<String>,
    pub phase: NdapPhase,
    pub last_stop: Option<String>,
    pub last_error: Option<String>,
}

/// Protocol-specific sub-state as a tagged sum, so a browser session
/// can never carry native fields or vice versa.
#[derive(Debug, Clone)]
pub enum WireState {
    Bwp(BwpState),
    Ndap(NdapState),
}

impl WireState {
    pub fn bwp(&self) -> Option<&BwpState> {
        match self {
            WireState::Bwp(s) => Some(s),
            WireState::Ndap(_) => None,
        }
    }

    pub fn bwp_mut(&mut self) -> Option<&mut BwpState> {
        match self {
            WireState::Bwp(s) => Some(s),
            WireState::Ndap(_) => None,
        }
    }

    pub fn ndap(&self) -> Option<&NdapState> {
        match self {
            WireState::Ndap(s) => Some(s),
            WireState::Bwp(_) => None,
        }
    }

    pub fn ndap_mut(&mut self) -> Option<&mut NdapState> {
        match self {
            WireState::Ndap(s) => Some(s),
            WireState::Bwp(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebuggerState {
    pub connected: bool,
    pub paused: bool,
    pub pid: Option<i64>,
    pub managed_command: Option<String>,
    /// Replaced atomically on each stop event; non-empty only while
    /// paused.
    pub call_frames: Vec<CallFrame>,
    pub async_stack: Vec<AsyncFrame>,
    /// Insertion order is listing order.
    pub breakpoints: IndexMap<String, Breakpoint>,
    /// Monotonic for the life of the session: entries are added, never
    /// removed or rewritten.
    pub scripts: IndexMap<String, ScriptInfo>,
    pub console: VecDeque<ConsoleEntry>,
    pub exceptions: VecDeque<ExceptionEntry>,
    /// Bumped by one on every transition into a paused state. A reader
    /// holding the state lock at a given epoch sees the frames,
    /// async stack, and registers that belong to that stop.
    pub stop_epoch: u64,
    pub stop_reason: Option<String>,
    pub wire: WireState,

    console_cap: usize,
    exception_cap: usize,
    next_breakpoint: u64,
}

impl DebuggerState {
    pub fn new_bwp() -> DebuggerState {
        DebuggerState::new(WireState::Bwp(BwpState::default()))
    }

    pub fn new_ndap() -> DebuggerState {
        DebuggerState::new(WireState::Ndap(NdapState::default()))
    }

    fn new(wire: WireState) -> DebuggerState {
        DebuggerState {
            connected: false,
            paused: false,
            pid: None,
            managed_command: None,
            call_frames: vec![],
            async_stack: vec![],
            breakpoints: IndexMap::new(),
            scripts: IndexMap::new(),
            console: VecDeque::new(),
            exceptions: VecDeque::new(),
            stop_epoch: 0,
            stop_reason: None,
            wire,
            console_cap: consts::CONSOLE_RING_CAP,
            exception_cap: consts::EXCEPTION_RING_CAP,
            next_breakpoint: 1,
        }
    }

    pub fn set_ring_caps(&mut self, console: usize, exceptions: usize) {
        self.console_cap = console;
        self.exception_cap = exceptions;
    }

    /// Enter a paused state: replace the stack atomically and bump the
    /// epoch.
    pub fn on_paused(
        &mut self,
        reason: Option<String>,
        frames: Vec<CallFrame>,
        async_stack: Vec<AsyncFrame>,
    ) {
        self.paused = true;
        self.stop_epoch += 1;
        self.stop_reason = reason.clone();
        self.call_frames = frames;
        self.async_stack = async_stack;
        if let Some(ndap) = self.wire.ndap_mut() {
            ndap.phase = NdapPhase::Paused;
            ndap.last_stop = reason;
        }
    }

    pub fn on_resumed(&mut self) {
        self.paused = false;
        self.stop_reason = None;
        self.call_frames.clear();
        self.async_stack.clear();
        if let Some(ndap) = self.wire.ndap_mut() {
            ndap.phase = NdapPhase::Running;
            ndap.registers.clear();
        }
    }

    /// Scripts are monotonic: re-parsing an already known script id is
    /// ignored rather than rewriting the entry.
    pub fn add_script(&mut self, script_id: String, info: ScriptInfo) {
        self.scripts.entry(script_id).or_insert(info);
    }

    pub fn push_console(&mut self, entry: ConsoleEntry) {
        if self.console.len() >= self.console_cap {
            self.console.pop_front();
        }
        self.console.push_back(entry);
    }

    pub fn push_exception(&mut self, entry: ExceptionEntry) {
        if self.exceptions.len() >= self.exception_cap {
            self.exceptions.pop_front();
        }
        self.exceptions.push_back(entry);
    }

    /// Record a wire-acknowledged breakpoint and hand out its local id.
    pub fn add_breakpoint(&mut self, bp: Breakpoint) -> String {
        let id = format!("b{}", self.next_breakpoint);
        self.next_breakpoint += 1;
        self.breakpoints.insert(id.clone(), bp);
        id
    }

    pub fn remove_breakpoint(&mut self, id: &str) -> Option<Breakpoint> {
        self.breakpoints.shift_remove(id)
    }

    /// The session is done. `connected` drops before the phase flips
    /// to terminated so an observer who sees the terminal phase also
    /// sees the session as disconnected.
    pub fn mark_terminated(&mut self, error: Option<String>) {
        self.connected = false;
        self.paused = false;
        self.call_frames.clear();
        self.async_stack.clear();
        if let Some(ndap) = self.wire.ndap_mut() {
            ndap.phase = if error.is_some() { NdapPhase::Error } else { NdapPhase::Terminated };
            ndap.last_error = error;
        }
    }

    #[cfg(test)]
    pub fn push_frame_for_test(&mut self, function: &str, file: &str, line: i64) {
        let n = self.call_frames.len();
        self.paused = true;
        self.call_frames.push(CallFrame {
            id: format!("f{n}"),
            function_name: String::from(function),
            url: format!("file://{file}"),
            file: String::from(file),
            line,
            col: 0,
            script_id: format!("{}", n + 1),
            scope_chain: vec![],
            this_object_id: None,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_epoch_bumps_on_every_pause() {
        let mut state = DebuggerState::new_ndap();
        assert_eq!(state.stop_epoch, 0);

        state.on_paused(Some(String::from("breakpoint")), vec![CallFrame::default()], vec![]);
        assert_eq!(state.stop_epoch, 1);
        assert!(state.paused);

        state.on_resumed();
        assert!(!state.paused);
        assert!(state.call_frames.is_empty());

        state.on_paused(Some(String::from("step")), vec![CallFrame::default()], vec![]);
        assert_eq!(state.stop_epoch, 2);
    }

    #[test]
    fn scripts_are_monotonic() {
        let mut state = DebuggerState::new_bwp();
        let info = |file: &str| ScriptInfo {
            file: String::from(file),
            url: format!("file://{file}"),
            lines: 10,
            source_map: None,
            is_module: false,
        };
        state.add_script(String::from("1"), info("a.ts"));
        state.add_script(String::from("1"), info("clobbered.ts"));
        assert_eq!(state.scripts.get("1").unwrap().file, "a.ts");
    }

    #[test]
    fn console_ring_is_bounded() {
        let mut state = DebuggerState::new_bwp();
        state.set_ring_caps(4, 4);
        for i in 0..10 {
            state.push_console(ConsoleEntry {
                ts: i,
                level: String::from("log"),
                text: format!("line {i}"),
            });
        }
        assert_eq!(state.console.len(), 4);
        assert_eq!(state.console.front().unwrap().text, "line 6");
    }

    #[test]
    fn breakpoints_keep_insertion_order() {
        let mut state = DebuggerState::new_bwp();
        let bp = |file: &str| Breakpoint {
            file: String::from(file),
            line: 1,
            condition: None,
            hits: 0,
            enabled: true,
            wire_id: format!("wire:{file}"),
        };
        let first = state.add_breakpoint(bp("a.ts"));
        let second = state.add_breakpoint(bp("b.ts"));
        state.add_breakpoint(bp("c.ts"));
        state.remove_breakpoint(&second);

        let files: Vec<&str> =
            state.breakpoints.values().map(|b| b.file.as_str()).collect();
        assert_eq!(files, vec!["a.ts", "c.ts"]);
        assert_eq!(first, "b1");
    }

    #[test]
    fn terminated_observers_see_disconnected() {
        let mut state = DebuggerState::new_ndap();
        state.connected = true;
        state.mark_terminated(None);
        assert!(!state.connected);
        assert_eq!(state.wire.ndap().unwrap().phase, NdapPhase::Terminated);
    }
}
