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

use std::fmt;

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The wire protocol between a dbgmux client and the daemon is a stream
/// of newline-framed JSON objects over a unix socket. The client writes
/// one `Command` per line and the daemon answers each with exactly one
/// `Response` line before reading the next command.
///
/// Every command that operates on a session accepts an optional `s`
/// selector naming the session to target. When `s` is absent the daemon
/// uses the current session (the one most recently selected with `use`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    /// Spawn a managed target process and attach to it.
    ///
    /// Responds with the new session's name, protocol, and target type.
    Open(TargetSpec),
    /// Attach to an already-listening debug endpoint.
    Attach(TargetSpec),
    /// Attach to a native process through the lldb debug adapter,
    /// consuming a resolution produced by a device provider.
    AttachLldb(NativeResolution),
    /// Close a session, tearing down its transport and killing any
    /// managed child.
    Close {
        #[serde(default)]
        s: Option<String>,
    },
    /// Start (or resume from the configuration phase) the target program.
    Run {
        #[serde(default)]
        s: Option<String>,
    },
    /// Restart the target program.
    Restart {
        #[serde(default)]
        s: Option<String>,
    },
    /// Summarize all sessions and the daemon itself.
    Status {
        #[serde(default)]
        s: Option<String>,
    },
    /// Continue execution.
    C {
        #[serde(default)]
        s: Option<String>,
    },
    /// Step into.
    S {
        #[serde(default)]
        s: Option<String>,
    },
    /// Step over.
    N {
        #[serde(default)]
        s: Option<String>,
    },
    /// Step out.
    O {
        #[serde(default)]
        s: Option<String>,
    },
    /// Pause execution.
    Pause {
        #[serde(default)]
        s: Option<String>,
    },
    /// Set a breakpoint.
    B {
        file: String,
        line: u32,
        #[serde(default)]
        condition: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Delete a breakpoint by id.
    Db {
        id: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// List breakpoints in insertion order.
    Bl {
        #[serde(default)]
        s: Option<String>,
    },
    /// Evaluate an expression in the paused frame (or globally when
    /// running).
    E {
        expr: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// Fetch script source by file path or script id.
    Src {
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        script_id: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Show the current backtrace, including async frames when the
    /// wire reports them.
    Trace {
        #[serde(default)]
        s: Option<String>,
    },
    /// Report daemon version, uptime, and session count.
    Health,
    /// Drop and re-establish the wire connection for a session,
    /// preserving its registered breakpoints.
    Reconnect {
        #[serde(default)]
        s: Option<String>,
    },
    /// Run a query against the virtual tables. A trailing `\j` selects
    /// JSON output instead of TSV.
    Q {
        query: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// Show the current stop state: paused flag, stop epoch, stop
    /// reason, and the innermost frame.
    Ss {
        #[serde(default)]
        s: Option<String>,
    },
    /// Navigate the page to a url (browser targets only).
    Navigate {
        url: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// Capture a screenshot of the page.
    Screenshot {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Click the element matched by a css selector.
    Click {
        selector: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// Type text into the focused element, or into the element matched
    /// by `selector` when given.
    Type {
        text: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Choose an option in a select element.
    Select {
        selector: String,
        value: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// Install a network mock for urls matching a pattern.
    Mock {
        url_pattern: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Remove a network mock, or all mocks when no pattern is given.
    Unmock {
        #[serde(default)]
        url_pattern: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Emulate a device viewport and user agent.
    Emulate {
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        user_agent: Option<String>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Throttle the network with a named profile.
    Throttle {
        profile: String,
        #[serde(default)]
        s: Option<String>,
    },
    /// Start, stop, or snapshot js coverage collection.
    Coverage {
        #[serde(default)]
        action: CoverageAction,
        #[serde(default)]
        s: Option<String>,
    },
    /// List debug targets advertised by a BWP endpoint without
    /// attaching.
    Targets {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },
    /// Dump cpu registers (native targets only).
    Registers {
        #[serde(default)]
        s: Option<String>,
    },
    /// Read target memory (native targets only).
    Memory {
        address: String,
        length: u64,
        #[serde(default)]
        s: Option<String>,
    },
    /// Disassemble around an address (native targets only).
    Disasm {
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        length: Option<u64>,
        #[serde(default)]
        s: Option<String>,
    },
    /// Select the current session.
    Use { name: String },
}

/// TargetSpec describes what `open` or `attach` should connect to.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TargetSpec {
    /// The session name to register. Defaults to `s<n>` for the next
    /// free n.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// "node", "page", or "native". When absent the daemon prefers a
    /// node target and falls back to a page target.
    #[serde(default)]
    pub target_type: Option<String>,
    /// For `open`: the command line of the target process to spawn and
    /// manage. The child is killed when the session closes.
    #[serde(default)]
    pub cmd: Option<String>,
}

/// The output of an external device provider, handed to `attach-lldb`.
///
/// Providers (for example the Apple-device resolver) run outside the
/// daemon and produce this record; the daemon only consumes it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NativeResolution {
    /// The session name to register.
    #[serde(default)]
    pub name: Option<String>,
    /// The pid of the process to attach to.
    pub pid: i64,
    /// The device the process runs on, when attaching through a device
    /// bridge.
    #[serde(default)]
    pub device_udid: Option<String>,
    /// The attach strategy: "auto", "device-process", or "gdb-remote".
    /// Only "auto" may fall back between strategies.
    #[serde(default)]
    pub strategy: Option<String>,
    /// Overall attach deadline override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoverageAction {
    Start,
    Stop,
    #[default]
    Snapshot,
}

/// A daemon reply. Success replies are a flat JSON object with
/// `ok: true` plus command-specific fields; failures carry a stable
/// error code so scripted clients can dispatch on it.
///
/// Err comes first: with untagged deserialization the variants are
/// tried in order, and an error payload would also satisfy the
/// catch-all Ok shape. The `error` field keeps the match unambiguous.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Response {
    Err(ErrResponse),
    Ok(OkResponse),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OkResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrResponse {
    pub ok: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// For attach failures: the stage the attach state machine was in
    /// when it failed (resolve, initialize, attach, threads, stack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Response {
    pub fn ok(body: serde_json::Map<String, serde_json::Value>) -> Self {
        Response::Ok(OkResponse { ok: true, body })
    }

    pub fn err(error: impl fmt::Display, code: Option<&str>, phase: Option<&str>) -> Self {
        Response::Err(ErrResponse {
            ok: false,
            error: error.to_string(),
            error_code: code.map(String::from),
            phase: phase.map(String::from),
        })
    }
}
