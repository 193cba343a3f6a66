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

//! Session lifecycle and multiplexing: the registry of named debug
//! sessions, the executors that bind a session's transport, state, and
//! event log together, and the teardown discipline for managed
//! children.

use std::{
    fmt,
    process,
    sync::{Arc, Mutex},
    thread, time,
    time::Duration,
};

use anyhow::{Context, anyhow};
use dbgmux_protocol::TargetSpec;
use indexmap::IndexMap;
use nix::{sys::signal, unistd::Pid};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

pub mod executor;
pub mod ops;
pub mod state;

use crate::{
    bwp::{discovery, transport::BwpTransport},
    config::Config,
    consts,
    errors::{SessionError, WireError},
    events::{EventStore, NewEvent},
    ndap::transport::NdapTransport,
    session::{executor::Executor, state::DebuggerState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// The browser/node wire (devtools family).
    Bwp,
    /// The native debug adapter wire.
    Ndap,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Bwp => "bwp",
            Protocol::Ndap => "ndap",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Node,
    Page,
    Native,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Node => "node",
            TargetType::Page => "page",
            TargetType::Native => "native",
        }
    }

    pub fn parse(s: &str) -> Option<TargetType> {
        match s {
            "node" => Some(TargetType::Node),
            "page" => Some(TargetType::Page),
            "native" => Some(TargetType::Native),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            TargetType::Node | TargetType::Page => Protocol::Bwp,
            TargetType::Native => Protocol::Ndap,
        }
    }
}

/// What a session can do, derived entirely from its protocol. Commands
/// gate on these and reject with the capability's name when the
/// session lacks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Dom,
    Css,
    Network,
    Page,
    Storage,
    Emulation,
    Coverage,
    Registers,
    Memory,
    Disassembly,
    Watchpoints,
    Breakpoints,
    Stepping,
    Evaluation,
    Stack,
    Variables,
    Source,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Dom => "dom",
            Capability::Css => "css",
            Capability::Network => "network",
            Capability::Page => "page",
            Capability::Storage => "storage",
            Capability::Emulation => "emulation",
            Capability::Coverage => "coverage",
            Capability::Registers => "registers",
            Capability::Memory => "memory",
            Capability::Disassembly => "disassembly",
            Capability::Watchpoints => "watchpoints",
            Capability::Breakpoints => "breakpoints",
            Capability::Stepping => "stepping",
            Capability::Evaluation => "evaluation",
            Capability::Stack => "stack",
            Capability::Variables => "variables",
            Capability::Source => "source",
        }
    }
}

pub const BWP_CAPABILITIES: &[Capability] = &[
    Capability::Dom,
    Capability::Css,
    Capability::Network,
    Capability::Page,
    Capability::Storage,
    Capability::Emulation,
    Capability::Coverage,
    Capability::Breakpoints,
    Capability::Stepping,
    Capability::Evaluation,
    Capability::Stack,
    Capability::Variables,
    Capability::Source,
];

pub const NDAP_CAPABILITIES: &[Capability] = &[
    Capability::Registers,
    Capability::Memory,
    Capability::Disassembly,
    Capability::Watchpoints,
    Capability::Breakpoints,
    Capability::Stepping,
    Capability::Evaluation,
    Capability::Stack,
    Capability::Variables,
    Capability::Source,
];

pub fn capabilities_for(protocol: Protocol) -> &'static [Capability] {
    match protocol {
        Protocol::Bwp => BWP_CAPABILITIES,
        Protocol::Ndap => NDAP_CAPABILITIES,
    }
}

/// SIGTERM, a grace period, then SIGKILL. Used for both managed target
/// processes and adapter children.
pub fn kill_child(child: &mut process::Child) {
    let pid = Pid::from_raw(child.id() as i32);
    if signal::kill(pid, Some(signal::Signal::SIGTERM)).is_err() {
        // already gone
        let _ = child.try_wait();
        return;
    }

    let deadline = time::Instant::now() + consts::CHILD_KILL_TIMEOUT;
    while time::Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => return,
        }
    }

    info!("child {} failed to exit within kill timeout, no longer being polite", pid);
    let _ = signal::kill(pid, Some(signal::Signal::SIGKILL));
    let _ = child.wait();
}

/// The transport handle a session owns, kept alongside the executor so
/// close and reconnect can reach it directly.
#[derive(Clone, Debug)]
pub enum SessionWire {
    Bwp(BwpTransport),
    Ndap(NdapTransport),
}

pub struct Session {
    pub name: String,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub host: String,
    pub port: u16,
    pub executor: Arc<dyn Executor>,
    pub wire: SessionWire,
    pub created_at: time::SystemTime,
    /// The managed target child from `open`, if any. Killed on close.
    managed_child: Mutex<Option<process::Child>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("target_type", &self.target_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("wire", &self.wire)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn state(&self) -> Arc<Mutex<DebuggerState>> {
        self.executor.state()
    }

    pub fn require(&self, cap: Capability) -> Result<(), SessionError> {
        if self.executor.capabilities().contains(&cap) {
            Ok(())
        } else {
            Err(SessionError::CapabilityUnsupported(cap))
        }
    }

    /// Tear down the wire and any managed child.
    #[instrument(skip_all, fields(s = self.name))]
    pub fn teardown(&self) {
        match &self.wire {
            SessionWire::Bwp(t) => t.close(),
            SessionWire::Ndap(t) => t.close(),
        }
        let child = self.managed_child.lock().unwrap().take();
        if let Some(mut child) = child {
            kill_child(&mut child);
        }
    }
}

/// The BWP executor: every outbound call is mirrored into the event
/// log before it goes on the wire; inbound traffic is mirrored by the
/// transport tap installed at attach time.
pub struct BwpExecutor {
    pub transport: BwpTransport,
    pub state: Arc<Mutex<DebuggerState>>,
    pub store: Arc<EventStore>,
    pub session: String,
    pub default_timeout: Duration,
}

impl Executor for BwpExecutor {
    fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, WireError> {
        self.store.record(NewEvent::wire(
            "bwp_send",
            method,
            json!({"params": params.clone()}),
            &self.session,
        ));
        let timeout = timeout.or(Some(self.default_timeout));
        Ok(self.transport.send(method, params, timeout)?)
    }

    fn state(&self) -> Arc<Mutex<DebuggerState>> {
        Arc::clone(&self.state)
    }

    fn store(&self) -> Option<Arc<EventStore>> {
        Some(Arc::clone(&self.store))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Bwp
    }

    fn capabilities(&self) -> &'static [Capability] {
        BWP_CAPABILITIES
    }
}

pub struct NdapExecutor {
    pub transport: NdapTransport,
    pub state: Arc<Mutex<DebuggerState>>,
    pub store: Arc<EventStore>,
    pub session: String,
    pub default_timeout: Duration,
}

impl Executor for NdapExecutor {
    fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, WireError> {
        self.store.record(NewEvent::wire(
            "ndap_send",
            method,
            json!({"arguments": params.clone()}),
            &self.session,
        ));
        let args = if params.is_null() { None } else { Some(params) };
        let timeout = timeout.or(Some(self.default_timeout));
        Ok(self.transport.request(method, args, timeout)?)
    }

    fn state(&self) -> Arc<Mutex<DebuggerState>> {
        Arc::clone(&self.state)
    }

    fn store(&self) -> Option<Arc<EventStore>> {
        Some(Arc::clone(&self.store))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ndap
    }

    fn capabilities(&self) -> &'static [Capability] {
        NDAP_CAPABILITIES
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub name: String,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub connected: bool,
    pub paused: bool,
    pub current: bool,
    pub created_at_unix_ms: i64,
}

type SessionTable = Arc<Mutex<IndexMap<String, Arc<Session>>>>;

pub struct SessionManager {
    sessions: SessionTable,
    current: Arc<Mutex<Option<String>>>,
    store: Arc<EventStore>,
    config: Config,
    reap_tx: crossbeam_channel::Sender<String>,
    next_auto_name: Mutex<u64>,
}

impl SessionManager {
    pub fn new(config: Config, store: Arc<EventStore>) -> Arc<SessionManager> {
        let sessions: SessionTable = Arc::new(Mutex::new(IndexMap::new()));
        let current = Arc::new(Mutex::new(None));

        // Sessions whose wire died in the background get retired off
        // the receive path by a dedicated reaper thread, after their
        // connection event has been recorded.
        let (reap_tx, reap_rx) = crossbeam_channel::unbounded::<String>();
        {
            let sessions = Arc::clone(&sessions);
            let current = Arc::clone(&current);
            thread::spawn(move || {
                for name in reap_rx {
                    info!("reaping dead session '{}'", name);
                    sessions.lock().unwrap().shift_remove(&name);
                    let mut cur = current.lock().unwrap();
                    if cur.as_deref() == Some(name.as_str()) {
                        *cur = None;
                    }
                }
            });
        }

        Arc::new(SessionManager {
            sessions,
            current,
            store,
            config,
            reap_tx,
            next_auto_name: Mutex::new(1),
        })
    }

    pub fn store(&self) -> Arc<EventStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn a managed target process, then attach to it.
    #[instrument(skip_all)]
    pub fn open(&self, spec: &TargetSpec) -> anyhow::Result<Arc<Session>> {
        let cmd_line = spec
            .cmd
            .as_deref()
            .ok_or_else(|| anyhow!("open requires a cmd to spawn"))?;
        let port = spec.port.unwrap_or(9229);

        let mut parts = cmd_line.split_whitespace();
        let bin = parts.next().ok_or_else(|| anyhow!("empty cmd"))?;
        let child = process::Command::new(bin)
            .args(parts)
            .spawn()
            .with_context(|| format!("spawning managed target '{cmd_line}'"))?;
        info!("spawned managed target pid {}", child.id());

        // give the child a moment to open its debug port
        let mut spec = spec.clone();
        spec.port = Some(port);
        let mut last_err = None;
        for attempt in 0..20 {
            match self.attach_inner(&spec, Some((child.id(), cmd_line))) {
                Ok(session) => {
                    *session.managed_child.lock().unwrap() = Some(child);
                    return Ok(session);
                }
                Err(e) => {
                    debug!("attach attempt {} failed: {:?}", attempt, e);
                    last_err = Some(e);
                    thread::sleep(Duration::from_millis(250));
                }
            }
        }
        let mut child = child;
        kill_child(&mut child);
        Err(last_err.unwrap_or_else(|| anyhow!("attach never attempted")))
    }

    /// Attach to an endpoint that is already listening.
    pub fn attach(&self, spec: &TargetSpec) -> anyhow::Result<Arc<Session>> {
        self.attach_inner(spec, None)
    }

    fn attach_inner(
        &self,
        spec: &TargetSpec,
        managed: Option<(u32, &str)>,
    ) -> anyhow::Result<Arc<Session>> {
        let name = match &spec.name {
            Some(n) => n.clone(),
            None => self.next_name(),
        };
        self.check_free(&name)?;

        let host = spec.host.clone().unwrap_or_else(|| String::from("127.0.0.1"));
        let port = spec.port.ok_or_else(|| anyhow!("attach requires a port"))?;
        let pref = match spec.target_type.as_deref() {
            Some(t) => Some(
                TargetType::parse(t).ok_or_else(|| anyhow!("unknown target type '{t}'"))?,
            ),
            None => None,
        };
        if pref == Some(TargetType::Native) {
            return Err(anyhow!("native targets attach through attach-lldb"));
        }

        let discovered = discovery::discover(&host, port, pref)?;
        let transport =
            BwpTransport::connect(&discovered.ws_url, self.config.request_timeout())?;

        let state = Arc::new(Mutex::new(DebuggerState::new_bwp()));
        {
            let mut st = state.lock().unwrap();
            st.connected = true;
            st.set_ring_caps(self.config.console_ring_cap(), self.config.exception_ring_cap());
            if let Some(bwp) = st.wire.bwp_mut() {
                bwp.last_ws_url = Some(discovered.ws_url.clone());
            }
            if let Some((pid, cmd)) = managed {
                st.pid = Some(i64::from(pid));
                st.managed_command = Some(String::from(cmd));
            }
        }

        wire_bwp_events(&transport, &state, &self.store, &name);

        // baseline domains; page-only domains are enabled lazily by
        // the commands that need them
        let _ = transport.send("Runtime.enable", Value::Null, None);
        let _ = transport.send("Debugger.enable", Value::Null, None);
        if discovered.target_type == TargetType::Page {
            let _ = transport.send("Page.enable", Value::Null, None);
            let _ = transport.send("Network.enable", Value::Null, None);
        }

        let executor = Arc::new(BwpExecutor {
            transport: transport.clone(),
            state: Arc::clone(&state),
            store: Arc::clone(&self.store),
            session: name.clone(),
            default_timeout: self.config.request_timeout(),
        });

        let session = Arc::new(Session {
            name: name.clone(),
            protocol: Protocol::Bwp,
            target_type: discovered.target_type,
            host,
            port,
            executor,
            wire: SessionWire::Bwp(transport),
            created_at: time::SystemTime::now(),
            managed_child: Mutex::new(None),
        });

        self.register(session.clone())?;
        self.store.record(NewEvent::connection(
            "attached",
            json!({
                "protocol": "bwp",
                "target_type": discovered.target_type.as_str(),
                "ws_url": discovered.ws_url,
            }),
            &name,
        ));
        Ok(session)
    }

    /// Register a session built by the native attach engine. Callers
    /// run the stop-state handshake first; nothing is visible in
    /// `list` until that has passed.
    pub fn register_native(
        &self,
        name: &str,
        transport: NdapTransport,
        state: Arc<Mutex<DebuggerState>>,
        host: String,
    ) -> anyhow::Result<Arc<Session>> {
        self.check_free(name)?;

        wire_ndap_close(&transport, &state, &self.store, name, self.reap_tx.clone());

        let executor = Arc::new(NdapExecutor {
            transport: transport.clone(),
            state: Arc::clone(&state),
            store: Arc::clone(&self.store),
            session: String::from(name),
            default_timeout: self.config.request_timeout(),
        });

        let session = Arc::new(Session {
            name: String::from(name),
            protocol: Protocol::Ndap,
            target_type: TargetType::Native,
            host,
            port: 0,
            executor,
            wire: SessionWire::Ndap(transport),
            created_at: time::SystemTime::now(),
            managed_child: Mutex::new(None),
        });

        self.register(session.clone())?;
        self.store.record(NewEvent::connection(
            "attached",
            json!({"protocol": "ndap"}),
            name,
        ));
        Ok(session)
    }

    /// Close a session by selector (or the current one), emitting the
    /// connection event before the registry entry goes away.
    #[instrument(skip_all)]
    pub fn close(&self, selector: Option<&str>) -> Result<(), SessionError> {
        let session = self.get(selector)?;
        self.store.record(NewEvent::connection("closed", json!({}), &session.name));

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.shift_remove(&session.name);
        }
        {
            let mut cur = self.current.lock().unwrap();
            if cur.as_deref() == Some(session.name.as_str()) {
                *cur = None;
            }
        }

        session.teardown();
        Ok(())
    }

    /// Close every session: transports torn down, managed children and
    /// adapter processes killed. Used by daemon shutdown.
    pub fn close_all(&self) {
        let names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.close(Some(&name)) {
                debug!("closing '{}' during shutdown: {}", name, e);
            }
        }
    }

    pub fn use_session(&self, name: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().unwrap();
        if !sessions.contains_key(name) {
            return Err(SessionError::Unknown(String::from(name)));
        }
        *self.current.lock().unwrap() = Some(String::from(name));
        Ok(())
    }

    /// Resolve a session selector. No selector means the current
    /// session, falling back to the only session when just one exists.
    pub fn get(&self, selector: Option<&str>) -> Result<Arc<Session>, SessionError> {
        let sessions = self.sessions.lock().unwrap();
        match selector {
            Some(name) => sessions
                .get(name)
                .map(Arc::clone)
                .ok_or_else(|| SessionError::Unknown(String::from(name))),
            None => {
                let cur = self.current.lock().unwrap();
                if let Some(name) = cur.as_deref() {
                    if let Some(s) = sessions.get(name) {
                        return Ok(Arc::clone(s));
                    }
                }
                if sessions.len() == 1 {
                    return Ok(Arc::clone(sessions.values().next().unwrap()));
                }
                Err(SessionError::NoCurrent)
            }
        }
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.get(None).ok()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().unwrap();
        let cur = self.current.lock().unwrap();
        sessions
            .values()
            .map(|s| {
                let state = s.state();
                let state = state.lock().unwrap();
                SessionInfo {
                    name: s.name.clone(),
                    protocol: s.protocol,
                    target_type: s.target_type,
                    connected: state.connected,
                    paused: state.paused,
                    current: cur.as_deref() == Some(s.name.as_str()),
                    created_at_unix_ms: s
                        .created_at
                        .duration_since(time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0),
                }
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub(crate) fn check_free(&self, name: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(name) {
            return Err(SessionError::Exists(String::from(name)));
        }
        Ok(())
    }

    fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let name = session.name.clone();
        {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&name) {
                return Err(SessionError::Exists(name));
            }
            sessions.insert(name.clone(), session);
        }
        // first session in becomes current automatically
        let mut cur = self.current.lock().unwrap();
        if cur.is_none() {
            *cur = Some(name);
        }
        Ok(())
    }

    pub(crate) fn next_name(&self) -> String {
        let mut n = self.next_auto_name.lock().unwrap();
        let sessions = self.sessions.lock().unwrap();
        loop {
            let candidate = format!("s{}", *n);
            *n += 1;
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Translate browser-wire events into uniform state mutations and
/// mirror every inbound message into the event log.
fn wire_bwp_events(
    transport: &BwpTransport,
    state: &Arc<Mutex<DebuggerState>>,
    store: &Arc<EventStore>,
    session: &str,
) {
    use crate::session::state::*;

    {
        let store = Arc::clone(store);
        let session = String::from(session);
        transport.on_any(move |msg| {
            let method = msg
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("response")
                .to_string();
            store.record(NewEvent::wire("bwp_recv", &method, msg.clone(), &session));
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Debugger.scriptParsed", move |msg| {
            let p = &msg["params"];
            let Some(script_id) = p["scriptId"].as_str() else { return };
            let url = p["url"].as_str().unwrap_or("").to_string();
            let file = url.strip_prefix("file://").unwrap_or(&url).to_string();
            let mut st = state.lock().unwrap();
            st.add_script(
                String::from(script_id),
                ScriptInfo {
                    file,
                    url,
                    lines: p["endLine"].as_i64().unwrap_or(0),
                    source_map: p["sourceMapURL"].as_str().filter(|s| !s.is_empty()).map(String::from),
                    is_module: p["isModule"].as_bool().unwrap_or(false),
                },
            );
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Debugger.paused", move |msg| {
            let p = &msg["params"];
            let frames = parse_bwp_frames(&p["callFrames"]);
            let async_stack = parse_bwp_async(&p["asyncStackTrace"]);
            let reason = p["reason"].as_str().map(String::from);
            let mut st = state.lock().unwrap();
            if let Some(ids) = p["hitBreakpoints"].as_array() {
                for id in ids.iter().filter_map(Value::as_str) {
                    for bp in st.breakpoints.values_mut() {
                        if bp.wire_id == id {
                            bp.hits += 1;
                        }
                    }
                }
            }
            st.on_paused(reason, frames, async_stack);
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Debugger.resumed", move |_| {
            state.lock().unwrap().on_resumed();
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Runtime.consoleAPICalled", move |msg| {
            let p = &msg["params"];
            let text = p["args"]
                .as_array()
                .map(|args| {
                    args.iter()
                        .map(|a| {
                            a.get("value")
                                .map(|v| match v {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                })
                                .unwrap_or_else(|| {
                                    a.get("description")
                                        .and_then(Value::as_str)
                                        .unwrap_or("<object>")
                                        .to_string()
                                })
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            state.lock().unwrap().push_console(ConsoleEntry {
                ts: chrono::Utc::now().timestamp_millis(),
                level: p["type"].as_str().unwrap_or("log").to_string(),
                text,
            });
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Runtime.exceptionThrown", move |msg| {
            let detail = &msg["params"]["exceptionDetails"];
            let text = detail["exception"]["description"]
                .as_str()
                .or_else(|| detail["text"].as_str())
                .unwrap_or("exception")
                .to_string();
            state.lock().unwrap().push_exception(ExceptionEntry {
                ts: chrono::Utc::now().timestamp_millis(),
                uncaught: detail["uncaught"].as_bool().unwrap_or(true),
                text,
            });
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Network.requestWillBeSent", move |msg| {
            let p = &msg["params"];
            let Some(id) = p["requestId"].as_str() else { return };
            let mut st = state.lock().unwrap();
            if let Some(bwp) = st.wire.bwp_mut() {
                bwp.network_requests.insert(
                    String::from(id),
                    NetworkRequest {
                        request_id: String::from(id),
                        url: p["request"]["url"].as_str().unwrap_or("").to_string(),
                        method: p["request"]["method"].as_str().unwrap_or("GET").to_string(),
                        status: None,
                        mime_type: None,
                        finished: false,
                    },
                );
            }
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Network.responseReceived", move |msg| {
            let p = &msg["params"];
            let Some(id) = p["requestId"].as_str() else { return };
            let mut st = state.lock().unwrap();
            if let Some(bwp) = st.wire.bwp_mut() {
                if let Some(req) = bwp.network_requests.get_mut(id) {
                    req.status = p["response"]["status"].as_i64();
                    req.mime_type = p["response"]["mimeType"].as_str().map(String::from);
                }
            }
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("Network.loadingFinished", move |msg| {
            let Some(id) = msg["params"]["requestId"].as_str() else { return };
            let mut st = state.lock().unwrap();
            if let Some(bwp) = st.wire.bwp_mut() {
                if let Some(req) = bwp.network_requests.get_mut(id) {
                    req.finished = true;
                }
            }
        });
    }

    for ws_event in ["Network.webSocketFrameSent", "Network.webSocketFrameReceived"] {
        let state = Arc::clone(state);
        let direction =
            if ws_event.ends_with("Sent") { "sent" } else { "received" };
        transport.on_event(ws_event, move |msg| {
            let p = &msg["params"];
            let mut st = state.lock().unwrap();
            if let Some(bwp) = st.wire.bwp_mut() {
                if bwp.ws_frames.len() >= consts::WS_FRAME_RING_CAP {
                    bwp.ws_frames.pop_front();
                }
                bwp.ws_frames.push_back(WsFrame {
                    ts: chrono::Utc::now().timestamp_millis(),
                    direction: String::from(direction),
                    opcode: p["response"]["opcode"].as_i64().unwrap_or(1),
                    payload: p["response"]["payloadData"].as_str().unwrap_or("").to_string(),
                });
            }
        });
    }

    for page_event in
        ["Page.loadEventFired", "Page.domContentEventFired", "Page.frameNavigated", "Page.lifecycleEvent"]
    {
        let state = Arc::clone(state);
        let name = page_event;
        transport.on_event(page_event, move |msg| {
            let mut st = state.lock().unwrap();
            if let Some(bwp) = st.wire.bwp_mut() {
                if bwp.page_events.len() >= consts::PAGE_EVENT_RING_CAP {
                    bwp.page_events.pop_front();
                }
                bwp.page_events.push_back(PageEvent {
                    ts: chrono::Utc::now().timestamp_millis(),
                    name: String::from(name),
                    data: msg["params"].clone(),
                });
            }
        });
    }

    // Answer paused fetches from the mock table. The reply has to come
    // from another thread: the pump is busy delivering this event.
    {
        let state = Arc::clone(state);
        let reply_transport = transport.clone();
        transport.on_event("Fetch.requestPaused", move |msg| {
            let p = &msg["params"];
            let Some(request_id) = p["requestId"].as_str().map(String::from) else { return };
            let url = p["request"]["url"].as_str().unwrap_or("").to_string();

            let rule = {
                let st = state.lock().unwrap();
                st.wire.bwp().and_then(|bwp| {
                    bwp.mocks
                        .iter()
                        .find(|m| crate::query::filter::like_match(&m.url_pattern, &url))
                        .cloned()
                })
            };

            let transport = reply_transport.clone();
            thread::spawn(move || match rule {
                Some(rule) => {
                    use base64::Engine as _;
                    let body =
                        base64::engine::general_purpose::STANDARD.encode(rule.body.as_bytes());
                    let _ = transport.send(
                        "Fetch.fulfillRequest",
                        json!({
                            "requestId": request_id,
                            "responseCode": rule.status,
                            "body": body,
                        }),
                        None,
                    );
                }
                None => {
                    let _ = transport.send(
                        "Fetch.continueRequest",
                        json!({"requestId": request_id}),
                        None,
                    );
                }
            });
        });
    }

    // Peer hangups leave the session in the table (a `reconnect` can
    // revive it); only explicit close removes it, and that path runs
    // before the transport close fires.
    {
        let state = Arc::clone(state);
        let store = Arc::clone(store);
        let session = String::from(session);
        transport.on_close(move |cause| {
            {
                let mut st = state.lock().unwrap();
                if !st.connected {
                    return;
                }
                st.connected = false;
                st.paused = false;
                st.call_frames.clear();
            }
            store.record(NewEvent::connection(
                "disconnected",
                json!({"cause": cause.code()}),
                &session,
            ));
        });
    }
}

fn parse_bwp_frames(call_frames: &Value) -> Vec<state::CallFrame> {
    use crate::session::state::{CallFrame, Scope};
    let Some(frames) = call_frames.as_array() else {
        return vec![];
    };
    frames
        .iter()
        .map(|f| {
            let url = f["url"].as_str().unwrap_or("").to_string();
            CallFrame {
                id: f["callFrameId"].as_str().unwrap_or("").to_string(),
                function_name: f["functionName"].as_str().unwrap_or("").to_string(),
                file: url.strip_prefix("file://").unwrap_or(&url).to_string(),
                url,
                // devtools line numbers are zero based
                line: f["location"]["lineNumber"].as_i64().unwrap_or(0) + 1,
                col: f["location"]["columnNumber"].as_i64().unwrap_or(0) + 1,
                script_id: f["location"]["scriptId"].as_str().unwrap_or("").to_string(),
                scope_chain: f["scopeChain"]
                    .as_array()
                    .map(|scopes| {
                        scopes
                            .iter()
                            .map(|s| Scope {
                                kind: s["type"].as_str().unwrap_or("local").to_string(),
                                name: s["name"].as_str().map(String::from),
                                object_id: s["object"]["objectId"].as_str().map(String::from),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                this_object_id: f["this"]["objectId"].as_str().map(String::from),
            }
        })
        .collect()
}

fn parse_bwp_async(async_trace: &Value) -> Vec<state::AsyncFrame> {
    use crate::session::state::AsyncFrame;
    let mut out = vec![];
    let mut node = async_trace;
    let mut depth = 0;
    while !node.is_null() && depth < 32 {
        let description = node["description"].as_str().unwrap_or("").to_string();
        if let Some(frames) = node["callFrames"].as_array() {
            for (i, f) in frames.iter().enumerate() {
                let url = f["url"].as_str().unwrap_or("").to_string();
                out.push(AsyncFrame {
                    id: format!("a{}:{}", depth, i),
                    function_name: f["functionName"].as_str().unwrap_or("").to_string(),
                    file: url.strip_prefix("file://").unwrap_or(&url).to_string(),
                    line: f["lineNumber"].as_i64().unwrap_or(0) + 1,
                    parent_id: if depth == 0 && i == 0 {
                        None
                    } else {
                        Some(format!("a{}:{}", depth, i.saturating_sub(1)))
                    },
                    description: description.clone(),
                });
            }
        }
        node = &node["parent"];
        depth += 1;
    }
    out
}

/// Close handling for native sessions: an adapter exit is terminal, so
/// the state flips to terminated, the connection event is recorded,
/// and then the reaper retires the session.
fn wire_ndap_close(
    transport: &NdapTransport,
    state: &Arc<Mutex<DebuggerState>>,
    store: &Arc<EventStore>,
    session: &str,
    reap_tx: crossbeam_channel::Sender<String>,
) {
    let state = Arc::clone(state);
    let store = Arc::clone(store);
    let session = String::from(session);
    transport.on_close(move |cause| {
        let is_exit = matches!(cause, crate::errors::NdapError::ProcessExited { .. });
        {
            let mut st = state.lock().unwrap();
            if !st.connected {
                return;
            }
            st.mark_terminated(if is_exit { Some(cause.to_string()) } else { None });
        }
        store.record(NewEvent::connection(
            if is_exit { "adapter_exited" } else { "closed" },
            json!({"cause": cause.code()}),
            &session,
        ));
        if is_exit {
            let _ = reap_tx.send(session.clone());
        }
    });
}

/// Event wiring shared by the attach engine once a native session's
/// transport exists.
pub fn wire_ndap_events(
    transport: &NdapTransport,
    state: &Arc<Mutex<DebuggerState>>,
    store: &Arc<EventStore>,
    session: &str,
    default_timeout: Duration,
) {
    use crate::session::state::*;

    {
        let store = Arc::clone(store);
        let session = String::from(session);
        transport.on_any(move |msg| {
            let method = msg
                .get("event")
                .and_then(Value::as_str)
                .or_else(|| msg.get("command").and_then(Value::as_str))
                .unwrap_or("frame")
                .to_string();
            store.record(NewEvent::wire("ndap_recv", &method, msg.clone(), &session));
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("output", move |msg| {
            let body = &msg["body"];
            state.lock().unwrap().push_console(ConsoleEntry {
                ts: chrono::Utc::now().timestamp_millis(),
                level: body["category"].as_str().unwrap_or("console").to_string(),
                text: body["output"].as_str().unwrap_or("").trim_end().to_string(),
            });
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("process", move |msg| {
            let body = &msg["body"];
            let mut st = state.lock().unwrap();
            st.pid = body["systemProcessId"].as_i64();
            if let Some(ndap) = st.wire.ndap_mut() {
                ndap.target_triple = body["triple"].as_str().map(String::from);
            }
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("thread", move |msg| {
            let body = &msg["body"];
            let Some(id) = body["threadId"].as_i64() else { return };
            let mut st = state.lock().unwrap();
            if let Some(ndap) = st.wire.ndap_mut() {
                match body["reason"].as_str() {
                    Some("started") => ndap.active_threads.push(ThreadInfo {
                        id,
                        name: format!("thread {id}"),
                        stopped: false,
                    }),
                    Some("exited") => ndap.active_threads.retain(|t| t.id != id),
                    _ => {}
                }
            }
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("module", move |msg| {
            let body = &msg["body"];
            let module = &body["module"];
            let mut st = state.lock().unwrap();
            if let Some(ndap) = st.wire.ndap_mut() {
                let id = module["id"].to_string();
                match body["reason"].as_str() {
                    Some("removed") => ndap.modules.retain(|m| m.id != id),
                    _ => {
                        if !ndap.modules.iter().any(|m| m.id == id) {
                            ndap.modules.push(ModuleInfo {
                                id,
                                name: module["name"].as_str().unwrap_or("").to_string(),
                                path: module["path"].as_str().unwrap_or("").to_string(),
                                address: module["addressRange"].as_str().map(String::from),
                            });
                        }
                    }
                }
            }
        });
    }

    {
        let state = Arc::clone(state);
        transport.on_event("continued", move |msg| {
            let mut st = state.lock().unwrap();
            st.on_resumed();
            if let Some(ndap) = st.wire.ndap_mut() {
                if let Some(id) = msg["body"]["threadId"].as_i64() {
                    for t in ndap.active_threads.iter_mut() {
                        if t.id == id || msg["body"]["allThreadsContinued"].as_bool().unwrap_or(false) {
                            t.stopped = false;
                        }
                    }
                }
            }
        });
    }

    // A stop event only carries the reason; the frames come from a
    // follow-up stackTrace request. That request cannot run on the
    // reader thread (it would wait on a response the same thread must
    // deliver), so a short-lived fetcher thread does it and applies
    // the result only if no newer stop or resume got there first.
    {
        let state = Arc::clone(state);
        let fetch_transport = transport.clone();
        transport.on_event("stopped", move |msg| {
            let body = &msg["body"];
            let reason = body["reason"].as_str().unwrap_or("stopped").to_string();
            let thread_id = body["threadId"].as_i64();

            let epoch = {
                let mut st = state.lock().unwrap();
                if let Some(ndap) = st.wire.ndap_mut() {
                    if let Some(id) = thread_id {
                        ndap.thread_id = Some(id);
                        for t in ndap.active_threads.iter_mut() {
                            if t.id == id
                                || body["allThreadsStopped"].as_bool().unwrap_or(false)
                            {
                                t.stopped = true;
                            }
                        }
                    }
                }
                if body["hitBreakpointIds"].is_array() {
                    let hit: Vec<String> = body["hitBreakpointIds"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|v| v.to_string())
                        .collect();
                    for bp in st.breakpoints.values_mut() {
                        if hit.iter().any(|h| h == &bp.wire_id) {
                            bp.hits += 1;
                        }
                    }
                }
                st.on_paused(Some(reason), vec![], vec![]);
                st.stop_epoch
            };

            let transport = fetch_transport.clone();
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let Some(thread_id) = thread_id else { return };
                let frames = transport
                    .request(
                        "stackTrace",
                        Some(json!({"threadId": thread_id, "levels": 64})),
                        Some(default_timeout),
                    )
                    .map(|body| parse_ndap_frames(&body))
                    .unwrap_or_default();
                let mut st = state.lock().unwrap();
                // a newer stop or a resume wins over this snapshot
                if st.paused && st.stop_epoch == epoch {
                    st.call_frames = frames;
                }
            });
        });
    }
}

pub fn parse_ndap_frames(body: &Value) -> Vec<state::CallFrame> {
    use crate::session::state::CallFrame;
    let Some(frames) = body["stackFrames"].as_array() else {
        return vec![];
    };
    frames
        .iter()
        .map(|f| {
            let file = f["source"]["path"]
                .as_str()
                .or_else(|| f["source"]["name"].as_str())
                .unwrap_or("")
                .to_string();
            CallFrame {
                id: f["id"].to_string(),
                function_name: f["name"].as_str().unwrap_or("").to_string(),
                url: String::new(),
                file,
                line: f["line"].as_i64().unwrap_or(0),
                col: f["column"].as_i64().unwrap_or(0),
                script_id: f["source"]["sourceReference"]
                    .as_i64()
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
                scope_chain: vec![],
                this_object_id: None,
            }
        })
        .collect()
}
