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

//! The native attach state machine: resolve the adapter, launch it
//! under the chosen strategy, then run the stop-state handshake.
//! Nothing is registered until `threads` and `stackTrace` have both
//! answered, so a session that is visible is a session you can
//! actually inspect. In `auto` mode a device-process failure falls
//! back to gdb-remote; explicit strategies never fall back.

use std::{
    env, process,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::{
    consts,
    errors::AttachError,
    events::NewEvent,
    ndap::transport::NdapTransport,
    session::{
        Session, SessionManager, parse_ndap_frames,
        state::{DebuggerState, ThreadInfo},
        wire_ndap_events,
    },
};
use dbgmux_protocol::NativeResolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Auto,
    DeviceProcess,
    GdbRemote,
}

impl Strategy {
    pub fn parse(s: Option<&str>) -> Result<Strategy, AttachError> {
        match s.unwrap_or("auto") {
            "auto" => Ok(Strategy::Auto),
            "device-process" => Ok(Strategy::DeviceProcess),
            "gdb-remote" => Ok(Strategy::GdbRemote),
            other => Err(AttachError::InvalidRequest(format!("unknown strategy '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Auto => "auto",
            Strategy::DeviceProcess => "device-process",
            Strategy::GdbRemote => "gdb-remote",
        }
    }
}

/// Per-stage wall clock, reported in the diagnostic event when an
/// attach fails.
#[derive(Debug, Default, Clone)]
struct StageTimings {
    resolve_ms: u64,
    initialize_ms: u64,
    attach_ms: u64,
    threads_ms: u64,
    stack_ms: u64,
}

impl StageTimings {
    fn to_json(&self) -> Value {
        json!({
            "resolve_ms": self.resolve_ms,
            "initialize_ms": self.initialize_ms,
            "attach_ms": self.attach_ms,
            "threads_ms": self.threads_ms,
            "stack_ms": self.stack_ms,
        })
    }
}

#[derive(Debug)]
pub struct AttachOutcome {
    pub transport: NdapTransport,
    pub state: Arc<Mutex<DebuggerState>>,
    pub strategy: Strategy,
}

/// The adapter binary: pinned by LLDB_DAP_PATH, then the config file,
/// then whatever PATH resolution finds.
pub fn adapter_path(config_path: Option<&str>) -> String {
    env::var(consts::LLDB_DAP_PATH_VAR)
        .ok()
        .or_else(|| config_path.map(String::from))
        .unwrap_or_else(|| String::from("lldb-dap"))
}

/// Pull the remote debug port out of system log text, from entries
/// like `debugproxy listening on tcp:9221 for device <udid>`.
pub fn parse_debugproxy_port(log_text: &str, udid: &str) -> Option<u16> {
    for line in log_text.lines() {
        let Some(idx) = line.find("debugproxy listening on tcp:") else {
            continue;
        };
        if !line.contains(&format!("for device {udid}")) {
            continue;
        }
        let rest = &line[idx + "debugproxy listening on tcp:".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(port) = digits.parse::<u16>() {
            return Some(port);
        }
    }
    None
}

/// Read recent system log text for debugproxy discovery. macOS keeps
/// these in the unified log; anywhere else this just reports that no
/// provider is available.
fn device_log_text() -> Result<String, AttachError> {
    let out = process::Command::new("log")
        .args(["show", "--style", "syslog", "--last", "5m"])
        .output()
        .map_err(|e| AttachError::Provider(format!("reading system log: {e}")))?;
    if !out.status.success() {
        return Err(AttachError::Provider(String::from("system log query failed")));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn remaining(deadline: Instant) -> Result<Duration, AttachError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(AttachError::DeniedOrTimeout { stage: String::from("deadline") });
    }
    Ok(deadline - now)
}

fn step_timeout(deadline: Instant, default: Duration) -> Result<Duration, AttachError> {
    Ok(remaining(deadline)?.min(default))
}

struct Handshake {
    thread_id: i64,
    threads: Vec<ThreadInfo>,
    frames: Value,
    stop_reason: String,
    timings: StageTimings,
}

/// One strategy's launch-and-handshake, against an already spawned
/// transport. Fails with the stage name that broke.
fn try_strategy(
    transport: &NdapTransport,
    strategy: Strategy,
    resolution: &NativeResolution,
    gdb_port: &dyn Fn(&str) -> Result<u16, AttachError>,
    deadline: Instant,
    default_timeout: Duration,
) -> Result<Handshake, (AttachError, StageTimings)> {
    let mut timings = StageTimings::default();

    macro_rules! stage {
        ($field:ident, $name:literal, $body:expr) => {{
            let started = Instant::now();
            let res = $body;
            timings.$field = started.elapsed().as_millis() as u64;
            match res {
                Ok(v) => v,
                Err(e) => return Err((e, timings.clone())),
            }
        }};
    }

    let wire_err = |stage: &str| {
        let stage = String::from(stage);
        move |_e: crate::errors::NdapError| AttachError::DeniedOrTimeout { stage }
    };

    stage!(initialize_ms, "initialize", {
        step_timeout(deadline, default_timeout).and_then(|t| {
            transport
                .request(
                    "initialize",
                    Some(json!({
                        "clientID": "dbgmux",
                        "adapterID": "lldb",
                        "linesStartAt1": true,
                        "columnsStartAt1": true,
                    })),
                    Some(t),
                )
                .map_err(wire_err("initialize"))
        })
    });

    let attach_args = stage!(resolve_ms, "resolve", {
        match strategy {
            Strategy::DeviceProcess => Ok(json!({"pid": resolution.pid})),
            Strategy::GdbRemote => {
                let udid = resolution.device_udid.as_deref().ok_or_else(|| {
                    AttachError::InvalidRequest(String::from(
                        "gdb-remote attach requires a device udid",
                    ))
                });
                udid.and_then(|udid| {
                    gdb_port(udid).map(|port| {
                        json!({"attachCommands": [format!("gdb-remote {port}")]})
                    })
                })
            }
            Strategy::Auto => unreachable!("auto expands before strategies run"),
        }
    });

    stage!(attach_ms, "attach", {
        step_timeout(deadline, default_timeout).and_then(|t| {
            transport.request("attach", Some(attach_args), Some(t)).map_err(wire_err("attach"))
        })
    });

    let threads = stage!(threads_ms, "threads", {
        step_timeout(deadline, default_timeout)
            .and_then(|t| transport.request("threads", None, Some(t)).map_err(wire_err("threads")))
            .and_then(|body| {
                let threads: Vec<ThreadInfo> = body["threads"]
                    .as_array()
                    .map(|ts| {
                        ts.iter()
                            .filter_map(|t| {
                                Some(ThreadInfo {
                                    id: t["id"].as_i64()?,
                                    name: t["name"].as_str().unwrap_or("").to_string(),
                                    stopped: true,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if threads.is_empty() {
                    Err(AttachError::DeniedOrTimeout { stage: String::from("threads") })
                } else {
                    Ok(threads)
                }
            })
    });
    let thread_id = threads[0].id;

    let frames = stage!(stack_ms, "stack", {
        step_timeout(deadline, default_timeout)
            .and_then(|t| {
                transport
                    .request(
                        "stackTrace",
                        Some(json!({"threadId": thread_id, "levels": 64})),
                        Some(t),
                    )
                    .map_err(wire_err("stack"))
            })
            .and_then(|body| {
                let count =
                    body["stackFrames"].as_array().map(Vec::len).unwrap_or(0);
                if count == 0 {
                    Err(AttachError::DeniedOrTimeout { stage: String::from("stack") })
                } else {
                    Ok(body)
                }
            })
    });

    Ok(Handshake {
        thread_id,
        threads,
        frames,
        stop_reason: String::from("attach"),
        timings,
    })
}

/// Drive the full state machine: Resolving, Launching, Handshaking,
/// Registered or Failed, with the auto fallback in between. On failure
/// the returned diagnostic value carries per-stage timings and the
/// strategy history.
pub(crate) fn run_attach_with<F, G>(
    resolution: &NativeResolution,
    deadline_budget: Duration,
    default_timeout: Duration,
    mut transport_factory: F,
    gdb_port: G,
) -> Result<AttachOutcome, (AttachError, Value)>
where
    F: FnMut() -> Result<NdapTransport, AttachError>,
    G: Fn(&str) -> Result<u16, AttachError>,
{
    if resolution.pid <= 0 {
        return Err((
            AttachError::InvalidRequest(format!("pid {} is not attachable", resolution.pid)),
            json!({"history": []}),
        ));
    }
    let requested = match Strategy::parse(resolution.strategy.as_deref()) {
        Ok(s) => s,
        Err(e) => return Err((e, json!({"history": []}))),
    };

    let strategies: &[Strategy] = match requested {
        Strategy::Auto => &[Strategy::DeviceProcess, Strategy::GdbRemote],
        Strategy::DeviceProcess => &[Strategy::DeviceProcess],
        Strategy::GdbRemote => &[Strategy::GdbRemote],
    };

    let deadline = Instant::now() + deadline_budget;
    let mut history: Vec<Value> = vec![];
    let mut last_err = AttachError::DeniedOrTimeout { stage: String::from("resolve") };

    for (i, strategy) in strategies.iter().enumerate() {
        if remaining(deadline).is_err() {
            last_err = AttachError::DeniedOrTimeout { stage: String::from("deadline") };
            break;
        }
        if i > 0 {
            info!("falling back to {}", strategy.as_str());
        }

        let transport = match transport_factory() {
            Ok(t) => t,
            Err(e) => {
                // a missing adapter binary fails every strategy alike
                return Err((e, json!({"history": history})));
            }
        };

        match try_strategy(&transport, *strategy, resolution, &gdb_port, deadline, default_timeout)
        {
            Ok(handshake) => {
                let state = Arc::new(Mutex::new(DebuggerState::new_ndap()));
                {
                    let mut st = state.lock().unwrap();
                    st.connected = true;
                    st.pid = Some(resolution.pid);
                    if let Some(ndap) = st.wire.ndap_mut() {
                        ndap.thread_id = Some(handshake.thread_id);
                        ndap.active_threads = handshake.threads;
                    }
                    let frames = parse_ndap_frames(&handshake.frames);
                    st.on_paused(Some(handshake.stop_reason), frames, vec![]);
                }
                return Ok(AttachOutcome { transport, state, strategy: *strategy });
            }
            Err((err, timings)) => {
                warn!("{} attach failed: {}", strategy.as_str(), err);
                history.push(json!({
                    "strategy": strategy.as_str(),
                    "stage": err.phase().unwrap_or("resolve"),
                    "error": err.code(),
                    "timings": timings.to_json(),
                }));
                // best effort teardown before the next strategy
                let _ = transport.request(
                    "disconnect",
                    Some(json!({"terminateDebuggee": false})),
                    Some(Duration::from_millis(500)),
                );
                transport.close();
                last_err = err;
            }
        }
    }

    Err((last_err, json!({"history": history})))
}

impl SessionManager {
    /// Attach to a native process from a provider resolution. The
    /// session appears in `list` only after the stop-state handshake
    /// has passed; a failed attach leaves nothing behind but a
    /// diagnostic event.
    #[instrument(skip_all, fields(pid = resolution.pid))]
    pub fn attach_native(
        &self,
        resolution: &NativeResolution,
    ) -> anyhow::Result<Arc<Session>> {
        let name = match &resolution.name {
            Some(n) => n.clone(),
            None => self.next_name(),
        };
        self.check_free(&name)?;

        let deadline_budget = resolution
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config().attach_deadline());
        let default_timeout = self.config().request_timeout();

        let adapter = adapter_path(self.config().lldb_dap_path.as_deref());
        let factory = || {
            let mut cmd = process::Command::new(&adapter);
            cmd.arg("--no-lldbinit");
            NdapTransport::spawn(cmd, default_timeout)
                .map_err(|e| AttachError::AdapterUnavailable(format!("{adapter}: {e}")))
        };

        let outcome = run_attach_with(
            resolution,
            deadline_budget,
            default_timeout,
            factory,
            |udid| {
                device_log_text().and_then(|text| {
                    parse_debugproxy_port(&text, udid)
                        .ok_or_else(|| AttachError::DeviceNotFound(String::from(udid)))
                })
            },
        );

        match outcome {
            Ok(outcome) => {
                {
                    let mut st = outcome.state.lock().unwrap();
                    st.set_ring_caps(
                        self.config().console_ring_cap(),
                        self.config().exception_ring_cap(),
                    );
                }
                wire_ndap_events(
                    &outcome.transport,
                    &outcome.state,
                    &self.store(),
                    &name,
                    default_timeout,
                );
                info!("native attach registered via {}", outcome.strategy.as_str());
                self.register_native(&name, outcome.transport, outcome.state, String::from("local"))
            }
            Err((err, diagnostics)) => {
                self.store().record(NewEvent {
                    source: String::from("daemon"),
                    category: String::from("attach"),
                    method: String::from("attach_failed"),
                    data: json!({
                        "pid": resolution.pid,
                        "error": err.code(),
                        "diagnostics": diagnostics,
                    }),
                    session_id: Some(name),
                    flush_now: true,
                });
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{collections::HashMap, thread};

    use assert_matches::assert_matches;
    use ntest::timeout;
    use serde_json::json;

    use crate::ndap::transport::testio::{Fixture, fixture, frame};

    #[test]
    fn debugproxy_port_parsing() {
        let log = "Jul 30 12:01:01 host debugproxy[33]: debugproxy listening on tcp:9221 for device AAAA-BBBB\n\
                   Jul 30 12:01:02 host debugproxy[33]: debugproxy listening on tcp:9333 for device CCCC-DDDD\n\
                   Jul 30 12:01:03 host other[1]: unrelated line\n";
        assert_eq!(parse_debugproxy_port(log, "AAAA-BBBB"), Some(9221));
        assert_eq!(parse_debugproxy_port(log, "CCCC-DDDD"), Some(9333));
        assert_eq!(parse_debugproxy_port(log, "EEEE-FFFF"), None);
        assert_eq!(parse_debugproxy_port("", "AAAA-BBBB"), None);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(Strategy::parse(None).unwrap(), Strategy::Auto);
        assert_eq!(Strategy::parse(Some("device-process")).unwrap(), Strategy::DeviceProcess);
        assert_eq!(Strategy::parse(Some("gdb-remote")).unwrap(), Strategy::GdbRemote);
        let err = Strategy::parse(Some("ptrace")).unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    /// A scripted adapter: answers each command according to the
    /// behavior table, anything unlisted succeeds with an empty body.
    fn adapter(fx: &Fixture, behaviors: HashMap<&'static str, Result<Value, &'static str>>) {
        let from = fx.from_transport.clone();
        let to = fx.to_transport.clone();
        thread::spawn(move || {
            for req in from.iter() {
                let seq = req["seq"].as_i64().unwrap();
                let command = req["command"].as_str().unwrap().to_string();
                let reply = match behaviors.get(command.as_str()) {
                    Some(Ok(body)) => json!({
                        "seq": seq + 1000,
                        "type": "response",
                        "request_seq": seq,
                        "success": true,
                        "command": command,
                        "body": body,
                    }),
                    Some(Err(msg)) => json!({
                        "seq": seq + 1000,
                        "type": "response",
                        "request_seq": seq,
                        "success": false,
                        "command": command,
                        "message": msg,
                    }),
                    None => json!({
                        "seq": seq + 1000,
                        "type": "response",
                        "request_seq": seq,
                        "success": true,
                        "command": command,
                        "body": {},
                    }),
                };
                if to.send(frame(&reply)).is_err() {
                    return;
                }
            }
        });
    }

    fn good_adapter_behaviors() -> HashMap<&'static str, Result<Value, &'static str>> {
        let mut behaviors = HashMap::new();
        behaviors.insert(
            "threads",
            Ok(json!({"threads": [{"id": 1, "name": "main"}, {"id": 2, "name": "worker"}]})),
        );
        behaviors.insert(
            "stackTrace",
            Ok(json!({"stackFrames": [
                {"id": 1000, "name": "main", "line": 10, "column": 1,
                 "source": {"path": "/src/main.c"}}
            ]})),
        );
        behaviors
    }

    fn resolution(strategy: &str) -> NativeResolution {
        NativeResolution {
            name: Some(String::from("native1")),
            pid: 4242,
            device_udid: Some(String::from("AAAA-BBBB")),
            strategy: Some(String::from(strategy)),
            timeout_ms: None,
        }
    }

    #[test]
    #[timeout(30000)]
    fn handshake_success_produces_paused_state() {
        let fx = fixture();
        adapter(&fx, good_adapter_behaviors());
        let transport = fx.transport.clone();

        let outcome = run_attach_with(
            &resolution("device-process"),
            Duration::from_secs(10),
            Duration::from_secs(2),
            move || Ok(transport.clone()),
            |_| Err(AttachError::Provider(String::from("unused"))),
        )
        .expect("attach to succeed");

        assert_eq!(outcome.strategy, Strategy::DeviceProcess);
        let state = outcome.state.lock().unwrap();
        assert!(state.connected);
        assert!(state.paused);
        assert_eq!(state.stop_epoch, 1);
        assert_eq!(state.pid, Some(4242));
        assert_eq!(state.call_frames.len(), 1);
        assert_eq!(state.call_frames[0].function_name, "main");
        let ndap = state.wire.ndap().unwrap();
        assert_eq!(ndap.thread_id, Some(1));
        assert_eq!(ndap.active_threads.len(), 2);
    }

    #[test]
    #[timeout(30000)]
    fn empty_thread_list_fails_handshake() {
        let fx = fixture();
        let mut behaviors = good_adapter_behaviors();
        behaviors.insert("threads", Ok(json!({"threads": []})));
        adapter(&fx, behaviors);
        let transport = fx.transport.clone();

        let (err, diagnostics) = run_attach_with(
            &resolution("device-process"),
            Duration::from_secs(10),
            Duration::from_secs(2),
            move || Ok(transport.clone()),
            |_| Err(AttachError::Provider(String::from("unused"))),
        )
        .expect_err("attach must fail");

        assert_eq!(err.code(), "attach_denied_or_timeout");
        assert_eq!(err.phase(), Some("threads"));
        let history = diagnostics["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["stage"], "threads");
        assert!(history[0]["timings"]["threads_ms"].is_number());
        // the transport was torn down
        assert!(fx.transport.is_closed());
    }

    #[test]
    #[timeout(30000)]
    fn auto_falls_back_to_gdb_remote() {
        let first = fixture();
        let mut failing = good_adapter_behaviors();
        failing.insert("attach", Err("attach failed: operation not permitted"));
        adapter(&first, failing);

        let second = fixture();
        adapter(&second, good_adapter_behaviors());

        let transports =
            Mutex::new(vec![second.transport.clone(), first.transport.clone()]);
        let outcome = run_attach_with(
            &resolution("auto"),
            Duration::from_secs(10),
            Duration::from_secs(2),
            move || Ok(transports.lock().unwrap().pop().expect("factory called at most twice")),
            |udid| {
                assert_eq!(udid, "AAAA-BBBB");
                Ok(9221)
            },
        )
        .expect("fallback attach to succeed");

        assert_eq!(outcome.strategy, Strategy::GdbRemote);
        assert!(first.transport.is_closed());
    }

    #[test]
    #[timeout(30000)]
    fn explicit_strategy_never_falls_back() {
        let fx = fixture();
        let mut failing = good_adapter_behaviors();
        failing.insert("attach", Err("attach failed"));
        adapter(&fx, failing);
        let transport = fx.transport.clone();

        let calls = Mutex::new(0usize);
        let (err, _) = run_attach_with(
            &resolution("device-process"),
            Duration::from_secs(10),
            Duration::from_secs(2),
            move || {
                *calls.lock().unwrap() += 1;
                assert_eq!(*calls.lock().unwrap(), 1, "strict strategy must not retry");
                Ok(transport.clone())
            },
            |_| Ok(9221),
        )
        .expect_err("strict attach must fail");
        assert_matches!(err, AttachError::DeniedOrTimeout { .. });
    }

    #[test]
    #[timeout(30000)]
    fn gdb_remote_uses_discovered_port() {
        let fx = fixture();
        adapter(&fx, good_adapter_behaviors());
        let transport = fx.transport.clone();

        let outcome = run_attach_with(
            &resolution("gdb-remote"),
            Duration::from_secs(10),
            Duration::from_secs(2),
            move || Ok(transport.clone()),
            |_| Ok(9333),
        )
        .expect("gdb-remote attach to succeed");
        assert_eq!(outcome.strategy, Strategy::GdbRemote);
    }

    #[test]
    fn invalid_pid_is_rejected_up_front() {
        let mut res = resolution("auto");
        res.pid = 0;
        let (err, _) = run_attach_with(
            &res,
            Duration::from_secs(1),
            Duration::from_secs(1),
            || panic!("factory must not run for an invalid request"),
            |_| Ok(1),
        )
        .expect_err("invalid pid");
        assert_eq!(err.code(), "invalid_request");
    }
}
