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

//! The control plane dispatcher: newline-framed JSON commands in, one
//! response line out per command. Connections are served concurrently;
//! work on any one session serializes behind that session's transport.

use std::{
    io::BufReader,
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
    thread, time,
};

use anyhow::anyhow;
use dbgmux_protocol::{Command, ErrResponse, Response};
use serde_json::{Map, Value, json};
use tracing::{error, info, instrument};

use crate::{
    bwp::discovery,
    config::Config,
    errors::{AttachError, BwpError, NdapError, QueryError, SessionError, WireError},
    events::{EventStore, NewEvent},
    protocol,
    query,
    query::registry::Registry,
    session::{Capability, Session, SessionManager},
    tables,
};

pub struct Server {
    manager: Arc<SessionManager>,
    registry: Registry,
    store: Arc<EventStore>,
    started_at: time::Instant,
}

impl Server {
    #[instrument(skip_all)]
    pub fn new(config: Config, store: Arc<EventStore>) -> Arc<Server> {
        let manager = SessionManager::new(config, Arc::clone(&store));
        store.record(NewEvent::daemon(
            "started",
            json!({"version": dbgmux_protocol::VERSION}),
        ));
        Arc::new(Server {
            manager,
            registry: tables::registry(),
            store,
            started_at: time::Instant::now(),
        })
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.manager)
    }

    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        let mut conn_counter = 0;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream, conn_id) {
                            error!("handling connection: {:?}", err);
                        }
                    });
                }
                Err(err) => {
                    error!("accepting stream: {:?}", err);
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, stream: UnixStream, conn_id: usize) -> anyhow::Result<()> {
        info!("control socket got a new connection");
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        loop {
            let cmd: Option<Command> = match protocol::decode_from(&mut reader) {
                Ok(cmd) => cmd,
                Err(e) => {
                    // a malformed line gets an error reply, then we
                    // keep serving the connection
                    let resp = Response::err(format!("bad command: {e:#}"), None, None);
                    protocol::encode_to(&resp, &mut writer)?;
                    continue;
                }
            };
            let Some(cmd) = cmd else {
                info!("client hung up");
                return Ok(());
            };

            let resp = self.dispatch(cmd);
            protocol::encode_to(&resp, &mut writer)?;
        }
    }

    fn dispatch(&self, cmd: Command) -> Response {
        match self.try_dispatch(cmd) {
            Ok(body) => Response::ok(body),
            Err(err) => error_response(&err),
        }
    }

    fn session(&self, selector: &Option<String>) -> Result<Arc<Session>, SessionError> {
        self.manager.get(selector.as_deref())
    }

    fn gated(
        &self,
        selector: &Option<String>,
        cap: Capability,
    ) -> anyhow::Result<Arc<Session>> {
        let session = self.session(selector)?;
        session.require(cap)?;
        Ok(session)
    }

    fn run_query(&self, query: &str, selector: &Option<String>) -> anyhow::Result<Map<String, Value>> {
        let session = self.session(selector)?;
        let out = query::run(query, &self.registry, session.executor.as_ref())?;
        let mut body = Map::new();
        body.insert(String::from("columns"), json!(out.columns));
        body.insert(String::from("rows"), json!(out.rows));
        body.insert(String::from("format"), json!(out.format));
        if out.format == query::OutputFormat::Tsv {
            body.insert(String::from("text"), Value::from(out.to_tsv()));
        }
        Ok(body)
    }

    fn try_dispatch(&self, cmd: Command) -> anyhow::Result<Map<String, Value>> {
        use Capability as Cap;

        match cmd {
            Command::Open(spec) => {
                let session = self.manager.open(&spec)?;
                Ok(session_body(&session))
            }
            Command::Attach(spec) => {
                let session = self.manager.attach(&spec)?;
                Ok(session_body(&session))
            }
            Command::AttachLldb(resolution) => {
                let session = self.manager.attach_native(&resolution)?;
                Ok(session_body(&session))
            }
            Command::Close { s } => {
                self.manager.close(s.as_deref())?;
                Ok(Map::new())
            }
            Command::Use { name } => {
                self.manager.use_session(&name)?;
                Ok(Map::new())
            }
            Command::Run { s } => {
                self.session(&s)?.run_target()?;
                Ok(Map::new())
            }
            Command::Restart { s } => {
                self.session(&s)?.restart_target()?;
                Ok(Map::new())
            }
            Command::Status { s } => {
                if s.is_some() {
                    let session = self.session(&s)?;
                    let mut body = session_body(&session);
                    body.append(&mut session.stop_state());
                    Ok(body)
                } else {
                    let mut body = Map::new();
                    let sessions: Vec<Value> = self
                        .manager
                        .list()
                        .into_iter()
                        .map(|info| {
                            json!({
                                "name": info.name,
                                "protocol": info.protocol.as_str(),
                                "target_type": info.target_type.as_str(),
                                "connected": info.connected,
                                "paused": info.paused,
                                "current": info.current,
                                "created_at_unix_ms": info.created_at_unix_ms,
                            })
                        })
                        .collect();
                    body.insert(String::from("sessions"), Value::from(sessions));
                    Ok(body)
                }
            }
            Command::C { s } => {
                self.gated(&s, Cap::Stepping)?.resume()?;
                Ok(Map::new())
            }
            Command::S { s } => {
                self.gated(&s, Cap::Stepping)?.step_into()?;
                Ok(Map::new())
            }
            Command::N { s } => {
                self.gated(&s, Cap::Stepping)?.step_over()?;
                Ok(Map::new())
            }
            Command::O { s } => {
                self.gated(&s, Cap::Stepping)?.step_out()?;
                Ok(Map::new())
            }
            Command::Pause { s } => {
                self.gated(&s, Cap::Stepping)?.pause_target()?;
                Ok(Map::new())
            }
            Command::B { file, line, condition, s } => {
                let session = self.gated(&s, Cap::Breakpoints)?;
                let id = session.set_breakpoint(&file, i64::from(line), condition.as_deref())?;
                let mut body = Map::new();
                body.insert(String::from("id"), Value::from(id));
                Ok(body)
            }
            Command::Db { id, s } => {
                self.gated(&s, Cap::Breakpoints)?.delete_breakpoint(&id)?;
                Ok(Map::new())
            }
            Command::Bl { s } => {
                self.gated(&s, Cap::Breakpoints)?;
                self.run_query("SELECT * FROM breakpoints", &s)
            }
            Command::E { expr, s } => {
                let session = self.gated(&s, Cap::Evaluation)?;
                let result = session.evaluate(&expr)?;
                let mut body = Map::new();
                body.insert(String::from("result"), result);
                Ok(body)
            }
            Command::Src { file, script_id, s } => {
                let session = self.gated(&s, Cap::Source)?;
                let source = session.source_text(file.as_deref(), script_id.as_deref())?;
                let mut body = Map::new();
                body.insert(String::from("source"), Value::from(source));
                Ok(body)
            }
            Command::Trace { s } => {
                let session = self.gated(&s, Cap::Stack)?;
                let mut body = Map::new();
                body.insert(String::from("frames"), Value::from(session.backtrace()));
                Ok(body)
            }
            Command::Ss { s } => Ok(self.session(&s)?.stop_state()),
            Command::Health => {
                let mut body = Map::new();
                body.insert(
                    String::from("version"),
                    Value::from(dbgmux_protocol::VERSION),
                );
                body.insert(
                    String::from("uptime_ms"),
                    Value::from(self.started_at.elapsed().as_millis() as u64),
                );
                body.insert(
                    String::from("sessions"),
                    Value::from(self.manager.session_count() as u64),
                );
                Ok(body)
            }
            Command::Reconnect { s } => {
                let session = self.manager.reconnect(s.as_deref())?;
                Ok(session_body(&session))
            }
            Command::Q { query, s } => self.run_query(&query, &s),
            Command::Navigate { url, s } => {
                self.gated(&s, Cap::Page)?.navigate(&url)?;
                Ok(Map::new())
            }
            Command::Screenshot { path, s } => {
                let session = self.gated(&s, Cap::Page)?;
                let path = session.screenshot(path.as_deref())?;
                let mut body = Map::new();
                body.insert(String::from("path"), Value::from(path));
                Ok(body)
            }
            Command::Click { selector, s } => {
                self.gated(&s, Cap::Dom)?.click(&selector)?;
                Ok(Map::new())
            }
            Command::Type { text, selector, s } => {
                self.gated(&s, Cap::Dom)?.type_text(&text, selector.as_deref())?;
                Ok(Map::new())
            }
            Command::Select { selector, value, s } => {
                self.gated(&s, Cap::Dom)?.select_option(&selector, &value)?;
                Ok(Map::new())
            }
            Command::Mock { url_pattern, status, body, s } => {
                self.gated(&s, Cap::Network)?.mock(&url_pattern, status, body.as_deref())?;
                Ok(Map::new())
            }
            Command::Unmock { url_pattern, s } => {
                let remaining = self.gated(&s, Cap::Network)?.unmock(url_pattern.as_deref())?;
                let mut body = Map::new();
                body.insert(String::from("remaining"), Value::from(remaining as u64));
                Ok(body)
            }
            Command::Emulate { width, height, user_agent, s } => {
                self.gated(&s, Cap::Emulation)?.emulate(width, height, user_agent.as_deref())?;
                Ok(Map::new())
            }
            Command::Throttle { profile, s } => {
                self.gated(&s, Cap::Network)?.throttle(&profile)?;
                Ok(Map::new())
            }
            Command::Coverage { action, s } => {
                let result = self.gated(&s, Cap::Coverage)?.coverage(action)?;
                let mut body = Map::new();
                body.insert(String::from("coverage"), result);
                Ok(body)
            }
            Command::Targets { host, port } => {
                let host = host.unwrap_or_else(|| String::from("127.0.0.1"));
                let port = port.unwrap_or(9229);
                let targets = discovery::fetch_targets(&host, port)?;
                let rows: Vec<Value> = targets
                    .into_iter()
                    .map(|t| {
                        json!({
                            "type": t.target_type,
                            "title": t.title,
                            "url": t.url,
                            "ws_url": t.ws_url,
                        })
                    })
                    .collect();
                let mut body = Map::new();
                body.insert(String::from("targets"), Value::from(rows));
                Ok(body)
            }
            Command::Registers { s } => {
                self.gated(&s, Cap::Registers)?;
                self.run_query("SELECT * FROM registers", &s)
            }
            Command::Memory { address, length, s } => {
                self.gated(&s, Cap::Memory)?;
                if address.contains('\'') || address.contains('\\') {
                    return Err(anyhow!("malformed address '{address}'"));
                }
                self.run_query(
                    &format!("SELECT * FROM memory WHERE address = '{address}' AND length = {length}"),
                    &s,
                )
            }
            Command::Disasm { address, length, s } => {
                self.gated(&s, Cap::Disassembly)?;
                let address = match address {
                    Some(a) => a,
                    None => {
                        // default to the pc of the innermost frame
                        let session = self.session(&s)?;
                        let state = session.state();
                        let state = state.lock().unwrap();
                        state
                            .wire
                            .ndap()
                            .and_then(|n| {
                                n.registers
                                    .iter()
                                    .find(|r| r.name == "pc" || r.name == "rip")
                                    .map(|r| r.value.clone())
                            })
                            .ok_or_else(|| anyhow!("disasm requires an address"))?
                    }
                };
                if address.contains('\'') || address.contains('\\') {
                    return Err(anyhow!("malformed address '{address}'"));
                }
                let mut q = format!("SELECT * FROM disassembly WHERE address = '{address}'");
                if let Some(len) = length {
                    q.push_str(&format!(" AND length = {len}"));
                }
                self.run_query(&q, &s)
            }
        }
    }
}

fn session_body(session: &Session) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert(String::from("session"), Value::from(session.name.clone()));
    body.insert(String::from("protocol"), Value::from(session.protocol.as_str()));
    body.insert(
        String::from("target_type"),
        Value::from(session.target_type.as_str()),
    );
    body.insert(String::from("host"), Value::from(session.host.clone()));
    body.insert(String::from("port"), Value::from(session.port));
    body
}

/// Map an error onto the wire shape, digging the stable code out of
/// whichever typed error is at the root.
fn error_response(err: &anyhow::Error) -> Response {
    let (code, phase) = if let Some(e) = err.downcast_ref::<QueryError>() {
        (Some(e.code()), None)
    } else if let Some(e) = err.downcast_ref::<SessionError>() {
        (Some(e.code()), None)
    } else if let Some(e) = err.downcast_ref::<AttachError>() {
        (Some(e.code()), e.phase().map(String::from))
    } else if let Some(e) = err.downcast_ref::<WireError>() {
        (Some(e.code()), None)
    } else if let Some(e) = err.downcast_ref::<NdapError>() {
        (Some(e.code()), None)
    } else if let Some(e) = err.downcast_ref::<BwpError>() {
        (Some(e.code()), None)
    } else {
        (None, None)
    };

    Response::Err(ErrResponse {
        ok: false,
        error: format!("{err:#}"),
        error_code: code.map(String::from),
        phase,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_response_carries_codes() {
        let err = anyhow::Error::from(QueryError::UnknownTable(String::from("nope")));
        match error_response(&err) {
            Response::Err(e) => {
                assert_eq!(e.error_code.as_deref(), Some("ErrUnknownTable"));
                assert!(e.error.contains("'nope'"));
                assert!(e.phase.is_none());
            }
            Response::Ok(_) => panic!("expected an error response"),
        }
    }

    #[test]
    fn attach_errors_carry_phase() {
        let err = anyhow::Error::from(AttachError::DeniedOrTimeout {
            stage: String::from("threads"),
        });
        match error_response(&err) {
            Response::Err(e) => {
                assert_eq!(e.error_code.as_deref(), Some("attach_denied_or_timeout"));
                assert_eq!(e.phase.as_deref(), Some("threads"));
            }
            Response::Ok(_) => panic!("expected an error response"),
        }
    }

    #[test]
    fn untyped_errors_have_no_code() {
        let err = anyhow!("something else");
        match error_response(&err) {
            Response::Err(e) => {
                assert!(e.error_code.is_none());
            }
            Response::Ok(_) => panic!("expected an error response"),
        }
    }
}
