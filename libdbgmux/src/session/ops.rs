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

//! Command-level operations on a session: execution control,
//! breakpoints, evaluation, and the browser conveniences. Each maps a
//! uniform command onto whichever wire the session speaks.

use anyhow::{Context, anyhow};
use dbgmux_protocol::TargetSpec;
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

use crate::{
    errors::WireError,
    session::{
        Protocol, Session, SessionManager, TargetType,
        executor::Executor,
        state::{Breakpoint, MockRule},
    },
};

/// Named throttle profiles for `Network.emulateNetworkConditions`.
/// Latency ms, download bytes/s, upload bytes/s.
const THROTTLE_PROFILES: &[(&str, bool, u64, i64, i64)] = &[
    ("offline", true, 0, -1, -1),
    ("slow-3g", false, 2000, 50 * 1024, 25 * 1024),
    ("fast-3g", false, 563, 180 * 1024, 84 * 1024),
    ("none", false, 0, -1, -1),
];

impl Session {
    fn send(&self, method: &str, params: Value) -> Result<Value, WireError> {
        self.executor.send(method, params, None)
    }

    fn current_thread(&self) -> i64 {
        let state = self.state();
        let state = state.lock().unwrap();
        state.wire.ndap().and_then(|n| n.thread_id).unwrap_or(1)
    }

    fn top_frame_id(&self) -> Option<String> {
        let state = self.state();
        let state = state.lock().unwrap();
        state.call_frames.first().map(|f| f.id.clone())
    }

    pub fn resume(&self) -> Result<(), WireError> {
        match self.protocol {
            Protocol::Bwp => {
                self.send("Debugger.resume", Value::Null)?;
            }
            Protocol::Ndap => {
                self.send("continue", json!({"threadId": self.current_thread()}))?;
                self.state().lock().unwrap().on_resumed();
            }
        }
        Ok(())
    }

    pub fn step_into(&self) -> Result<(), WireError> {
        match self.protocol {
            Protocol::Bwp => self.send("Debugger.stepInto", Value::Null).map(|_| ()),
            Protocol::Ndap => self
                .send("stepIn", json!({"threadId": self.current_thread()}))
                .map(|_| ()),
        }
    }

    pub fn step_over(&self) -> Result<(), WireError> {
        match self.protocol {
            Protocol::Bwp => self.send("Debugger.stepOver", Value::Null).map(|_| ()),
            Protocol::Ndap => {
                self.send("next", json!({"threadId": self.current_thread()})).map(|_| ())
            }
        }
    }

    pub fn step_out(&self) -> Result<(), WireError> {
        match self.protocol {
            Protocol::Bwp => self.send("Debugger.stepOut", Value::Null).map(|_| ()),
            Protocol::Ndap => self
                .send("stepOut", json!({"threadId": self.current_thread()}))
                .map(|_| ()),
        }
    }

    pub fn pause_target(&self) -> Result<(), WireError> {
        match self.protocol {
            Protocol::Bwp => self.send("Debugger.pause", Value::Null).map(|_| ()),
            Protocol::Ndap => {
                self.send("pause", json!({"threadId": self.current_thread()})).map(|_| ())
            }
        }
    }

    /// Register a breakpoint on the wire, then record it. The wire id
    /// is known before the breakpoint becomes visible anywhere, so a
    /// listed breakpoint can always be deleted.
    #[instrument(skip_all, fields(s = self.name, file = file, line = line))]
    pub fn set_breakpoint(
        &self,
        file: &str,
        line: i64,
        condition: Option<&str>,
    ) -> anyhow::Result<String> {
        let wire_id = match self.protocol {
            Protocol::Bwp => {
                let mut params = json!({
                    "lineNumber": line - 1,
                    "url": script_url(file),
                });
                if let Some(cond) = condition {
                    params["condition"] = Value::from(cond);
                }
                let resp = self.send("Debugger.setBreakpointByUrl", params)?;
                resp["breakpointId"]
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| anyhow!("wire did not return a breakpoint id"))?
            }
            Protocol::Ndap => {
                // the adapter wants the whole per-file list on every
                // update
                let mut lines: Vec<Value> = {
                    let state = self.state();
                    let state = state.lock().unwrap();
                    state
                        .breakpoints
                        .values()
                        .filter(|b| b.file == file)
                        .map(|b| bp_json(b.line, b.condition.as_deref()))
                        .collect()
                };
                lines.push(bp_json(line, condition));
                let resp = self.send(
                    "setBreakpoints",
                    json!({
                        "source": {"path": file},
                        "breakpoints": lines,
                    }),
                )?;
                resp["breakpoints"]
                    .as_array()
                    .and_then(|bps| bps.last())
                    .and_then(|bp| bp.get("id"))
                    .map(|id| id.to_string())
                    .ok_or_else(|| anyhow!("wire did not return a breakpoint id"))?
            }
        };

        let state = self.state();
        let mut state = state.lock().unwrap();
        let id = state.add_breakpoint(Breakpoint {
            file: String::from(file),
            line,
            condition: condition.map(String::from),
            hits: 0,
            enabled: true,
            wire_id,
        });
        info!("registered breakpoint {}", id);
        Ok(id)
    }

    pub fn delete_breakpoint(&self, id: &str) -> anyhow::Result<()> {
        let removed = {
            let state = self.state();
            let mut state = state.lock().unwrap();
            state.remove_breakpoint(id)
        };
        let bp = removed.ok_or_else(|| anyhow!("no breakpoint '{id}'"))?;

        match self.protocol {
            Protocol::Bwp => {
                self.send("Debugger.removeBreakpoint", json!({"breakpointId": bp.wire_id}))?;
            }
            Protocol::Ndap => {
                let lines: Vec<Value> = {
                    let state = self.state();
                    let state = state.lock().unwrap();
                    state
                        .breakpoints
                        .values()
                        .filter(|b| b.file == bp.file)
                        .map(|b| bp_json(b.line, b.condition.as_deref()))
                        .collect()
                };
                self.send(
                    "setBreakpoints",
                    json!({"source": {"path": bp.file}, "breakpoints": lines}),
                )?;
            }
        }
        Ok(())
    }

    /// Evaluate in the paused frame when there is one, globally
    /// otherwise.
    pub fn evaluate(&self, expr: &str) -> anyhow::Result<Value> {
        match self.protocol {
            Protocol::Bwp => {
                let resp = match self.top_frame_id() {
                    Some(frame_id) => self.send(
                        "Debugger.evaluateOnCallFrame",
                        json!({"callFrameId": frame_id, "expression": expr}),
                    )?,
                    None => self.send("Runtime.evaluate", json!({"expression": expr}))?,
                };
                let result = &resp["result"];
                Ok(result
                    .get("value")
                    .cloned()
                    .unwrap_or_else(|| {
                        Value::from(result["description"].as_str().unwrap_or("undefined"))
                    }))
            }
            Protocol::Ndap => {
                let mut params = json!({"expression": expr, "context": "repl"});
                if let Some(frame_id) = self.top_frame_id() {
                    if let Ok(fid) = frame_id.parse::<i64>() {
                        params["frameId"] = Value::from(fid);
                    }
                }
                let resp = self.send("evaluate", params)?;
                Ok(resp
                    .get("result")
                    .cloned()
                    .unwrap_or(Value::Null))
            }
        }
    }

    /// Script source by path or script id; used by the `src` command.
    pub fn source_text(
        &self,
        file: Option<&str>,
        script_id: Option<&str>,
    ) -> anyhow::Result<String> {
        match self.protocol {
            Protocol::Bwp => {
                let script_id = match (script_id, file) {
                    (Some(id), _) => String::from(id),
                    (None, Some(file)) => {
                        let state = self.state();
                        let state = state.lock().unwrap();
                        state
                            .scripts
                            .iter()
                            .find(|(_, s)| s.file == file || s.url == file)
                            .map(|(id, _)| id.clone())
                            .ok_or_else(|| anyhow!("no script for file '{file}'"))?
                    }
                    (None, None) => return Err(anyhow!("src requires file or script_id")),
                };
                let resp =
                    self.send("Debugger.getScriptSource", json!({"scriptId": script_id}))?;
                Ok(resp["scriptSource"].as_str().unwrap_or("").to_string())
            }
            Protocol::Ndap => {
                let params = match (script_id.and_then(|s| s.parse::<i64>().ok()), file) {
                    (Some(reference), _) => json!({"sourceReference": reference}),
                    (None, Some(file)) => json!({"source": {"path": file}}),
                    (None, None) => return Err(anyhow!("src requires file or script_id")),
                };
                let resp = self.send("source", params)?;
                Ok(resp["content"].as_str().unwrap_or("").to_string())
            }
        }
    }

    pub fn navigate(&self, url: &str) -> Result<(), WireError> {
        self.send("Page.navigate", json!({"url": url})).map(|_| ())
    }

    pub fn screenshot(&self, path: Option<&str>) -> anyhow::Result<String> {
        use base64::Engine as _;
        let resp = self.send("Page.captureScreenshot", json!({"format": "png"}))?;
        let data = resp["data"].as_str().ok_or_else(|| anyhow!("no screenshot data"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .context("decoding screenshot payload")?;
        let path = match path {
            Some(p) => String::from(p),
            None => format!(
                "/tmp/dbgmux-screenshot-{}.png",
                chrono::Utc::now().timestamp_millis()
            ),
        };
        std::fs::write(&path, bytes).with_context(|| format!("writing {path}"))?;
        Ok(path)
    }

    pub fn click(&self, selector: &str) -> anyhow::Result<()> {
        let sel = serde_json::to_string(selector).context("quoting selector")?;
        let resp = self.send(
            "Runtime.evaluate",
            json!({"expression": format!("document.querySelector({sel}).click()")}),
        )?;
        check_eval_exception(&resp)
    }

    pub fn type_text(&self, text: &str, selector: Option<&str>) -> anyhow::Result<()> {
        if let Some(selector) = selector {
            let sel = serde_json::to_string(selector).context("quoting selector")?;
            let resp = self.send(
                "Runtime.evaluate",
                json!({"expression": format!("document.querySelector({sel}).focus()")}),
            )?;
            check_eval_exception(&resp)?;
        }
        self.send("Input.insertText", json!({"text": text}))?;
        Ok(())
    }

    pub fn select_option(&self, selector: &str, value: &str) -> anyhow::Result<()> {
        let sel = serde_json::to_string(selector).context("quoting selector")?;
        let val = serde_json::to_string(value).context("quoting value")?;
        let expr = format!(
            "{{ const el = document.querySelector({sel}); el.value = {val}; \
             el.dispatchEvent(new Event('change', {{bubbles: true}})); }}"
        );
        let resp = self.send("Runtime.evaluate", json!({"expression": expr}))?;
        check_eval_exception(&resp)
    }

    /// Install a mock; the fetch-paused handler installed at attach
    /// time answers matching requests from then on.
    pub fn mock(&self, pattern: &str, status: Option<u16>, body: Option<&str>) -> anyhow::Result<()> {
        {
            let state = self.state();
            let mut state = state.lock().unwrap();
            let bwp = state.wire.bwp_mut().ok_or_else(|| anyhow!("mocking is a browser feature"))?;
            bwp.mocks.retain(|m| m.url_pattern != pattern);
            bwp.mocks.push(MockRule {
                url_pattern: String::from(pattern),
                status: status.unwrap_or(200),
                body: body.unwrap_or("").to_string(),
            });
        }
        self.send("Fetch.enable", json!({"patterns": [{"urlPattern": "*"}]}))?;
        Ok(())
    }

    pub fn unmock(&self, pattern: Option<&str>) -> anyhow::Result<usize> {
        let remaining = {
            let state = self.state();
            let mut state = state.lock().unwrap();
            let bwp = state.wire.bwp_mut().ok_or_else(|| anyhow!("mocking is a browser feature"))?;
            match pattern {
                Some(p) => bwp.mocks.retain(|m| m.url_pattern != p),
                None => bwp.mocks.clear(),
            }
            bwp.mocks.len()
        };
        if remaining == 0 {
            let _ = self.send("Fetch.disable", Value::Null);
        }
        Ok(remaining)
    }

    pub fn emulate(
        &self,
        width: Option<u32>,
        height: Option<u32>,
        user_agent: Option<&str>,
    ) -> anyhow::Result<()> {
        if width.is_some() || height.is_some() {
            self.send(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": width.unwrap_or(1280),
                    "height": height.unwrap_or(800),
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            )?;
        }
        if let Some(ua) = user_agent {
            self.send("Emulation.setUserAgentOverride", json!({"userAgent": ua}))?;
        }
        Ok(())
    }

    pub fn throttle(&self, profile: &str) -> anyhow::Result<()> {
        let (_, offline, latency, download, upload) = THROTTLE_PROFILES
            .iter()
            .find(|(name, ..)| *name == profile)
            .ok_or_else(|| {
                let names: Vec<&str> = THROTTLE_PROFILES.iter().map(|p| p.0).collect();
                anyhow!("unknown throttle profile '{profile}', expected one of {names:?}")
            })?;
        self.send(
            "Network.emulateNetworkConditions",
            json!({
                "offline": offline,
                "latency": latency,
                "downloadThroughput": download,
                "uploadThroughput": upload,
            }),
        )?;
        Ok(())
    }

    pub fn coverage(&self, action: dbgmux_protocol::CoverageAction) -> anyhow::Result<Value> {
        use dbgmux_protocol::CoverageAction;
        match action {
            CoverageAction::Start => {
                self.send("Profiler.enable", Value::Null)?;
                self.send(
                    "Profiler.startPreciseCoverage",
                    json!({"callCount": true, "detailed": true}),
                )?;
                Ok(json!({"started": true}))
            }
            CoverageAction::Snapshot => {
                let resp = self.send("Profiler.takePreciseCoverage", Value::Null)?;
                let scripts = resp["result"].as_array().map(Vec::len).unwrap_or(0);
                {
                    let state = self.state();
                    let mut state = state.lock().unwrap();
                    if let Some(bwp) = state.wire.bwp_mut() {
                        bwp.coverage_snapshot = Some(resp.clone());
                    }
                }
                Ok(json!({"scripts": scripts}))
            }
            CoverageAction::Stop => {
                self.send("Profiler.stopPreciseCoverage", Value::Null)?;
                Ok(json!({"stopped": true}))
            }
        }
    }

    /// Kick a waiting target into running: the configuration phase end
    /// for native, run-if-waiting for node.
    pub fn run_target(&self) -> anyhow::Result<()> {
        match self.protocol {
            Protocol::Bwp => {
                self.send("Runtime.runIfWaitingForDebugger", Value::Null)?;
            }
            Protocol::Ndap => {
                {
                    let state = self.state();
                    let mut state = state.lock().unwrap();
                    if let Some(ndap) = state.wire.ndap_mut() {
                        ndap.phase = crate::session::state::NdapPhase::Configuring;
                    }
                }
                self.send("configurationDone", Value::Null)?;
                let state = self.state();
                let mut state = state.lock().unwrap();
                if let Some(ndap) = state.wire.ndap_mut() {
                    if ndap.phase == crate::session::state::NdapPhase::Configuring {
                        ndap.phase = crate::session::state::NdapPhase::Running;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn restart_target(&self) -> anyhow::Result<()> {
        match (self.protocol, self.target_type) {
            (Protocol::Ndap, _) => {
                self.send("restart", Value::Null)?;
                Ok(())
            }
            (Protocol::Bwp, TargetType::Page) => {
                self.send("Page.reload", json!({"ignoreCache": false}))?;
                Ok(())
            }
            (Protocol::Bwp, _) => Err(anyhow!("restart is only supported for page and native targets")),
        }
    }

    /// The `ss` summary: stop state at a glance.
    pub fn stop_state(&self) -> Map<String, Value> {
        let state = self.state();
        let state = state.lock().unwrap();
        let mut body = Map::new();
        body.insert(String::from("paused"), Value::from(state.paused));
        body.insert(String::from("stop_epoch"), Value::from(state.stop_epoch));
        body.insert(
            String::from("reason"),
            state.stop_reason.clone().map(Value::from).unwrap_or(Value::Null),
        );
        if let Some(top) = state.call_frames.first() {
            body.insert(
                String::from("frame"),
                json!({
                    "function": top.function_name,
                    "file": top.file,
                    "line": top.line,
                }),
            );
        }
        if let Some(ndap) = state.wire.ndap() {
            body.insert(String::from("phase"), Value::from(ndap.phase.to_string()));
        }
        body
    }

    /// Rows for the `trace` command: sync frames then async frames.
    pub fn backtrace(&self) -> Vec<Value> {
        let state = self.state();
        let state = state.lock().unwrap();
        let mut rows: Vec<Value> = state
            .call_frames
            .iter()
            .map(|f| {
                json!({
                    "kind": "frame",
                    "function": f.function_name,
                    "file": f.file,
                    "line": f.line,
                })
            })
            .collect();
        rows.extend(state.async_stack.iter().map(|f| {
            json!({
                "kind": "async",
                "function": f.function_name,
                "file": f.file,
                "line": f.line,
                "description": f.description,
            })
        }));
        rows
    }
}

fn bp_json(line: i64, condition: Option<&str>) -> Value {
    let mut bp = json!({"line": line});
    if let Some(cond) = condition {
        bp["condition"] = Value::from(cond);
    }
    bp
}

fn script_url(file: &str) -> String {
    if file.contains("://") {
        String::from(file)
    } else if file.starts_with('/') {
        format!("file://{file}")
    } else {
        String::from(file)
    }
}

fn check_eval_exception(resp: &Value) -> anyhow::Result<()> {
    match resp.get("exceptionDetails") {
        Some(detail) => Err(anyhow!(
            "page script failed: {}",
            detail["exception"]["description"]
                .as_str()
                .or_else(|| detail["text"].as_str())
                .unwrap_or("unknown exception")
        )),
        None => Ok(()),
    }
}

impl SessionManager {
    /// Drop and re-establish a session's wire, carrying registered
    /// breakpoints over to the new connection.
    #[instrument(skip_all)]
    pub fn reconnect(&self, selector: Option<&str>) -> anyhow::Result<std::sync::Arc<Session>> {
        let old = self.get(selector)?;
        if old.protocol == Protocol::Ndap {
            return Err(anyhow!("native sessions reattach through attach-lldb"));
        }

        let breakpoints: Vec<(String, i64, Option<String>)> = {
            let state = old.state();
            let state = state.lock().unwrap();
            state
                .breakpoints
                .values()
                .map(|b| (b.file.clone(), b.line, b.condition.clone()))
                .collect()
        };

        let spec = TargetSpec {
            name: Some(old.name.clone()),
            host: Some(old.host.clone()),
            port: Some(old.port),
            target_type: Some(String::from(old.target_type.as_str())),
            cmd: None,
        };
        let name = old.name.clone();
        self.close(Some(&name))?;

        let session = self.attach(&spec).context("re-attaching")?;
        for (file, line, condition) in breakpoints {
            if let Err(e) = session.set_breakpoint(&file, line, condition.as_deref()) {
                info!("breakpoint at {}:{} did not survive reconnect: {:?}", file, line, e);
            }
        }
        self.use_session(&session.name)?;
        Ok(session)
    }
}
