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

//! A minimal fake node inspector: an http listener answering `/json`
//! discovery and a websocket listener standing in for the debug
//! target. The websocket side acks every method and, once the
//! debugger domain is enabled, emits a couple of parsed scripts and a
//! pause so state-backed tables have rows to serve.

use std::{
    io::{Read, Write},
    net::TcpListener,
    thread,
};

use serde_json::{Value, json};

pub struct FakeDevtools {
    /// Dial discovery here.
    pub http_port: u16,
}

pub fn spawn() -> FakeDevtools {
    let ws_listener = TcpListener::bind("127.0.0.1:0").expect("binding ws listener");
    let ws_port = ws_listener.local_addr().expect("ws addr").port();

    thread::spawn(move || {
        for stream in ws_listener.incoming() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || serve_ws(stream));
        }
    });

    let http_listener = TcpListener::bind("127.0.0.1:0").expect("binding http listener");
    let http_port = http_listener.local_addr().expect("http addr").port();

    thread::spawn(move || {
        for stream in http_listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let body = json!([{
                "type": "node",
                "title": "fake target",
                "url": "file:///srv/app/main.ts",
                "webSocketDebuggerUrl": format!("ws://127.0.0.1:{ws_port}/target"),
            }])
            .to_string();
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes());
        }
    });

    FakeDevtools { http_port }
}

fn serve_ws(stream: std::net::TcpStream) {
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(_) => return,
    };

    loop {
        let msg = match socket.read() {
            Ok(tungstenite::Message::Text(text)) => text,
            Ok(_) => continue,
            Err(_) => return,
        };
        let Ok(req) = serde_json::from_str::<Value>(&msg) else { continue };
        let id = req["id"].as_i64().unwrap_or(0);
        let method = req["method"].as_str().unwrap_or("");

        let result = match method {
            "Debugger.setBreakpointByUrl" => json!({
                "breakpointId": format!("1:{}:0:{}",
                    req["params"]["lineNumber"].as_i64().unwrap_or(0),
                    req["params"]["url"].as_str().unwrap_or("")),
                "locations": [],
            }),
            "Debugger.getScriptSource" => json!({"scriptSource": "const x = 1;\n"}),
            _ => json!({}),
        };
        let reply = json!({"id": id, "result": result}).to_string();
        if socket.send(tungstenite::Message::text(reply)).is_err() {
            return;
        }

        // once the debugger domain is up, replay a tiny session:
        // two scripts parse, then execution pauses with two frames
        if method == "Debugger.enable" {
            let events = [
                json!({"method": "Debugger.scriptParsed", "params": {
                    "scriptId": "1",
                    "url": "file:///srv/app/appXts",
                    "endLine": 10,
                }}),
                json!({"method": "Debugger.scriptParsed", "params": {
                    "scriptId": "2",
                    "url": "file:///srv/app/app.ts",
                    "endLine": 10,
                }}),
                json!({"method": "Debugger.paused", "params": {
                    "reason": "other",
                    "callFrames": [
                        {
                            "callFrameId": "f0",
                            "functionName": "boot",
                            "url": "file:///srv/app/main.ts",
                            "location": {"scriptId": "3", "lineNumber": 4, "columnNumber": 0},
                            "scopeChain": [],
                        },
                        {
                            "callFrameId": "f1",
                            "functionName": "work",
                            "url": "file:///srv/app/main.ts",
                            "location": {"scriptId": "3", "lineNumber": 19, "columnNumber": 2},
                            "scopeChain": [],
                        }
                    ],
                }}),
            ];
            for event in events {
                if socket.send(tungstenite::Message::text(event.to_string())).is_err() {
                    return;
                }
            }
        }
    }
}
