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

//! Target discovery for browser-wire endpoints: one GET against the
//! endpoint's `/json` listing, then a pure selection step.

use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::{consts, errors::BwpError, session::TargetType};

/// One entry of the `/json` target listing. Unknown fields are
/// ignored; entries without a websocket url are not attachable and get
/// filtered out during selection.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    pub ws_url: String,
    pub target_type: TargetType,
}

/// Fetch the target listing and choose one. With no explicit
/// preference a node target wins over a page target.
#[instrument(skip_all, fields(host = host, port = port))]
pub fn discover(
    host: &str,
    port: u16,
    pref: Option<TargetType>,
) -> Result<Discovered, BwpError> {
    let targets = fetch_targets(host, port)?;
    info!("discovery found {} targets", targets.len());
    choose_target(&targets, pref)
}

pub fn fetch_targets(host: &str, port: u16) -> Result<Vec<TargetInfo>, BwpError> {
    let url = format!("http://{host}:{port}/json");
    let client = reqwest::blocking::Client::builder()
        .timeout(consts::DISCOVERY_TIMEOUT)
        .build()
        .map_err(|e| BwpError::DiscoveryParse(e.to_string()))?;

    let classify = |e: &reqwest::Error| {
        if e.is_timeout() {
            BwpError::DiscoveryTimeout { host: String::from(host), port }
        } else {
            BwpError::Unreachable { host: String::from(host), port }
        }
    };

    let resp = client.get(&url).send().map_err(|e| classify(&e))?;
    let text = resp.text().map_err(|e| classify(&e))?;
    serde_json::from_str(&text).map_err(|e| BwpError::DiscoveryParse(e.to_string()))
}

/// Pick a target from the listing. An explicit preference demands an
/// exact type match; otherwise node is preferred and page is the
/// fallback.
pub fn choose_target(
    targets: &[TargetInfo],
    pref: Option<TargetType>,
) -> Result<Discovered, BwpError> {
    let attachable = |t: &&TargetInfo| t.ws_url.is_some();
    let of_type =
        |ty: &str| targets.iter().filter(attachable).find(|t| t.target_type == ty);

    let chosen = match pref {
        Some(want) => of_type(want.as_str())
            .ok_or_else(|| BwpError::NoTargetOfType(String::from(want.as_str())))?,
        None => of_type("node")
            .or_else(|| of_type("page"))
            .ok_or_else(|| BwpError::NoTargetOfType(String::from("node or page")))?,
    };

    let target_type = TargetType::parse(&chosen.target_type)
        .ok_or_else(|| BwpError::NoTargetOfType(chosen.target_type.clone()))?;
    Ok(Discovered {
        ws_url: chosen.ws_url.clone().expect("filtered for attachable targets"),
        target_type,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use assert_matches::assert_matches;
    use ntest::timeout;

    fn target(ty: &str, ws: Option<&str>) -> TargetInfo {
        TargetInfo {
            target_type: String::from(ty),
            title: String::new(),
            url: String::new(),
            ws_url: ws.map(String::from),
        }
    }

    // End-to-end selection scenarios from the transport contract.
    #[test]
    fn prefers_node_over_page() {
        let targets =
            vec![target("page", Some("ws://page")), target("node", Some("ws://node"))];
        let got = choose_target(&targets, None).expect("selection to succeed");
        assert_eq!(got.ws_url, "ws://node");
        assert_eq!(got.target_type, TargetType::Node);
    }

    #[test]
    fn falls_back_to_page() {
        let targets = vec![target("page", Some("ws://page"))];
        let got = choose_target(&targets, None).expect("selection to succeed");
        assert_eq!(got.ws_url, "ws://page");
        assert_eq!(got.target_type, TargetType::Page);
    }

    #[test]
    fn explicit_preference_is_strict() {
        let targets = vec![target("page", Some("ws://page"))];
        let err = choose_target(&targets, Some(TargetType::Node))
            .expect_err("node preference with only a page target must fail");
        assert_matches!(err, BwpError::NoTargetOfType(ref t) if t == "node");
        assert_eq!(err.code(), "ErrNoTargetOfType");
    }

    #[test]
    fn targets_without_ws_url_are_skipped() {
        let targets = vec![target("node", None), target("page", Some("ws://page"))];
        let got = choose_target(&targets, None).expect("selection to succeed");
        assert_eq!(got.ws_url, "ws://page");
    }

    fn serve_once(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes());
            }
        });
        port
    }

    #[test]
    #[timeout(30000)]
    fn fetch_parses_listing() {
        let port = serve_once(
            r#"[{"type":"node","webSocketDebuggerUrl":"ws://127.0.0.1:1/x","title":"t"}]"#,
        );
        let targets = fetch_targets("127.0.0.1", port).expect("fetch to succeed");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].target_type, "node");
    }

    #[test]
    #[timeout(30000)]
    fn fetch_maps_bad_json_to_discovery_parse() {
        let port = serve_once("this is not json");
        let err = fetch_targets("127.0.0.1", port).expect_err("parse failure");
        assert_eq!(err.code(), "ErrDiscoveryParse");
    }

    #[test]
    #[timeout(30000)]
    fn fetch_maps_connection_refused_to_unreachable() {
        // bind then drop to find a port nobody is listening on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let err = fetch_targets("127.0.0.1", port).expect_err("refused connection");
        assert_eq!(err.code(), "ErrUnreachable");
        assert!(err.to_string().contains(&format!("{port}")));
    }
}
