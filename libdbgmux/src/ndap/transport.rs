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

//! The native debug adapter transport: `Content-Length` framed JSON
//! over a child process's stdio, with seq/request_seq correlation.
//!
//! A reader thread drains the child's stdout and routes responses to
//! whoever is blocked in `request`; a second thread keeps the last few
//! KiB of stderr around so process-exit errors can say why. Writes are
//! serialized under the writer lock, which is also what gives a
//! session its request ordering.

use std::{
    collections::{HashMap, VecDeque},
    io::{Read, Write},
    panic::{AssertUnwindSafe, catch_unwind},
    process,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use crossbeam_channel::Sender;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::{consts, errors::NdapError};

type Subscriber = Box<dyn Fn(&Value) + Send>;
type CloseSubscriber = Box<dyn Fn(&NdapError) + Send>;

struct Pending {
    command: String,
    reply: Sender<Result<Value, NdapError>>,
}

struct Inner {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    pending: Mutex<HashMap<i64, Pending>>,
    next_seq: AtomicI64,
    /// None while open; once set, the cause every later request is
    /// rejected with.
    closed: Mutex<Option<NdapError>>,
    stderr_tail: Mutex<VecDeque<u8>>,
    event_subs: Mutex<HashMap<String, Vec<Subscriber>>>,
    response_subs: Mutex<HashMap<String, Vec<Subscriber>>>,
    /// Taps over every inbound frame; the session layer mirrors
    /// traffic into the event log through one.
    any_subs: Mutex<Vec<Subscriber>>,
    close_subs: Mutex<Vec<CloseSubscriber>>,
    default_timeout: Duration,
    request_cap: AtomicUsize,
    child: Mutex<Option<process::Child>>,
}

#[derive(Clone)]
pub struct NdapTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NdapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdapTransport").finish_non_exhaustive()
    }
}

impl NdapTransport {
    /// Spawn the adapter child and wire its stdio up as the transport.
    #[instrument(skip_all, fields(adapter = ?cmd.get_program()))]
    pub fn spawn(mut cmd: process::Command, default_timeout: Duration) -> anyhow::Result<NdapTransport> {
        cmd.stdin(process::Stdio::piped())
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped());
        let mut child = cmd.spawn().context("spawning debug adapter")?;

        let stdin = child.stdin.take().context("taking adapter stdin")?;
        let stdout = child.stdout.take().context("taking adapter stdout")?;
        let stderr = child.stderr.take().context("taking adapter stderr")?;

        let transport = NdapTransport::from_streams(stdout, stdin, default_timeout);
        *transport.inner.child.lock().unwrap() = Some(child);

        let tail_inner = Arc::clone(&transport.inner);
        thread::Builder::new()
            .name(String::from("ndap-stderr"))
            .spawn(move || drain_stderr(stderr, tail_inner))
            .context("spawning stderr drain")?;

        Ok(transport)
    }

    /// Build a transport over arbitrary streams. The reader thread
    /// starts immediately.
    pub fn from_streams<R, W>(reader: R, writer: W, default_timeout: Duration) -> NdapTransport
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let inner = Arc::new(Inner {
            writer: Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicI64::new(1),
            closed: Mutex::new(None),
            stderr_tail: Mutex::new(VecDeque::new()),
            event_subs: Mutex::new(HashMap::new()),
            response_subs: Mutex::new(HashMap::new()),
            any_subs: Mutex::new(vec![]),
            close_subs: Mutex::new(vec![]),
            default_timeout,
            request_cap: AtomicUsize::new(consts::MAX_OUTSTANDING_REQUESTS),
            child: Mutex::new(None),
        });

        let reader_inner = Arc::clone(&inner);
        // read loop exits when the stream does
        let _ = thread::Builder::new()
            .name(String::from("ndap-reader"))
            .spawn(move || read_loop(reader, reader_inner));

        NdapTransport { inner }
    }

    #[cfg(test)]
    fn set_request_cap(&self, cap: usize) {
        self.inner.request_cap.store(cap, Ordering::SeqCst);
    }

    /// Issue one request and block for the correlated response.
    pub fn request(
        &self,
        command: &str,
        args: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, NdapError> {
        if let Some(cause) = self.rejection_cause() {
            return Err(cause);
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.len() >= self.inner.request_cap.load(Ordering::SeqCst) {
                return Err(NdapError::Backpressure);
            }
            pending.insert(seq, Pending { command: String::from(command), reply: reply_tx });
        }

        let mut msg = json!({
            "seq": seq,
            "type": "request",
            "command": command,
        });
        if let Some(args) = args {
            msg["arguments"] = args;
        }

        if let Err(e) = self.write_frame(&msg) {
            self.inner.pending.lock().unwrap().remove(&seq);
            debug!("write for '{}' failed: {:?}", command, e);
            let tail = self.stderr_tail();
            close_with(&self.inner, NdapError::ProcessExited { stderr_tail: tail });
            return Err(self.rejection_cause().unwrap_or(NdapError::TransportClosed));
        }

        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        match reply_rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(_) => {
                // remove the correlation entry so a late response is
                // discarded instead of delivered
                self.inner.pending.lock().unwrap().remove(&seq);
                // the response may have raced the timeout
                if let Ok(res) = reply_rx.try_recv() {
                    return res;
                }
                Err(NdapError::RequestTimeout {
                    command: String::from(command),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Register a handler for a named adapter event. Handlers run on
    /// the reader thread in registration order; a panicking handler
    /// does not take down its neighbors or the transport.
    pub fn on_event(&self, name: &str, f: impl Fn(&Value) + Send + 'static) {
        self.inner
            .event_subs
            .lock()
            .unwrap()
            .entry(String::from(name))
            .or_default()
            .push(Box::new(f));
    }

    /// Register a handler that sees every response to a given command,
    /// regardless of who issued it.
    pub fn on_response(&self, command: &str, f: impl Fn(&Value) + Send + 'static) {
        self.inner
            .response_subs
            .lock()
            .unwrap()
            .entry(String::from(command))
            .or_default()
            .push(Box::new(f));
    }

    /// Register a tap over every inbound frame.
    pub fn on_any(&self, f: impl Fn(&Value) + Send + 'static) {
        self.inner.any_subs.lock().unwrap().push(Box::new(f));
    }

    /// Register a handler to run once when the transport closes for
    /// any reason.
    pub fn on_close(&self, f: impl Fn(&NdapError) + Send + 'static) {
        self.inner.close_subs.lock().unwrap().push(Box::new(f));
    }

    /// Tear the transport down. Outstanding requests fail immediately;
    /// a live adapter child gets SIGTERM, then SIGKILL if it lingers.
    #[instrument(skip_all)]
    pub fn close(&self) {
        close_with(&self.inner, NdapError::TransportClosed);

        let child = self.inner.child.lock().unwrap().take();
        if let Some(mut child) = child {
            crate::session::kill_child(&mut child);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().unwrap().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.child.lock().unwrap().as_ref().map(|c| c.id())
    }

    pub fn stderr_tail(&self) -> String {
        let tail = self.inner.stderr_tail.lock().unwrap();
        String::from_utf8_lossy(tail.make_contiguous_clone().as_slice()).into_owned()
    }

    /// What a new request should be rejected with, if anything. After
    /// a child exit that is process-exited (so callers still learn the
    /// stderr context); after an explicit close or a framing error it
    /// is transport-closed.
    fn rejection_cause(&self) -> Option<NdapError> {
        let closed = self.inner.closed.lock().unwrap();
        closed.as_ref().map(|cause| match cause {
            e @ NdapError::ProcessExited { .. } => e.clone(),
            _ => NdapError::TransportClosed,
        })
    }

    fn write_frame(&self, msg: &Value) -> anyhow::Result<()> {
        let body = serde_json::to_vec(msg).context("encoding frame")?;
        let mut writer = self.inner.writer.lock().unwrap();
        let w = writer.as_mut().context("writer gone")?;
        write!(w, "Content-Length: {}\r\n\r\n", body.len()).context("writing frame header")?;
        w.write_all(&body).context("writing frame body")?;
        w.flush().context("flushing frame")?;
        Ok(())
    }
}

trait TailExt {
    fn make_contiguous_clone(&self) -> Vec<u8>;
}

impl TailExt for VecDeque<u8> {
    fn make_contiguous_clone(&self) -> Vec<u8> {
        self.iter().copied().collect()
    }
}

fn drain_stderr(mut stderr: impl Read, inner: Arc<Inner>) {
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut tail = inner.stderr_tail.lock().unwrap();
                for b in &buf[..n] {
                    if tail.len() >= consts::STDERR_TAIL_BYTES {
                        tail.pop_front();
                    }
                    tail.push_back(*b);
                }
            }
        }
    }
}

/// Fail everything outstanding and latch the close cause. Idempotent:
/// only the first cause wins.
fn close_with(inner: &Inner, cause: NdapError) {
    {
        let mut closed = inner.closed.lock().unwrap();
        if closed.is_some() {
            return;
        }
        *closed = Some(cause.clone());
    }
    info!("ndap transport closing: {}", cause);

    *inner.writer.lock().unwrap() = None;

    let pending: Vec<Pending> = {
        let mut map = inner.pending.lock().unwrap();
        map.drain().map(|(_, p)| p).collect()
    };
    for p in pending {
        let _ = p.reply.send(Err(cause.clone()));
    }

    let subs = inner.close_subs.lock().unwrap();
    for sub in subs.iter() {
        if catch_unwind(AssertUnwindSafe(|| sub(&cause))).is_err() {
            error!("close subscriber panicked");
        }
    }
}

/// Scan for the end of a header block. Returns the index just past the
/// `\r\n\r\n` terminator.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Pull Content-Length out of a header block. An unparseable value is
/// a protocol error that poisons the whole stream, so the raw text
/// comes back in the error.
fn parse_content_length(headers: &str) -> Result<usize, String> {
    for line in headers.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let value = value.trim();
                return value.parse::<usize>().map_err(|_| String::from(value));
            }
        }
    }
    Err(String::from("<missing>"))
}

fn read_loop(mut reader: impl Read, inner: Arc<Inner>) {
    let mut buf: Vec<u8> = Vec::with_capacity(consts::BUF_SIZE);
    let mut chunk = [0u8; consts::BUF_SIZE];

    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => {
                if inner.closed.lock().unwrap().is_none() {
                    let tail = {
                        let t = inner.stderr_tail.lock().unwrap();
                        String::from_utf8_lossy(t.make_contiguous_clone().as_slice()).into_owned()
                    };
                    close_with(&inner, NdapError::ProcessExited { stderr_tail: tail });
                }
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }

        // drain as many complete frames as the buffer holds
        loop {
            let Some(body_start) = find_header_end(&buf) else {
                break;
            };
            let headers = String::from_utf8_lossy(&buf[..body_start - 4]).into_owned();
            let body_len = match parse_content_length(&headers) {
                Ok(n) => n,
                Err(raw) => {
                    close_with(&inner, NdapError::ProtocolHeaderInvalid(raw));
                    return;
                }
            };
            if buf.len() < body_start + body_len {
                break;
            }
            let body: Vec<u8> = buf.drain(..body_start + body_len).skip(body_start).collect();
            match serde_json::from_slice::<Value>(&body) {
                Ok(msg) => dispatch(&inner, msg),
                Err(e) => warn!("dropping unparseable adapter frame: {:?}", e),
            }
        }
    }
}

fn dispatch(inner: &Inner, msg: Value) {
    {
        let taps = inner.any_subs.lock().unwrap();
        for tap in taps.iter() {
            if catch_unwind(AssertUnwindSafe(|| tap(&msg))).is_err() {
                error!("message tap panicked");
            }
        }
    }

    match msg.get("type").and_then(Value::as_str) {
        Some("response") => {
            let Some(request_seq) = msg.get("request_seq").and_then(Value::as_i64) else {
                warn!("response frame without request_seq");
                return;
            };

            if let Some(command) = msg.get("command").and_then(Value::as_str) {
                notify(&inner.response_subs, command, &msg);
            }

            // a response whose request was cancelled by timeout has no
            // pending entry and is dropped on the floor
            let Some(pending) = inner.pending.lock().unwrap().remove(&request_seq) else {
                debug!("discarding uncorrelated response for seq {}", request_seq);
                return;
            };

            let success = msg.get("success").and_then(Value::as_bool).unwrap_or(false);
            let result = if success {
                Ok(msg.get("body").cloned().unwrap_or(Value::Null))
            } else {
                let message = msg
                    .get("message")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or_else(|| {
                        msg.pointer("/body/error/format")
                            .and_then(Value::as_str)
                            .map(String::from)
                    })
                    .unwrap_or_else(|| String::from("request failed"));
                Err(NdapError::RequestFailed { command: pending.command.clone(), message })
            };
            let _ = pending.reply.send(result);
        }
        Some("event") => {
            if let Some(name) = msg.get("event").and_then(Value::as_str) {
                notify(&inner.event_subs, name, &msg);
            }
        }
        other => {
            debug!("ignoring adapter frame of type {:?}", other);
        }
    }
}

fn notify(subs: &Mutex<HashMap<String, Vec<Subscriber>>>, name: &str, msg: &Value) {
    let subs = subs.lock().unwrap();
    if let Some(handlers) = subs.get(name) {
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                error!("subscriber for '{}' panicked", name);
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::{testio::*, *};

    use assert_matches::assert_matches;
    use crossbeam_channel::unbounded;
    use ntest::timeout;

    fn respond(fx: &Fixture, request_seq: i64, body: Value) {
        fx.to_transport
            .send(frame(&json!({
                "seq": 100 + request_seq,
                "type": "response",
                "request_seq": request_seq,
                "success": true,
                "command": "x",
                "body": body,
            })))
            .expect("send");
    }

    #[test]
    #[timeout(30000)]
    fn correlates_concurrent_requests() {
        let fx = fixture();

        let t1 = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("first", None, None))
        };
        let t2 = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("second", None, None))
        };

        // collect both outbound requests, then answer in reverse order
        let a = fx.from_transport.recv().expect("first request");
        let b = fx.from_transport.recv().expect("second request");
        let seq_a = a["seq"].as_i64().unwrap();
        let seq_b = b["seq"].as_i64().unwrap();
        assert_ne!(seq_a, seq_b);

        respond(&fx, seq_b, json!({"tag": seq_b}));
        respond(&fx, seq_a, json!({"tag": seq_a}));

        let r1 = t1.join().unwrap().expect("first response");
        let r2 = t2.join().unwrap().expect("second response");
        // each caller sees the body correlated to its own seq, spelled
        // by whichever of a/b carried its command
        let (first_seq, second_seq) = if a["command"] == "first" { (seq_a, seq_b) } else { (seq_b, seq_a) };
        assert_eq!(r1["tag"].as_i64().unwrap(), first_seq);
        assert_eq!(r2["tag"].as_i64().unwrap(), second_seq);
    }

    #[test]
    #[timeout(30000)]
    fn request_timeout_is_prompt() {
        let fx = fixture();
        let start = std::time::Instant::now();
        let res = fx.transport.request("threads", None, Some(Duration::from_millis(10)));
        let elapsed = start.elapsed();

        assert_matches!(res, Err(NdapError::RequestTimeout { .. }));
        assert_eq!(res.unwrap_err().code(), "DAP_REQUEST_TIMEOUT");
        assert!(elapsed <= Duration::from_millis(50), "timeout took {elapsed:?}");
    }

    #[test]
    #[timeout(30000)]
    fn late_response_after_timeout_is_discarded() {
        let fx = fixture();
        let res = fx.transport.request("slow", None, Some(Duration::from_millis(10)));
        assert_matches!(res, Err(NdapError::RequestTimeout { .. }));
        let seq = fx.from_transport.recv().expect("request")["seq"].as_i64().unwrap();

        // answering now must not confuse the next request
        respond(&fx, seq, json!({"stale": true}));

        let next = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("next", None, None))
        };
        let next_seq = fx.from_transport.recv().expect("next request")["seq"].as_i64().unwrap();
        respond(&fx, next_seq, json!({"fresh": true}));
        let body = next.join().unwrap().expect("next response");
        assert_eq!(body, json!({"fresh": true}));
    }

    #[test]
    #[timeout(30000)]
    fn failed_response_carries_server_message() {
        let fx = fixture();
        let t = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("attach", None, None))
        };
        let seq = fx.from_transport.recv().expect("request")["seq"].as_i64().unwrap();
        fx.to_transport
            .send(frame(&json!({
                "seq": 1,
                "type": "response",
                "request_seq": seq,
                "success": false,
                "command": "attach",
                "message": "permission denied",
            })))
            .expect("send");

        let err = t.join().unwrap().expect_err("failure to propagate");
        assert_eq!(err.code(), "DAP_REQUEST_FAILED");
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    #[timeout(30000)]
    fn invalid_content_length_poisons_stream() {
        let fx = fixture();
        let t = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("threads", None, None))
        };
        // wait for the request to be outstanding
        let _ = fx.from_transport.recv().expect("request");

        fx.to_transport
            .send(b"Content-Length: abc\r\n\r\n{}".to_vec())
            .expect("send");

        let err = t.join().unwrap().expect_err("pending request to fail");
        assert_eq!(err.code(), "DAP_PROTOCOL_HEADER_INVALID");
        assert!(err.to_string().contains("abc"));

        // the transport is closed now
        let res = fx.transport.request("threads", None, None);
        assert_matches!(res, Err(NdapError::TransportClosed));
    }

    #[test]
    #[timeout(30000)]
    fn exit_fails_outstanding_and_subsequent_requests() {
        let fx = fixture();
        fx.transport
            .inner
            .stderr_tail
            .lock()
            .unwrap()
            .extend(b"Segmentation fault (core dumped)".iter());

        let t = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("threads", None, None))
        };
        let _ = fx.from_transport.recv().expect("request");

        // dropping the sender is EOF on the adapter's stdout
        drop(fx.to_transport);

        let err = t.join().unwrap().expect_err("pending request to fail");
        assert_eq!(err.code(), "DAP_PROCESS_EXITED");
        assert!(err.to_string().contains("Segmentation fault"));

        // a later request reports the same exit, stderr included
        let err = fx.transport.request("stackTrace", None, None).expect_err("closed");
        assert_eq!(err.code(), "DAP_PROCESS_EXITED");
        assert!(err.to_string().contains("Segmentation fault"));
    }

    #[test]
    #[timeout(30000)]
    fn backpressure_rejects_excess_requests() {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, _out_rx) = unbounded();
        let transport = NdapTransport::from_streams(
            ChanReader::new(in_rx),
            ChanWriter { tx: out_tx, buf: vec![] },
            Duration::from_secs(5),
        );
        transport.set_request_cap(2);
        let _keep_open = in_tx;

        let hold = |transport: &NdapTransport| {
            let transport = transport.clone();
            thread::spawn(move || transport.request("hold", None, Some(Duration::from_millis(500))))
        };
        let h1 = hold(&transport);
        let h2 = hold(&transport);
        // let the held requests land in the pending map
        thread::sleep(Duration::from_millis(50));

        let res = transport.request("over", None, None);
        assert_matches!(res, Err(NdapError::Backpressure));
        assert_eq!(res.unwrap_err().code(), "DAP_TRANSPORT_BACKPRESSURE");

        let _ = h1.join().unwrap();
        let _ = h2.join().unwrap();
    }

    #[test]
    #[timeout(30000)]
    fn events_dispatch_in_registration_order_with_panic_isolation() {
        let fx = fixture();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(vec![]));

        {
            let seen = Arc::clone(&seen);
            fx.transport.on_event("stopped", move |_| {
                seen.lock().unwrap().push("first");
            });
        }
        fx.transport.on_event("stopped", |_| panic!("subscriber bug"));
        {
            let seen = Arc::clone(&seen);
            fx.transport.on_event("stopped", move |_| {
                seen.lock().unwrap().push("third");
            });
        }

        fx.to_transport
            .send(frame(&json!({
                "seq": 9,
                "type": "event",
                "event": "stopped",
                "body": {"reason": "breakpoint"},
            })))
            .expect("send");

        // the event lands asynchronously on the reader thread
        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);

        // the transport survived the panicking subscriber
        let t = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("ping", None, None))
        };
        let seq = fx.from_transport.recv().expect("request")["seq"].as_i64().unwrap();
        respond(&fx, seq, json!({}));
        assert!(t.join().unwrap().is_ok());
    }

    #[test]
    #[timeout(30000)]
    fn split_frames_reassemble() {
        let fx = fixture();
        let t = {
            let transport = fx.transport.clone();
            thread::spawn(move || transport.request("threads", None, None))
        };
        let seq = fx.from_transport.recv().expect("request")["seq"].as_i64().unwrap();

        let whole = frame(&json!({
            "seq": 2,
            "type": "response",
            "request_seq": seq,
            "success": true,
            "command": "threads",
            "body": {"threads": [{"id": 1}]},
        }));
        // deliver byte by byte across the header/body boundary
        for b in whole {
            fx.to_transport.send(vec![b]).expect("send byte");
        }

        let body = t.join().unwrap().expect("response");
        assert_eq!(body["threads"][0]["id"].as_i64(), Some(1));
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(parse_content_length("Content-Length: 42"), Ok(42));
        assert_eq!(parse_content_length("content-length:7"), Ok(7));
        assert_eq!(
            parse_content_length("Content-Type: json\r\nContent-Length: 3"),
            Ok(3)
        );
        assert_eq!(parse_content_length("Content-Length: abc"), Err(String::from("abc")));
        assert_eq!(parse_content_length("Nope: 1"), Err(String::from("<missing>")));
    }
}
