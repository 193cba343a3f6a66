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

//! JSON-RPC over the devtools websocket. A single pump thread owns the
//! socket, alternating between flushing queued outbound messages and a
//! short-timeout read, so one thread serves both directions without an
//! async runtime.

use std::{
    collections::HashMap,
    io,
    net::TcpStream,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::{consts, errors::BwpError};

/// How long the pump blocks in a read before checking for outbound
/// traffic.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum WsIoError {
    /// The peer closed the stream.
    Closed,
    Io(String),
}

/// The slice of websocket behavior the pump needs. The production
/// implementation wraps a tungstenite socket; tests script one.
pub trait WsIo: Send {
    /// Read the next text message. Returns Ok(None) when nothing
    /// arrived within the io timeout, which is the pump's cue to go
    /// service the outbound queue.
    fn read_text(&mut self) -> Result<Option<String>, WsIoError>;
    fn write_text(&mut self, text: &str) -> Result<(), WsIoError>;
}

struct TungsteniteIo {
    socket: tungstenite::WebSocket<tungstenite::stream::MaybeTlsStream<TcpStream>>,
}

impl WsIo for TungsteniteIo {
    fn read_text(&mut self) -> Result<Option<String>, WsIoError> {
        match self.socket.read() {
            Ok(tungstenite::Message::Text(text)) => Ok(Some(text.to_string())),
            // pings are answered by tungstenite's queue on next io
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(e))
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Err(WsIoError::Closed),
            Err(e) => Err(WsIoError::Io(e.to_string())),
        }
    }

    fn write_text(&mut self, text: &str) -> Result<(), WsIoError> {
        self.socket
            .send(tungstenite::Message::text(text))
            .map_err(|e| WsIoError::Io(e.to_string()))
    }
}

type Subscriber = Box<dyn Fn(&Value) + Send>;
type CloseSubscriber = Box<dyn Fn(&BwpError) + Send>;

struct Pending {
    method: String,
    reply: Sender<Result<Value, BwpError>>,
}

struct Inner {
    out_tx: Sender<String>,
    pending: Mutex<HashMap<i64, Pending>>,
    next_id: AtomicI64,
    closed: Mutex<Option<BwpError>>,
    event_subs: Mutex<HashMap<String, Vec<Subscriber>>>,
    /// Taps that see every inbound message; the session layer uses one
    /// to mirror traffic into the event log.
    any_subs: Mutex<Vec<Subscriber>>,
    close_subs: Mutex<Vec<CloseSubscriber>>,
    default_timeout: Duration,
}

#[derive(Clone)]
pub struct BwpTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BwpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BwpTransport").finish_non_exhaustive()
    }
}

impl BwpTransport {
    /// Dial the websocket url produced by discovery.
    #[instrument(skip_all, fields(url = ws_url))]
    pub fn connect(ws_url: &str, default_timeout: Duration) -> Result<BwpTransport, BwpError> {
        let (socket, _resp) = tungstenite::connect(ws_url)
            .map_err(|e| BwpError::RequestFailed {
                method: String::from("connect"),
                message: e.to_string(),
            })?;
        match socket.get_ref() {
            tungstenite::stream::MaybeTlsStream::Plain(stream) => {
                stream
                    .set_read_timeout(Some(PUMP_READ_TIMEOUT))
                    .map_err(|e| BwpError::RequestFailed {
                        method: String::from("connect"),
                        message: e.to_string(),
                    })?;
            }
            // devtools endpoints are plaintext on loopback; anything
            // else just runs with blocking reads
            _ => warn!("non-plain websocket stream, pump reads will block"),
        }
        info!("devtools websocket connected");
        Ok(BwpTransport::start(TungsteniteIo { socket }, default_timeout))
    }

    /// Start the pump over an arbitrary websocket implementation.
    pub fn start<W: WsIo + 'static>(io: W, default_timeout: Duration) -> BwpTransport {
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            closed: Mutex::new(None),
            event_subs: Mutex::new(HashMap::new()),
            any_subs: Mutex::new(vec![]),
            close_subs: Mutex::new(vec![]),
            default_timeout,
        });

        let pump_inner = Arc::clone(&inner);
        let _ = thread::Builder::new()
            .name(String::from("bwp-pump"))
            .spawn(move || pump(io, out_rx, pump_inner));

        BwpTransport { inner }
    }

    /// Issue one method call and block for the correlated result.
    pub fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BwpError> {
        if self.inner.closed.lock().unwrap().is_some() {
            return Err(BwpError::TransportClosed);
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.len() >= consts::MAX_OUTSTANDING_REQUESTS {
                return Err(BwpError::Backpressure);
            }
            pending.insert(id, Pending { method: String::from(method), reply: reply_tx });
        }

        let mut msg = json!({"id": id, "method": method});
        if !params.is_null() {
            msg["params"] = params;
        }
        if self.inner.out_tx.send(msg.to_string()).is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(BwpError::TransportClosed);
        }

        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        match reply_rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                if let Ok(res) = reply_rx.try_recv() {
                    return res;
                }
                Err(BwpError::RequestTimeout {
                    method: String::from(method),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Register a handler for a `method`-carrying event. Handlers run
    /// on the pump thread in registration order, panics isolated.
    pub fn on_event(&self, method: &str, f: impl Fn(&Value) + Send + 'static) {
        self.inner
            .event_subs
            .lock()
            .unwrap()
            .entry(String::from(method))
            .or_default()
            .push(Box::new(f));
    }

    /// Register a tap over every inbound message.
    pub fn on_any(&self, f: impl Fn(&Value) + Send + 'static) {
        self.inner.any_subs.lock().unwrap().push(Box::new(f));
    }

    pub fn on_close(&self, f: impl Fn(&BwpError) + Send + 'static) {
        self.inner.close_subs.lock().unwrap().push(Box::new(f));
    }

    pub fn close(&self) {
        close_with(&self.inner, BwpError::TransportClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().unwrap().is_some()
    }
}

fn close_with(inner: &Inner, cause: BwpError) {
    {
        let mut closed = inner.closed.lock().unwrap();
        if closed.is_some() {
            return;
        }
        *closed = Some(cause.clone());
    }
    info!("bwp transport closing: {}", cause);

    let pending: Vec<Pending> = {
        let mut map = inner.pending.lock().unwrap();
        map.drain().map(|(_, p)| p).collect()
    };
    for p in pending {
        let _ = p.reply.send(Err(BwpError::TransportClosed));
    }

    let subs = inner.close_subs.lock().unwrap();
    for sub in subs.iter() {
        if catch_unwind(AssertUnwindSafe(|| sub(&cause))).is_err() {
            error!("close subscriber panicked");
        }
    }
}

fn pump<W: WsIo>(mut io: W, out_rx: Receiver<String>, inner: Arc<Inner>) {
    loop {
        if inner.closed.lock().unwrap().is_some() {
            return;
        }

        // flush everything queued for the peer
        while let Ok(text) = out_rx.try_recv() {
            if let Err(e) = io.write_text(&text) {
                debug!("websocket write failed: {:?}", e);
                close_with(&inner, BwpError::TransportClosed);
                return;
            }
        }

        match io.read_text() {
            Ok(Some(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(msg) => handle(&inner, msg),
                Err(e) => warn!("dropping unparseable devtools frame: {:?}", e),
            },
            Ok(None) => {}
            Err(e) => {
                debug!("websocket read failed: {:?}", e);
                close_with(&inner, BwpError::TransportClosed);
                return;
            }
        }
    }
}

fn handle(inner: &Inner, msg: Value) {
    {
        let taps = inner.any_subs.lock().unwrap();
        for tap in taps.iter() {
            if catch_unwind(AssertUnwindSafe(|| tap(&msg))).is_err() {
                error!("message tap panicked");
            }
        }
    }

    if let Some(id) = msg.get("id").and_then(Value::as_i64) {
        let Some(pending) = inner.pending.lock().unwrap().remove(&id) else {
            debug!("discarding uncorrelated response for id {}", id);
            return;
        };
        let result = match msg.get("error") {
            Some(err) => Err(BwpError::RequestFailed {
                method: pending.method.clone(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string(),
            }),
            None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = pending.reply.send(result);
    } else if let Some(method) = msg.get("method").and_then(Value::as_str) {
        let subs = inner.event_subs.lock().unwrap();
        if let Some(handlers) = subs.get(method) {
            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&msg))).is_err() {
                    error!("subscriber for '{}' panicked", method);
                }
            }
        }
    }
}
