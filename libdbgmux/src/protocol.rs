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

use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
};

use anyhow::{Context, anyhow};
use dbgmux_protocol::{Command, Response};
use serde::Serialize;

/// The centralized encoding function that should be used for all
/// control plane serialization. One JSON object per line; the newline
/// is the frame delimiter, so the serializer must never emit one
/// mid-object (serde_json's compact form never does).
pub fn encode_to<T, W>(d: &T, w: &mut W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    serde_json::to_writer(&mut *w, d).context("serializing frame")?;
    w.write_all(b"\n").context("writing frame delimiter")?;
    w.flush().context("flushing frame")?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// control plane deserialization. Returns None on a clean EOF.
pub fn decode_from<T, R>(r: &mut R) -> anyhow::Result<Option<T>>
where
    for<'de> T: serde::Deserialize<'de>,
    R: BufRead,
{
    let mut line = String::new();
    let nread = r.read_line(&mut line).context("reading frame")?;
    if nread == 0 {
        return Ok(None);
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty frame"));
    }
    let d: T = serde_json::from_str(trimmed).context("deserializing frame")?;
    Ok(Some(d))
}

/// A control plane client. The wrapping cli binary and the integration
/// tests both talk to the daemon through this.
pub struct Client {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Client {
    pub fn new<P: AsRef<Path>>(sock: P) -> anyhow::Result<Client> {
        let stream = UnixStream::connect(sock).context("connecting to dbgmux daemon")?;
        let reader = BufReader::new(stream.try_clone().context("cloning read stream")?);
        Ok(Client { writer: stream, reader })
    }

    /// Send one command and block for its reply.
    pub fn call(&mut self, cmd: &Command) -> anyhow::Result<Response> {
        encode_to(cmd, &mut self.writer).context("writing command")?;
        decode_from(&mut self.reader)
            .context("reading reply")?
            .ok_or(anyhow!("daemon hung up mid-command"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let cmd = Command::Q { query: String::from("SELECT * FROM frames"), s: None };

        let mut buf: Vec<u8> = vec![];
        encode_to(&cmd, &mut buf).expect("encode to succeed");
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);

        let mut reader = std::io::Cursor::new(buf);
        let decoded: Option<Command> = decode_from(&mut reader).expect("decode to succeed");
        assert!(matches!(decoded, Some(Command::Q { .. })));

        // a second read sees clean EOF
        let eof: Option<Command> = decode_from(&mut reader).expect("eof to be clean");
        assert!(eof.is_none());
    }
}
