//! Newline-delimited JSON framing.
//!
//! The same codec is used over child stdio and TCP sockets: inbound bytes are
//! split into lines, outbound requests are written as one JSON object
//! followed by a single `\n`. Inbound bytes that are not valid UTF-8 are
//! replaced rather than rejected, so a garbled line never ends a read loop.

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Longest inbound line accepted before it is discarded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Line framer for JSON-RPC traffic.
#[derive(Debug)]
pub struct JsonLineCodec {
    lines: AnyDelimiterCodec,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self {
            lines: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                Vec::new(),
                MAX_LINE_LENGTH,
            ),
        }
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = String;
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, AnyDelimiterCodecError> {
        Ok(self.lines.decode(src)?.map(|chunk| to_line(&chunk)))
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<String>, AnyDelimiterCodecError> {
        Ok(self.lines.decode_eof(src)?.map(|chunk| to_line(&chunk)))
    }
}

/// Strip a trailing `\r` and decode lossily.
fn to_line(chunk: &[u8]) -> String {
    let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    String::from_utf8_lossy(chunk).into_owned()
}

impl Encoder<&JsonRpcRequest> for JsonLineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &JsonRpcRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// What an inbound line turned out to be.
#[derive(Debug)]
pub enum Inbound {
    /// A response to one of our requests.
    Response(JsonRpcResponse),
    /// A request or notification originated by the peer.
    Message { method: String },
    /// Anything else: log output, banners, malformed JSON.
    Diagnostic,
}

/// Classify one decoded line.
///
/// Never fails: lines that look like JSON but do not parse are logged and
/// treated as diagnostic text.
pub fn classify_line(line: &str) -> Inbound {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Inbound::Diagnostic;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring malformed JSON line from tool server: {e}");
            return Inbound::Diagnostic;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        return Inbound::Message {
            method: method.to_string(),
        };
    }

    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    if value.get("jsonrpc").is_none() || !has_id {
        return Inbound::Diagnostic;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => Inbound::Response(resp),
        Err(e) => {
            tracing::warn!("Ignoring unparseable JSON-RPC response: {e}");
            Inbound::Diagnostic
        }
    }
}
