use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// Messages between peers: UTF-8 JSON, one object per `\n`-terminated line,
/// discriminated by a `"type"` field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Handshake(HandshakeMessage),
    Bitfield(BitfieldMessage),
    Request(RequestMessage),
    Piece(PieceMessage),
    Have(HaveMessage),
    Peers(PeersMessage),
}

impl Message {
    /// Encode as one newline-terminated JSON line.
    pub fn encode(&self) -> Result<Vec<u8>, SwarmError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// First message on every connection. The metadata fields are null on a
/// leecher that has not adopted them yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    pub id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub piece_size: Option<u64>,
    pub port: u16,
}

/// Every piece index the sender currently holds, as an explicit list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BitfieldMessage {
    pub pieces: Vec<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub index: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PieceMessage {
    pub index: usize,
    pub data: String,
}

impl PieceMessage {
    pub fn new(index: usize, bytes: &[u8]) -> Self {
        Self {
            index,
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode the base64 payload back into raw piece bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, SwarmError> {
        Ok(general_purpose::STANDARD.decode(&self.data)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HaveMessage {
    pub index: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeersMessage {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Incremental decoder for the newline-delimited framing: accumulates raw
/// bytes and yields one parse result per complete line. Blank lines are
/// skipped; an unparseable line is surfaced as an error so the caller can
/// drop the message without closing the connection.
#[derive(Default)]
pub struct MessageCodec {
    buffer: Vec<u8>,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered without a terminating newline yet; the connection uses
    /// this to enforce its frame size cap.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next(&mut self) -> Option<Result<Message, SwarmError>> {
        loop {
            let end = self.buffer.iter().position(|&byte| byte == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = &line[..end];
            if line.iter().all(|byte| byte.is_ascii_whitespace()) {
                continue;
            }
            return Some(serde_json::from_slice(line).map_err(SwarmError::from));
        }
    }
}
