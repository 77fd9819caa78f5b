//! Control-channel messages.
//!
//! Every message is a JSON value followed by a single NUL byte. There is no
//! discriminant field: object messages are recognized by which key they carry,
//! and the heartbeat is the bare string `"Heartbeat"`.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub const DELIMITER: u8 = 0;

/// Upper bound on a single encoded message, delimiter excluded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

const HEARTBEAT_LITERAL: &[u8] = b"\"Heartbeat\"";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    Closed,
    #[error("frame too large (over {0} bytes)")]
    FrameTooLarge(usize),
    #[error("unrecognized {side} message: {raw}")]
    Unrecognized { side: &'static str, raw: String },
    #[error("invalid id: {0}")]
    InvalidId(#[from] uuid::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClientMessage {
    /// Request a public port; 0 lets the server choose.
    Hello(u16),
    /// Hex HMAC tag answering the server's challenge.
    Authenticate(String),
    /// Claim a pending connection; the socket becomes a data connection.
    Accept(Uuid),
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServerMessage {
    /// The public port actually bound for this lease.
    Hello(u16),
    Challenge(Uuid),
    /// A public user connected; the client should claim it with `Accept`.
    Connection(Uuid),
    Error(String),
    Heartbeat,
}

pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(DELIMITER);
    Ok(buf)
}

/// Writes one delimited message. A failed write is fatal to the connection.
pub async fn send<W, M>(w: &mut W, msg: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let buf = encode(msg)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Reads one delimited frame and returns it without the trailing NUL.
///
/// End of stream, including a truncated trailing frame, is reported as
/// [`ProtocolError::Closed`].
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (MAX_FRAME_BYTES + 1) as u64;
    (&mut *r).take(limit).read_until(DELIMITER, &mut buf).await?;

    match buf.last() {
        Some(&DELIMITER) => {
            buf.pop();
            Ok(buf)
        }
        _ if buf.len() as u64 >= limit => Err(ProtocolError::FrameTooLarge(MAX_FRAME_BYTES)),
        _ => Err(ProtocolError::Closed),
    }
}

pub async fn recv_client<R>(r: &mut R) -> Result<ClientMessage, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let frame = read_frame(r).await?;
    parse_client_message(&frame)
}

pub async fn recv_server<R>(r: &mut R) -> Result<ServerMessage, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let frame = read_frame(r).await?;
    parse_server_message(&frame)
}

/// Classifies a client frame. Fields are checked in the order
/// `Accept`, `Hello`, `Authenticate`; a field of the wrong JSON type falls
/// through to the next check.
pub fn parse_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let obj: Map<String, Value> = serde_json::from_slice(data)?;

    if let Some(id) = str_field(&obj, "Accept") {
        return Ok(ClientMessage::Accept(Uuid::parse_str(id)?));
    }
    if let Some(port) = port_field(&obj, "Hello") {
        return Ok(ClientMessage::Hello(port));
    }
    if let Some(tag) = str_field(&obj, "Authenticate") {
        return Ok(ClientMessage::Authenticate(tag.to_string()));
    }

    Err(unrecognized("client", data))
}

/// Classifies a server frame. The heartbeat literal is matched first, then
/// object fields in the order `Hello`, `Connection`, `Challenge`, `Error`.
pub fn parse_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    if data == HEARTBEAT_LITERAL {
        return Ok(ServerMessage::Heartbeat);
    }

    let obj: Map<String, Value> = serde_json::from_slice(data)?;

    if let Some(port) = port_field(&obj, "Hello") {
        return Ok(ServerMessage::Hello(port));
    }
    if let Some(id) = str_field(&obj, "Connection") {
        return Ok(ServerMessage::Connection(Uuid::parse_str(id)?));
    }
    if let Some(id) = str_field(&obj, "Challenge") {
        return Ok(ServerMessage::Challenge(Uuid::parse_str(id)?));
    }
    if let Some(msg) = str_field(&obj, "Error") {
        return Ok(ServerMessage::Error(msg.to_string()));
    }

    Err(unrecognized("server", data))
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn port_field(obj: &Map<String, Value>, key: &str) -> Option<u16> {
    obj.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
}

fn unrecognized(side: &'static str, data: &[u8]) -> ProtocolError {
    ProtocolError::Unrecognized {
        side,
        raw: String::from_utf8_lossy(data).into_owned(),
    }
}
