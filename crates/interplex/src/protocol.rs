//! Wire protocol spoken between the host and engine processes.
//!
//! Every frame is a 4-byte big-endian length followed by a UTF-8 JSON
//! document. The document's `kind` field names the frame; requests carry a
//! `{"method": .., "params": ..}` envelope so engines in any runtime can
//! dispatch on it without knowing Rust's type layout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{Capabilities, ExecutionContext, Fragment, JobId};

/// Largest frame body accepted in either direction
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { len: usize },

    #[error("connection closed in the middle of a frame")]
    UnexpectedEof,
}

/// One message on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame an engine sends after connecting back
    Handshake {
        token: String,
        pid: u32,
        engine: String,
        #[serde(default)]
        capabilities: Capabilities,
    },

    HandshakeAck {
        #[serde(default)]
        properties: HashMap<String, String>,
    },

    HandshakeRejected {
        reason: String,
    },

    Request {
        call_id: u64,
        call: Method,
    },

    Response {
        call_id: u64,
        reply: Reply,
    },

    /// Unsolicited output for a running job
    Push {
        job_id: JobId,
        event: PushEvent,
    },
}

/// Calls the host makes on an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Method {
    Execute {
        job_id: JobId,
        context: ExecutionContext,
        code: String,
    },
    Cancel {
        job_id: JobId,
    },
    Status {
        job_id: JobId,
    },
    Shutdown {
        grace_ms: u64,
    },
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Execute { .. } => "execute",
            Method::Cancel { .. } => "cancel",
            Method::Status { .. } => "status",
            Method::Shutdown { .. } => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Reply {
    Execute(ExecuteReply),
    Cancel(CancelReply),
    Status(StatusReply),
    Shutdown,
    /// The engine could not handle the call at all
    Error {
        message: String,
    },
}

/// Final answer to an `execute` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ExecuteStatus,

    /// Fragments not already pushed, in emission order
    #[serde(default)]
    pub fragments: Vec<Fragment>,

    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    /// Failure description when `status` is `error`
    #[serde(default)]
    pub message: Option<String>,
}

impl ExecuteReply {
    pub fn success(fragments: Vec<Fragment>) -> Self {
        Self {
            status: ExecuteStatus::Success,
            fragments,
            payload: None,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecuteStatus::Error,
            fragments: Vec::new(),
            payload: None,
            message: Some(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: ExecuteStatus::Cancelled,
            fragments: Vec::new(),
            payload: None,
            message: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReply {
    Ack,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReply {
    Queued,
    Running,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Output { fragment: Fragment },
    Progress { percent: u8 },
}

/// Write one length-prefixed frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len: body.len() });
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    read_exact_or_eof(reader, &mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }

    let mut body = vec![0u8; len];
    read_exact_or_eof(reader, &mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}
