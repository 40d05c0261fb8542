//! Control protocol codec.
//!
//! Every frame is a sequence of newline-terminated UTF-8 tokens: a three letter
//! verb followed by its fields. Integers are decimal, booleans are the literal
//! strings `true` / `false`.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const MAX_TOKEN_BYTES: usize = 64 * 1024;

const READ_BUFFER_BYTES: usize = 16 * 1024;

pub const VERB_AUTH: &str = "ATH";
pub const VERB_AUTH_RESULT: &str = "ARS";
pub const VERB_HEARTBEAT: &str = "SRQ";
pub const VERB_HEARTBEAT_ACK: &str = "SRS";
pub const VERB_MAP: &str = "MAP";
pub const VERB_MAP_RESULT: &str = "MRS";
pub const VERB_TUNNEL_REQUEST: &str = "TRQ";
pub const VERB_TUNNEL_READY: &str = "TRS";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    Eof,
    #[error("token exceeds {MAX_TOKEN_BYTES} bytes")]
    TokenTooLong,
    #[error("token is not valid utf-8")]
    InvalidUtf8,
    #[error("token contains a line break")]
    InvalidToken,
    #[error("illegal integer value {0:?}")]
    InvalidInt(String),
    #[error("illegal bool value {0:?}")]
    InvalidBool(String),
    #[error("port out of range: {0}")]
    InvalidPort(i64),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Commands sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Auth {
        name: String,
        username: String,
        password: String,
    },
    Heartbeat,
    Map {
        remote_port: u16,
        local_addr: String,
        is_open: bool,
    },
    /// Sent as the first frame of a data connection.
    TunnelReady { token: String, remote_port: u16 },
}

/// Commands sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    AuthAccepted { timeout_secs: u64, token: String },
    AuthRejected,
    HeartbeatAck,
    MapResult { remote_port: u16, ok: bool },
    TunnelRequest { remote_port: u16 },
}

impl ClientCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            ClientCommand::Auth { .. } => VERB_AUTH,
            ClientCommand::Heartbeat => VERB_HEARTBEAT,
            ClientCommand::Map { .. } => VERB_MAP,
            ClientCommand::TunnelReady { .. } => VERB_TUNNEL_READY,
        }
    }
}

pub trait Frame {
    fn tokens(&self) -> Vec<String>;
}

impl Frame for ClientCommand {
    fn tokens(&self) -> Vec<String> {
        match self {
            ClientCommand::Auth {
                name,
                username,
                password,
            } => vec![
                VERB_AUTH.into(),
                name.clone(),
                username.clone(),
                password.clone(),
            ],
            ClientCommand::Heartbeat => vec![VERB_HEARTBEAT.into()],
            ClientCommand::Map {
                remote_port,
                local_addr,
                is_open,
            } => vec![
                VERB_MAP.into(),
                remote_port.to_string(),
                local_addr.clone(),
                is_open.to_string(),
            ],
            ClientCommand::TunnelReady { token, remote_port } => vec![
                VERB_TUNNEL_READY.into(),
                token.clone(),
                remote_port.to_string(),
            ],
        }
    }
}

impl Frame for ServerCommand {
    fn tokens(&self) -> Vec<String> {
        match self {
            ServerCommand::AuthAccepted {
                timeout_secs,
                token,
            } => vec![
                VERB_AUTH_RESULT.into(),
                "true".into(),
                timeout_secs.to_string(),
                token.clone(),
            ],
            ServerCommand::AuthRejected => vec![VERB_AUTH_RESULT.into(), "false".into()],
            ServerCommand::HeartbeatAck => vec![VERB_HEARTBEAT_ACK.into()],
            ServerCommand::MapResult { remote_port, ok } => vec![
                VERB_MAP_RESULT.into(),
                remote_port.to_string(),
                ok.to_string(),
            ],
            ServerCommand::TunnelRequest { remote_port } => {
                vec![VERB_TUNNEL_REQUEST.into(), remote_port.to_string()]
            }
        }
    }
}

/// Encodes tokens into one frame buffer, so the frame can be written in a
/// single call.
pub fn encode_frame<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    for t in tokens {
        let t = t.as_ref();
        if t.contains('\n') || t.contains('\r') {
            return Err(ProtocolError::InvalidToken);
        }
        out.extend_from_slice(t.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

pub async fn write_frame<W: AsyncWrite + Unpin, F: Frame>(
    w: &mut W,
    frame: &F,
) -> Result<(), ProtocolError> {
    let buf = encode_frame(&frame.tokens())?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Buffered token reader over the read side of a connection.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER_BYTES, r),
            line: Vec::new(),
        }
    }

    /// Gives back the buffered reader. Bytes that were read ahead of the last
    /// frame stay in its buffer.
    pub fn into_inner(self) -> BufReader<R> {
        self.inner
    }

    pub async fn read_string(&mut self) -> Result<String, ProtocolError> {
        self.line.clear();
        let limit = (MAX_TOKEN_BYTES + 2) as u64;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.line)
            .await?;
        if n == 0 {
            return Err(ProtocolError::Eof);
        }
        if self.line.last() != Some(&b'\n') {
            if n as u64 >= limit {
                return Err(ProtocolError::TokenTooLong);
            }
            // Partial token cut off by end of stream.
            return Err(ProtocolError::Eof);
        }
        self.line.pop();
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        if self.line.len() > MAX_TOKEN_BYTES {
            return Err(ProtocolError::TokenTooLong);
        }
        String::from_utf8(std::mem::take(&mut self.line)).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub async fn read_int(&mut self) -> Result<i64, ProtocolError> {
        let s = self.read_string().await?;
        s.trim()
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidInt(s))
    }

    pub async fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        let s = self.read_string().await?;
        match s.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ProtocolError::InvalidBool(s)),
        }
    }

    pub async fn read_port(&mut self) -> Result<u16, ProtocolError> {
        let n = self.read_int().await?;
        u16::try_from(n).map_err(|_| ProtocolError::InvalidPort(n))
    }

    pub async fn read_client_command(&mut self) -> Result<ClientCommand, ProtocolError> {
        let verb = self.read_string().await?;
        match verb.as_str() {
            VERB_AUTH => Ok(ClientCommand::Auth {
                name: self.read_string().await?,
                username: self.read_string().await?,
                password: self.read_string().await?,
            }),
            VERB_HEARTBEAT => Ok(ClientCommand::Heartbeat),
            VERB_MAP => Ok(ClientCommand::Map {
                remote_port: self.read_port().await?,
                local_addr: self.read_string().await?,
                is_open: self.read_bool().await?,
            }),
            VERB_TUNNEL_READY => Ok(ClientCommand::TunnelReady {
                token: self.read_string().await?,
                remote_port: self.read_port().await?,
            }),
            _ => Err(ProtocolError::UnknownCommand(verb)),
        }
    }

    pub async fn read_server_command(&mut self) -> Result<ServerCommand, ProtocolError> {
        let verb = self.read_string().await?;
        match verb.as_str() {
            VERB_AUTH_RESULT => {
                if !self.read_bool().await? {
                    return Ok(ServerCommand::AuthRejected);
                }
                let timeout = self.read_int().await?;
                let timeout_secs =
                    u64::try_from(timeout).map_err(|_| ProtocolError::InvalidInt(timeout.to_string()))?;
                let token = self.read_string().await?;
                Ok(ServerCommand::AuthAccepted {
                    timeout_secs,
                    token,
                })
            }
            VERB_HEARTBEAT_ACK => Ok(ServerCommand::HeartbeatAck),
            VERB_MAP_RESULT => Ok(ServerCommand::MapResult {
                remote_port: self.read_port().await?,
                ok: self.read_bool().await?,
            }),
            VERB_TUNNEL_REQUEST => Ok(ServerCommand::TunnelRequest {
                remote_port: self.read_port().await?,
            }),
            _ => Err(ProtocolError::UnknownCommand(verb)),
        }
    }
}

/// Write side of a connection shared between tasks. Each frame is written
/// under the lock, so frames from different writers never interleave.
pub struct FrameWriter<W> {
    inner: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(w),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }

    pub async fn send<F: Frame>(&self, frame: &F) -> Result<(), ProtocolError> {
        let buf = encode_frame(&frame.tokens())?;
        let mut w = self.inner.lock().await;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }
}
