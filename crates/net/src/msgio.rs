//! Framed envelope I/O over a byte stream.
//!
//! Each envelope travels as a u32 total length followed by the encoded
//! header and body. EOF before the declared length is a framing error, never
//! a silent truncation.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use quarry_proto::message::ProtoError;
use quarry_proto::{Envelope, ErrorCode};

/// Hard ceiling on one message, guarding against corrupt length prefixes.
const MAX_MSG_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MsgIoError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("message length {0} exceeds limit")]
    TooLarge(u32),
    #[error("timed out")]
    Timeout,
}

impl MsgIoError {
    /// Wire code for per-node result records.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MsgIoError::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                ErrorCode::ReadTooShort
            }
            MsgIoError::Io(_) => ErrorCode::ConnectionAborted,
            MsgIoError::Proto(ProtoError::Version(_)) => ErrorCode::VersionMismatch,
            MsgIoError::Proto(ProtoError::UnknownType(_)) => ErrorCode::UnexpectedMessage,
            MsgIoError::Proto(_) => ErrorCode::MalformedFrame,
            MsgIoError::TooLarge(_) => ErrorCode::MalformedFrame,
            MsgIoError::Timeout => ErrorCode::Timeout,
        }
    }
}

pub async fn write_envelope<W>(stream: &mut W, env: &Envelope) -> Result<(), MsgIoError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(stream, &env.encode()).await
}

/// Raw length-prefixed frame, used by the step manager request plane.
pub async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> Result<(), MsgIoError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>, MsgIoError>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    if len > MAX_MSG_BYTES {
        return Err(MsgIoError::TooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn read_envelope<R>(stream: &mut R) -> Result<Envelope, MsgIoError>
where
    R: AsyncRead + Unpin,
{
    let buf = read_frame(stream).await?;
    Ok(Envelope::decode(&buf)?)
}

/// Connect, send one message, and close without waiting for a reply. Used
/// for notifications whose receiver never answers (task exit, launch
/// response, srun events).
pub async fn send_one(addr: &str, env: &Envelope, timeout: Duration) -> Result<(), MsgIoError> {
    let work = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_envelope(&mut stream, env).await
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(res) => res,
        Err(_) => Err(MsgIoError::Timeout),
    }
}

/// Connect, send one request, wait for one reply.
pub async fn send_recv_one(
    addr: &str,
    env: &Envelope,
    timeout: Duration,
) -> Result<Envelope, MsgIoError> {
    let work = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_envelope(&mut stream, env).await?;
        read_envelope(&mut stream).await
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(res) => res,
        Err(_) => Err(MsgIoError::Timeout),
    }
}
