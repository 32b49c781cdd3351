//! Length-prefixed request and response frames for the chat protocol.
//!
//! A request is a 4-byte big-endian content length followed by the body.
//! A response is a 2-byte big-endian status code, a 4-byte big-endian
//! content length, then the body. Declared lengths are always honoured.

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use std::fmt;
use std::io;

pub const CHAT_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2p-chat/1.0.0");

/// Largest body either side will accept.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to read frame header")]
    ReadHeader(#[source] io::Error),

    #[error("failed to read frame body")]
    ReadBody(#[source] io::Error),

    #[error("failed to write frame header")]
    WriteHeader(#[source] io::Error),

    #[error("failed to write frame body")]
    WriteBody(#[source] io::Error),

    #[error("frame body too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ReadHeader(e)
            | FrameError::ReadBody(e)
            | FrameError::WriteHeader(e)
            | FrameError::WriteBody(e) => e,
            err @ FrameError::TooLarge { .. } => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const FORBIDDEN: Status = Status(403);

    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    pub const fn code(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chat message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    body: Vec<u8>,
}

impl RequestFrame {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into() }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

/// Acknowledgment for a [`RequestFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    status: Status,
    body: Vec<u8>,
}

impl ResponseFrame {
    /// Empty `200` acknowledgment.
    pub fn ok() -> Self {
        Self::with_status(Status::OK)
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

pub async fn read_request<T>(io: &mut T) -> Result<RequestFrame, FrameError>
where
    T: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    io.read_exact(&mut header)
        .await
        .map_err(FrameError::ReadHeader)?;
    let body = read_body(io, u32::from_be_bytes(header) as usize).await?;
    Ok(RequestFrame { body })
}

pub async fn write_request<T>(io: &mut T, frame: &RequestFrame) -> Result<(), FrameError>
where
    T: AsyncWrite + Unpin,
{
    let length = checked_length(frame.body.len())?;
    io.write_all(&length.to_be_bytes())
        .await
        .map_err(FrameError::WriteHeader)?;
    write_body(io, &frame.body).await
}

pub async fn read_response<T>(io: &mut T) -> Result<ResponseFrame, FrameError>
where
    T: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    io.read_exact(&mut header)
        .await
        .map_err(FrameError::ReadHeader)?;
    let status = Status(u16::from_be_bytes([header[0], header[1]]));
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let body = read_body(io, length).await?;
    Ok(ResponseFrame { status, body })
}

pub async fn write_response<T>(io: &mut T, frame: &ResponseFrame) -> Result<(), FrameError>
where
    T: AsyncWrite + Unpin,
{
    let length = checked_length(frame.body.len())?;
    let mut header = [0u8; 6];
    header[..2].copy_from_slice(&frame.status.0.to_be_bytes());
    header[2..].copy_from_slice(&length.to_be_bytes());
    io.write_all(&header)
        .await
        .map_err(FrameError::WriteHeader)?;
    write_body(io, &frame.body).await
}

async fn read_body<T>(io: &mut T, length: usize) -> Result<Vec<u8>, FrameError>
where
    T: AsyncRead + Unpin,
{
    if length > MAX_BODY_SIZE {
        return Err(FrameError::TooLarge {
            size: length,
            max: MAX_BODY_SIZE,
        });
    }
    let mut body = vec![0u8; length];
    io.read_exact(&mut body).await.map_err(FrameError::ReadBody)?;
    Ok(body)
}

async fn write_body<T>(io: &mut T, body: &[u8]) -> Result<(), FrameError>
where
    T: AsyncWrite + Unpin,
{
    io.write_all(body).await.map_err(FrameError::WriteBody)?;
    io.flush().await.map_err(FrameError::WriteBody)
}

fn checked_length(size: usize) -> Result<u32, FrameError> {
    if size > MAX_BODY_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_BODY_SIZE,
        });
    }
    Ok(size as u32)
}

#[derive(Default, Clone)]
pub struct ChatCodec;

#[async_trait]
impl request_response::Codec for ChatCodec {
    type Protocol = StreamProtocol;
    type Request = RequestFrame;
    type Response = ResponseFrame;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<RequestFrame>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(read_request(io).await?)
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<ResponseFrame>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(read_response(io).await?)
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        frame: RequestFrame,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(write_request(io, &frame).await?)
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        frame: ResponseFrame,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(write_response(io, &frame).await?)
    }
}
