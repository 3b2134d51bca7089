//! Frame codec: `[u32 LE body length][u32 LE magic][body]`.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::{Command, ProtocolError};

/// Magic word in every header.
pub const MAGIC: u32 = 0x1987;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Bodies up to this size reuse the session's scratch buffer.
pub const RECV_BUFSZ: usize = 8192;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length.
    pub len: u32,
    /// Magic word as received.
    pub magic: u32,
}

impl FrameHeader {
    /// Header for a body of `len` bytes.
    pub fn new(len: u32) -> Self {
        Self { len, magic: MAGIC }
    }

    /// Little-endian encoding.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0_u8; HEADER_LEN];
        let (len, magic) = out.split_at_mut(4);
        len.copy_from_slice(&self.len.to_le_bytes());
        magic.copy_from_slice(&self.magic.to_le_bytes());
        out
    }

    /// Decode eight header bytes.
    pub fn decode(raw: [u8; HEADER_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = raw;
        Self {
            len: u32::from_le_bytes([a, b, c, d]),
            magic: u32::from_le_bytes([e, f, g, h]),
        }
    }

    /// Whether the magic word matches.
    pub fn magic_ok(&self) -> bool {
        self.magic == MAGIC
    }
}

/// Serialize `message` and prepend a header.
///
/// # Errors
///
/// [`ProtocolError::Decode`] if serialization fails,
/// [`ProtocolError::FrameTooLarge`] if the body overflows a `u32` length.
pub fn encode_frame(message: &impl Serialize) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: u32::MAX,
        max: u32::MAX,
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN.saturating_add(body.len()));
    frame.extend_from_slice(&FrameHeader::new(len).encode());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode and write one message.
///
/// # Errors
///
/// Encoding failures and socket write errors.
pub async fn write_frame<W>(writer: &mut W, message: &impl Serialize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads headers and command bodies, reusing a small scratch buffer.
#[derive(Debug)]
pub struct FrameReader {
    scratch: Vec<u8>,
    max_body: u32,
}

impl FrameReader {
    /// Reader rejecting bodies above `max_body` bytes.
    pub fn new(max_body: u32) -> Self {
        Self {
            scratch: vec![0_u8; RECV_BUFSZ],
            max_body,
        }
    }

    /// Read the next header. `Ok(None)` on a clean EOF before any byte.
    ///
    /// A bad magic word is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// I/O failure, truncated header, or a body above the limit.
    pub async fn read_header<R>(&mut self, reader: &mut R) -> Result<Option<FrameHeader>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = [0_u8; HEADER_LEN];
        let first = reader.read(&mut raw).await?;
        if first == 0 {
            return Ok(None);
        }
        if let Some(rest) = raw.get_mut(first..) {
            reader.read_exact(rest).await?;
        }

        let header = FrameHeader::decode(raw);
        if !header.magic_ok() {
            warn!(magic = header.magic, expected = MAGIC, "bad frame magic, continuing");
        }
        if header.len > self.max_body {
            return Err(ProtocolError::FrameTooLarge {
                len: header.len,
                max: self.max_body,
            });
        }
        Ok(Some(header))
    }

    /// Read a body of `len` bytes and decode it as a [`Command`].
    ///
    /// # Errors
    ///
    /// I/O failure or an undecodable body.
    pub async fn read_command<R>(&mut self, reader: &mut R, len: u32) -> Result<Command, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let len = usize::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
            len,
            max: self.max_body,
        })?;

        if len <= self.scratch.len() {
            let body = self.scratch.get_mut(..len).ok_or(ProtocolError::FrameTooLarge {
                len: u32::MAX,
                max: u32::MAX,
            })?;
            reader.read_exact(body).await?;
            Ok(serde_json::from_slice(body)?)
        } else {
            let mut body = vec![0_u8; len];
            reader.read_exact(&mut body).await?;
            Ok(serde_json::from_slice(&body)?)
        }
    }
}
