//! Length-prefixed frame codec.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! byte 0-1:  command length, 2 ASCII decimal digits, zero-padded ("00".."99")
//! byte 2-6:  payload length, 5 ASCII decimal digits, zero-padded ("00000".."99999")
//! byte 7..:  command bytes (exactly command length bytes)
//! byte ..:   payload bytes (exactly payload length bytes)
//! ```
//!
//! There is no checksum, terminator or version field. Example: `WHO` with an
//! empty payload is encoded as `0300000WHO`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed ASCII header
pub const HEADER_LEN: usize = 7;

/// Width of the command length field
const COMMAND_DIGITS: usize = 2;

/// Largest command length the header can express
pub const MAX_COMMAND_LEN: usize = 99;

/// Largest payload length the header can express
pub const MAX_PAYLOAD_LEN: usize = 99_999;

/// Command asking the server to identify itself
pub const CMD_WHO: &str = "WHO";

/// Command carrying a test payload
pub const CMD_TEST: &str = "TEST";

/// Acknowledgement text naming a received payload size. Sent by the server
/// for each TEST request and by the client for each TEST push.
pub fn test_ack(size: usize) -> String {
    format!("TEST received with data size {size}")
}

/// Codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("command length {0} exceeds 99 bytes")]
    InvalidCommandLength(usize),

    #[error("payload length {0} exceeds 99999 bytes")]
    InvalidPayloadLength(usize),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recognized commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Identity request
    Who,
    /// Payload exchange
    Test,
    /// Syntactically valid but unknown command
    Unrecognized(String),
}

impl Command {
    /// Exact, case-sensitive match on the decoded command string.
    pub fn parse(command: &str) -> Self {
        match command {
            CMD_WHO => Command::Who,
            CMD_TEST => Command::Test,
            other => Command::Unrecognized(other.to_string()),
        }
    }
}

/// One complete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// A response frame: empty command, text payload.
    pub fn text(message: impl Into<String>) -> Self {
        Self::new(String::new(), message.into())
    }

    /// A `TEST` frame carrying `size` filler bytes.
    pub fn filler(size: usize) -> Self {
        Self::new(CMD_TEST, vec![b'x'; size])
    }

    /// Decoded command of this frame.
    pub fn kind(&self) -> Command {
        Command::parse(&self.command)
    }

    /// Payload interpreted as text (lossy).
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode this frame into wire bytes.
    pub fn encode(&self) -> Result<BytesMut, FrameError> {
        encode(&self.command, &self.payload)
    }
}

/// Build `header || command || payload`.
pub fn encode(command: &str, payload: &[u8]) -> Result<BytesMut, FrameError> {
    if command.len() > MAX_COMMAND_LEN {
        return Err(FrameError::InvalidCommandLength(command.len()));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::InvalidPayloadLength(payload.len()));
    }

    let header = format!("{:02}{:05}", command.len(), payload.len());
    debug_assert_eq!(header.len(), HEADER_LEN);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + command.len() + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(command.as_bytes());
    buf.put_slice(payload);
    Ok(buf)
}

/// Parse the 7-byte header into `(command_length, payload_length)`.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(usize, usize), FrameError> {
    let command_len = parse_digits(&header[..COMMAND_DIGITS])?;
    let payload_len = parse_digits(&header[COMMAND_DIGITS..])?;
    Ok((command_len, payload_len))
}

/// Fixed-width decimal field. Signs and whitespace are rejected.
fn parse_digits(field: &[u8]) -> Result<usize, FrameError> {
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::Framing(format!(
            "invalid length field {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    Ok(field
        .iter()
        .fold(0usize, |acc, digit| acc * 10 + usize::from(digit - b'0')))
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed cleanly before sending any header
/// byte. Short reads are looped over until each field is complete.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let received = fill(reader, &mut header).await?;
    if received == 0 {
        return Ok(None);
    }
    if received < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            received,
        });
    }

    let (command_len, payload_len) = parse_header(&header)?;

    let command = read_field(reader, command_len).await?;
    let command = match String::from_utf8(command) {
        Ok(s) if s.is_ascii() => s,
        _ => return Err(FrameError::Framing("command is not ASCII".to_string())),
    };

    let payload = read_field(reader, payload_len).await?;

    Ok(Some(Frame {
        command,
        payload: Bytes::from(payload),
    }))
}

/// Encode and send one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly `len` bytes or fail with `Truncated`.
async fn read_field<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    let received = fill(reader, &mut buf).await?;
    if received < len {
        return Err(FrameError::Truncated {
            expected: len,
            received,
        });
    }
    Ok(buf)
}

/// Read until `buf` is full or the stream ends. Returns bytes read.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
