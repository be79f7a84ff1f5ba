//! Byte-level payload boundary between envelope code and carriers.
//!
//! Envelope types never touch the stream directly: they render into a
//! [`WireWriter`] and parse out of a [`WireReader`]. A carrier decides
//! whether those calls speak the compact binary convention or the
//! human-typable text convention.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};

use crate::error::{CarrierError, Result};

/// Hard cap on a single text-mode line, to bound memory on a hostile peer.
const MAX_LINE: usize = 8192;

/// Control-integer framing: two sync bytes, the value, two closing bytes.
/// Misframed control traffic is detected immediately instead of being
/// silently reinterpreted.
const FRAME_HEAD: &[u8; 2] = b"PL";
const FRAME_TAIL: &[u8; 2] = b"NK";

/// Write one framed control integer (8 bytes on the wire).
pub fn write_framed_int(writer: &mut dyn Write, value: i32) -> Result<()> {
    let mut frame = [0u8; 8];
    frame[..2].copy_from_slice(FRAME_HEAD);
    frame[2..6].copy_from_slice(&value.to_le_bytes());
    frame[6..].copy_from_slice(FRAME_TAIL);
    writer.write_all(&frame)?;
    Ok(())
}

/// Read one framed control integer, verifying the sync bytes.
pub fn read_framed_int(reader: &mut dyn Read) -> Result<i32> {
    let mut frame = [0u8; 8];
    read_exact_or_closed(reader, &mut frame)?;
    if &frame[..2] != FRAME_HEAD || &frame[6..] != FRAME_TAIL {
        return Err(CarrierError::ProtocolViolation(format!(
            "bad control frame {frame:02x?}"
        )));
    }
    Ok(i32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]))
}

/// Read one `\n`-terminated line, stripping the terminator and any `\r`.
pub fn read_line(reader: &mut dyn Read) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Err(CarrierError::ConnectionClosed);
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(CarrierError::ProtocolViolation(format!(
                "line exceeds {MAX_LINE} bytes"
            )));
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| CarrierError::ProtocolViolation("non-UTF-8 text line".to_string()))
}

fn read_exact_or_closed(reader: &mut dyn Read, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(CarrierError::ConnectionClosed)
        }
        Err(err) => Err(err.into()),
    }
}

/// Incoming payload view handed to envelope parsing code.
pub trait WireReader {
    /// Fill `buf` exactly from the payload.
    fn expect_block(&mut self, buf: &mut [u8]) -> Result<()>;

    fn expect_int(&mut self) -> Result<i32>;

    fn expect_float(&mut self) -> Result<f64>;

    fn expect_text(&mut self) -> Result<String>;

    /// True when the peer negotiated a text-mode carrier, so payloads
    /// arrive as typed lines rather than binary records.
    fn is_text_mode(&self) -> bool;
}

/// Outgoing payload sink for envelope rendering code.
pub trait WireWriter {
    /// True when rendering for a text-mode carrier.
    fn is_text_mode(&self) -> bool;

    fn append_block(&mut self, data: &[u8]) -> Result<()>;

    fn append_int(&mut self, value: i32) -> Result<()>;

    fn append_float(&mut self, value: f64) -> Result<()>;

    fn append_text(&mut self, text: &str) -> Result<()>;
}

/// [`WireReader`] over a live stream, bounded by the declared block sizes
/// of the message being read.
pub struct StreamWireReader<'a> {
    inner: &'a mut dyn Read,
    text: bool,
    remaining: Option<usize>,
}

impl<'a> StreamWireReader<'a> {
    pub fn new(inner: &'a mut dyn Read, text: bool, remaining: Option<usize>) -> Self {
        Self {
            inner,
            text,
            remaining,
        }
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        if let Some(remaining) = self.remaining.as_mut() {
            if n > *remaining {
                return Err(CarrierError::ProtocolViolation(format!(
                    "payload read of {n} bytes overruns declared size"
                )));
            }
            *remaining -= n;
        }
        Ok(())
    }
}

impl WireReader for StreamWireReader<'_> {
    fn expect_block(&mut self, buf: &mut [u8]) -> Result<()> {
        self.consume(buf.len())?;
        read_exact_or_closed(self.inner, buf)
    }

    fn expect_int(&mut self) -> Result<i32> {
        if self.text {
            let line = read_line(self.inner)?;
            return line.trim().parse().map_err(|_| {
                CarrierError::ProtocolViolation(format!("expected integer, got '{line}'"))
            });
        }
        let mut raw = [0u8; 4];
        self.expect_block(&mut raw)?;
        Ok(i32::from_le_bytes(raw))
    }

    fn expect_float(&mut self) -> Result<f64> {
        if self.text {
            let line = read_line(self.inner)?;
            return line.trim().parse().map_err(|_| {
                CarrierError::ProtocolViolation(format!("expected float, got '{line}'"))
            });
        }
        let mut raw = [0u8; 8];
        self.expect_block(&mut raw)?;
        Ok(f64::from_le_bytes(raw))
    }

    fn expect_text(&mut self) -> Result<String> {
        if self.text {
            return read_line(self.inner);
        }
        let len = self.expect_int()?;
        if len < 0 || len as usize > MAX_LINE {
            return Err(CarrierError::ProtocolViolation(format!(
                "unreasonable text length {len}"
            )));
        }
        let mut raw = vec![0u8; len as usize];
        self.expect_block(&mut raw)?;
        String::from_utf8(raw)
            .map_err(|_| CarrierError::ProtocolViolation("non-UTF-8 text".to_string()))
    }

    fn is_text_mode(&self) -> bool {
        self.text
    }
}

/// [`WireWriter`] that renders into memory, producing a [`SizedData`].
///
/// Messages are rendered exactly once per wire mode; the resulting blocks
/// are replayed onto each connection without re-rendering.
pub struct BufferWireWriter {
    text: bool,
    buf: BytesMut,
    blocks: Vec<Bytes>,
}

impl BufferWireWriter {
    pub fn new(text: bool) -> Self {
        Self {
            text,
            buf: BytesMut::new(),
            blocks: Vec::new(),
        }
    }

    /// Finish rendering and take the accumulated blocks.
    pub fn into_sized_data(mut self) -> SizedData {
        if !self.buf.is_empty() {
            self.blocks.push(self.buf.split().freeze());
        }
        SizedData {
            blocks: self.blocks,
        }
    }
}

impl WireWriter for BufferWireWriter {
    fn is_text_mode(&self) -> bool {
        self.text
    }

    fn append_block(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn append_int(&mut self, value: i32) -> Result<()> {
        if self.text {
            self.buf.extend_from_slice(value.to_string().as_bytes());
            self.buf.extend_from_slice(b"\r\n");
        } else {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn append_float(&mut self, value: f64) -> Result<()> {
        if self.text {
            self.buf.extend_from_slice(value.to_string().as_bytes());
            self.buf.extend_from_slice(b"\r\n");
        } else {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn append_text(&mut self, text: &str) -> Result<()> {
        if self.text {
            self.buf.extend_from_slice(text.as_bytes());
            self.buf.extend_from_slice(b"\r\n");
        } else {
            self.append_int(text.len() as i32)?;
            self.buf.extend_from_slice(text.as_bytes());
        }
        Ok(())
    }
}

/// A fully-rendered message: an ordered list of byte blocks plus their
/// total size, cheap to clone and replay across many connections.
#[derive(Debug, Clone, Default)]
pub struct SizedData {
    blocks: Vec<Bytes>,
}

impl SizedData {
    pub fn push_block(&mut self, block: Bytes) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[Bytes] {
        &self.blocks
    }

    pub fn total_len(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}
