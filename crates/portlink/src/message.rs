//! The message boundary between ports and the wire.
//!
//! Ports move anything implementing [`Portable`]; [`Bundle`] is the
//! default self-describing envelope of primitive values, enough for
//! command channels, tests, and driving a port from a terminal.

use portlink_carrier::{
    BufferWireWriter, CarrierError, SizedData, WireReader, WireWriter,
};

/// Sanity cap on values per bundle.
const MAX_VALUES: i32 = 4096;

const TAG_INT: i32 = 1;
const TAG_FLOAT: i32 = 2;
const TAG_TEXT: i32 = 3;
const TAG_BLOB: i32 = 4;

/// A value that can cross a port connection.
///
/// `write_to` is called exactly once per message per wire mode; the
/// rendered bytes are replayed to every peer in that mode.
pub trait Portable {
    fn write_to(&self, writer: &mut dyn WireWriter) -> portlink_carrier::Result<()>;

    fn read_from(&mut self, reader: &mut dyn WireReader) -> portlink_carrier::Result<()>;
}

/// One primitive value in a [`Bundle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Ordered list of primitive values, self-describing on the wire.
///
/// Binary rendering is a count followed by tagged records; text
/// rendering is a single typable line (`1 2.5 "hi"`). Blobs have no
/// text rendering and fail rather than silently corrupting the line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bundle {
    values: Vec<Value>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_int(&mut self, value: i32) -> &mut Self {
        self.values.push(Value::Int(value));
        self
    }

    pub fn push_float(&mut self, value: f64) -> &mut Self {
        self.values.push(Value::Float(value));
        self
    }

    pub fn push_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.values.push(Value::Text(text.into()));
        self
    }

    pub fn push_blob(&mut self, blob: impl Into<Vec<u8>>) -> &mut Self {
        self.values.push(Value::Blob(blob.into()));
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn render_line(&self) -> portlink_carrier::Result<String> {
        let mut tokens = Vec::with_capacity(self.values.len());
        for value in &self.values {
            tokens.push(match value {
                Value::Int(v) => v.to_string(),
                // Keep a decimal point so the token reads back as a float.
                Value::Float(v) if v.fract() == 0.0 && v.is_finite() => format!("{v:.1}"),
                Value::Float(v) => v.to_string(),
                Value::Text(t) => quote(t),
                Value::Blob(_) => {
                    return Err(CarrierError::ProtocolViolation(
                        "blob values have no text rendering".to_string(),
                    ))
                }
            });
        }
        Ok(tokens.join(" "))
    }

    fn parse_line(line: &str) -> portlink_carrier::Result<Vec<Value>> {
        let mut values = Vec::new();
        for token in tokenize(line)? {
            values.push(match token {
                Token::Quoted(text) => Value::Text(text),
                Token::Bare(word) => {
                    if let Ok(i) = word.parse::<i32>() {
                        Value::Int(i)
                    } else if let Ok(f) = word.parse::<f64>() {
                        Value::Float(f)
                    } else {
                        Value::Text(word)
                    }
                }
            });
        }
        Ok(values)
    }
}

impl Portable for Bundle {
    fn write_to(&self, writer: &mut dyn WireWriter) -> portlink_carrier::Result<()> {
        if writer.is_text_mode() {
            return writer.append_text(&self.render_line()?);
        }
        writer.append_int(self.values.len() as i32)?;
        for value in &self.values {
            match value {
                Value::Int(v) => {
                    writer.append_int(TAG_INT)?;
                    writer.append_int(*v)?;
                }
                Value::Float(v) => {
                    writer.append_int(TAG_FLOAT)?;
                    writer.append_float(*v)?;
                }
                Value::Text(t) => {
                    writer.append_int(TAG_TEXT)?;
                    writer.append_text(t)?;
                }
                Value::Blob(b) => {
                    writer.append_int(TAG_BLOB)?;
                    writer.append_int(b.len() as i32)?;
                    writer.append_block(b)?;
                }
            }
        }
        Ok(())
    }

    fn read_from(&mut self, reader: &mut dyn WireReader) -> portlink_carrier::Result<()> {
        self.values.clear();
        if reader.is_text_mode() {
            let line = reader.expect_text()?;
            self.values = Self::parse_line(&line)?;
            return Ok(());
        }
        let count = reader.expect_int()?;
        if !(0..=MAX_VALUES).contains(&count) {
            return Err(CarrierError::ProtocolViolation(format!(
                "unreasonable value count {count}"
            )));
        }
        for _ in 0..count {
            let tag = reader.expect_int()?;
            self.values.push(match tag {
                TAG_INT => Value::Int(reader.expect_int()?),
                TAG_FLOAT => Value::Float(reader.expect_float()?),
                TAG_TEXT => Value::Text(reader.expect_text()?),
                TAG_BLOB => {
                    let len = reader.expect_int()?;
                    if len < 0 {
                        return Err(CarrierError::ProtocolViolation(format!(
                            "negative blob length {len}"
                        )));
                    }
                    let mut blob = vec![0u8; len as usize];
                    reader.expect_block(&mut blob)?;
                    Value::Blob(blob)
                }
                other => {
                    return Err(CarrierError::ProtocolViolation(format!(
                        "unknown value tag {other}"
                    )))
                }
            });
        }
        Ok(())
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

enum Token {
    Bare(String),
    Quoted(String),
}

fn tokenize(line: &str) -> portlink_carrier::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => {
                            return Err(CarrierError::ProtocolViolation(
                                "dangling escape in quoted text".to_string(),
                            ))
                        }
                    },
                    Some('"') => break,
                    Some(other) => text.push(other),
                    None => {
                        return Err(CarrierError::ProtocolViolation(
                            "unterminated quoted text".to_string(),
                        ))
                    }
                }
            }
            tokens.push(Token::Quoted(text));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Bare(word));
        }
    }
    Ok(tokens)
}

/// A message captured once and replayable to any number of peers.
///
/// Each needed wire mode is rendered exactly once, synchronously, inside
/// the port's `write` call; later mutation of the source message cannot
/// affect what peers receive.
#[derive(Debug, Clone, Default)]
pub struct RecordedMessage {
    binary: Option<SizedData>,
    text: Option<SizedData>,
}

impl RecordedMessage {
    pub fn record(
        message: &dyn Portable,
        need_binary: bool,
        need_text: bool,
    ) -> portlink_carrier::Result<Self> {
        let mut recorded = Self::default();
        if need_binary {
            let mut writer = BufferWireWriter::new(false);
            message.write_to(&mut writer)?;
            recorded.binary = Some(writer.into_sized_data());
        }
        if need_text {
            let mut writer = BufferWireWriter::new(true);
            message.write_to(&mut writer)?;
            recorded.text = Some(writer.into_sized_data());
        }
        Ok(recorded)
    }

    /// The rendering for a peer in the given mode, if it was captured.
    pub fn for_mode(&self, text: bool) -> Option<&SizedData> {
        if text {
            self.text.as_ref()
        } else {
            self.binary.as_ref()
        }
    }
}
