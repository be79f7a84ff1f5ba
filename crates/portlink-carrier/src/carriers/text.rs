use std::io::Write;

use crate::carrier::Carrier;
use crate::error::Result;
use crate::state::ConnectionState;
use crate::wire::{read_line, SizedData};

/// Human-typable line-oriented carrier.
///
/// A person can drive a port from a terminal: the prologue doubles as a
/// command line (`CONNECT /name`), messages are typed lines, and there is
/// no binary framing at all. `text` fires and forgets; `text_ack` waits
/// for an acknowledgement line after every message and supports replies.
#[derive(Debug, Clone)]
pub struct TextCarrier {
    ack: bool,
}

impl TextCarrier {
    pub fn new() -> Self {
        Self { ack: false }
    }

    pub fn with_ack() -> Self {
        Self { ack: true }
    }
}

impl Default for TextCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Carrier for TextCarrier {
    fn name(&self) -> &'static str {
        if self.ack {
            "text_ack"
        } else {
            "text"
        }
    }

    fn fresh(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn header(&self) -> [u8; 8] {
        if self.ack {
            *b"CONNACK "
        } else {
            *b"CONNECT "
        }
    }

    fn requires_ack(&self) -> bool {
        self.ack
    }

    fn supports_reply(&self) -> bool {
        self.ack
    }

    fn is_text_mode(&self) -> bool {
        true
    }

    fn can_escape(&self) -> bool {
        false
    }

    fn send_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        // The prologue and the sender name form one typable command line.
        let line = format!(
            "{}{}\r\n",
            std::str::from_utf8(&self.header()).unwrap_or("CONNECT "),
            state.route().from_name()
        );
        state.write_all(line.as_bytes())?;
        state.flush()?;
        Ok(())
    }

    fn expect_sender_specifier(&mut self, state: &mut ConnectionState) -> Result<()> {
        // The prologue's 8 bytes are already consumed; the rest of the
        // line is the sender's name.
        let rest = read_line(state)?;
        let name = rest.trim();
        if !name.is_empty() {
            state.rename_from(name);
        }
        Ok(())
    }

    fn send_index(&mut self, _state: &mut ConnectionState, _payload: &SizedData) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, state: &mut ConnectionState, payload: &SizedData) -> Result<()> {
        for block in payload.blocks() {
            state.write_all(block)?;
        }
        state.flush()?;
        Ok(())
    }

    fn expect_index(&mut self, _state: &mut ConnectionState) -> Result<Option<usize>> {
        Ok(None)
    }

    fn send_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        if self.ack {
            state.write_all(b"<ACK>\r\n")?;
            state.flush()?;
        }
        Ok(())
    }

    fn expect_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        if self.ack {
            let _ = read_line(state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use portlink_transport::pipe_pair;
    use std::io::Read;

    fn paired_states(carrier: &str) -> (ConnectionState, ConnectionState) {
        let (a, b) = pipe_pair("text");
        (
            ConnectionState::new(Route::new("/typer", "/sink", carrier), Box::new(a)),
            ConnectionState::new(Route::new("<unknown>", "/sink", carrier), Box::new(b)),
        )
    }

    #[test]
    fn header_is_a_typable_command_line() {
        let (mut tx, mut rx) = paired_states("text");
        TextCarrier::new().send_header(&mut tx).unwrap();

        let mut header = [0u8; 8];
        rx.read_exact(&mut header).unwrap();
        assert_eq!(&header, b"CONNECT ");
        let mut rest = TextCarrier::new();
        rest.expect_sender_specifier(&mut rx).unwrap();
        assert_eq!(rx.route().from_name(), "/typer");
    }

    #[test]
    fn write_sends_raw_lines_without_framing() {
        let (mut tx, mut rx) = paired_states("text");
        let mut payload = SizedData::default();
        payload.push_block(bytes::Bytes::from_static(b"hello world\r\n"));
        TextCarrier::new().write(&mut tx, &payload).unwrap();

        assert_eq!(read_line(&mut rx).unwrap(), "hello world");
    }

    #[test]
    fn ack_variant_exchanges_an_ack_line() {
        let (mut tx, mut rx) = paired_states("text_ack");
        let mut receiver = TextCarrier::with_ack();
        let mut sender = TextCarrier::with_ack();

        receiver.send_ack(&mut rx).unwrap();
        sender.expect_ack(&mut tx).unwrap();
    }

    #[test]
    fn plain_variant_never_acks() {
        let (mut tx, _rx) = paired_states("text");
        // Nothing written, nothing read; would block otherwise.
        TextCarrier::new().send_ack(&mut tx).unwrap();
        TextCarrier::new().expect_ack(&mut tx).unwrap();
    }

    #[test]
    fn capabilities() {
        let text = TextCarrier::new();
        assert!(text.is_text_mode());
        assert!(!text.can_escape());
        assert!(!text.requires_ack());
        assert!(!text.supports_reply());

        let ack = TextCarrier::with_ack();
        assert!(ack.requires_ack());
        assert!(ack.supports_reply());
        assert_ne!(text.header(), ack.header());
    }
}
