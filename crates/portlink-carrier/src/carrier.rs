//! The carrier strategy trait and the default handshake steps shared by
//! header-based binary carriers.

use std::io::{Read, Write};

use tracing::trace;

use crate::error::{CarrierError, Result};
use crate::state::ConnectionState;
use crate::wire::{read_framed_int, write_framed_int, SizedData};

/// Upper bound on blocks in one message index; anything larger is taken
/// as stream desynchronization, not a real message.
const MAX_INDEX_BLOCKS: i32 = 128;

/// Upper bound on a declared sender name, same reasoning.
const MAX_NAME_LEN: i32 = 1024;

/// One wire protocol: its identity, capabilities, and handshake steps.
///
/// A registered carrier acts as a prototype; [`fresh`](Carrier::fresh)
/// clones it for each connection so per-connection handshake state never
/// leaks between connections. Default method bodies implement the common
/// header-based binary convention; carriers override only what differs.
pub trait Carrier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Clone this prototype into a per-connection instance.
    fn fresh(&self) -> Box<dyn Carrier>;

    /// The 8-byte prologue this carrier sends first on every connection.
    fn header(&self) -> [u8; 8];

    /// Whether an incoming 8-byte prologue belongs to this carrier.
    fn check_header(&self, header: &[u8; 8]) -> bool {
        *header == self.header()
    }

    /// Absorb any per-connection parameters encoded in the prologue.
    fn consume_header_params(&mut self, _header: &[u8; 8]) {}

    // Capabilities.

    fn is_connectionless(&self) -> bool {
        false
    }

    fn requires_ack(&self) -> bool {
        false
    }

    fn supports_reply(&self) -> bool {
        false
    }

    fn is_text_mode(&self) -> bool {
        false
    }

    fn can_escape(&self) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        false
    }

    fn can_accept(&self) -> bool {
        true
    }

    fn can_offer(&self) -> bool {
        true
    }

    /// Push carriers stream sender-to-receiver; a reverse (pull) carrier
    /// would override this.
    fn is_push(&self) -> bool {
        true
    }

    // Sender-side handshake.

    /// Pre-handshake setup on the initiating side.
    fn prepare_send(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    /// Send the prologue and sender identification.
    fn send_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        default_send_header(self.header(), state)
    }

    /// React to the receiver's response; bootstrap carriers swap streams
    /// here.
    fn expect_reply_to_header(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    /// Announce the shape of the next message.
    fn send_index(&mut self, state: &mut ConnectionState, payload: &SizedData) -> Result<()> {
        default_send_index(state, payload)
    }

    /// Send one full message: index then payload blocks.
    fn write(&mut self, state: &mut ConnectionState, payload: &SizedData) -> Result<()> {
        self.send_index(state, payload)?;
        default_write_blocks(state, payload)
    }

    /// Collect the receiver's acknowledgement, when this carrier uses
    /// them.
    fn expect_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        if self.requires_ack() {
            default_expect_ack(state)?;
        }
        Ok(())
    }

    // Receiver-side handshake.

    /// Learn who is connecting; fills in the route's source name.
    fn expect_sender_specifier(&mut self, state: &mut ConnectionState) -> Result<()> {
        default_expect_sender_specifier(state)
    }

    /// Answer the prologue; bootstrap carriers create and hand over the
    /// replacement stream here.
    fn respond_to_header(&mut self, _state: &mut ConnectionState) -> Result<()> {
        Ok(())
    }

    /// Read the next message's shape. `Ok(None)` means this carrier does
    /// not declare sizes in advance.
    fn expect_index(&mut self, state: &mut ConnectionState) -> Result<Option<usize>> {
        default_expect_index(state)
    }

    /// Acknowledge the message just consumed, when this carrier uses
    /// acks.
    fn send_ack(&mut self, state: &mut ConnectionState) -> Result<()> {
        if self.requires_ack() {
            default_send_ack(state)?;
        }
        Ok(())
    }
}

/// Prologue, then the sender name as a length-prefixed string.
pub fn default_send_header(header: [u8; 8], state: &mut ConnectionState) -> Result<()> {
    state.write_all(&header)?;
    let from = state.route().from_name().to_string();
    state.write_all(&(from.len() as i32).to_le_bytes())?;
    state.write_all(from.as_bytes())?;
    state.flush()?;
    trace!(route = %state.route(), "sent carrier header");
    Ok(())
}

/// Read the sender's length-prefixed name and rename the route's source.
pub fn default_expect_sender_specifier(state: &mut ConnectionState) -> Result<()> {
    let mut raw = [0u8; 4];
    read_exact_or_closed(state, &mut raw)?;
    let len = i32::from_le_bytes(raw);
    if !(0..=MAX_NAME_LEN).contains(&len) {
        return Err(CarrierError::ProtocolViolation(format!(
            "unreasonable sender name length {len}"
        )));
    }
    let mut name = vec![0u8; len as usize];
    read_exact_or_closed(state, &mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| CarrierError::ProtocolViolation("non-UTF-8 sender name".to_string()))?;
    state.rename_from(&name);
    trace!(route = %state.route(), "sender identified");
    Ok(())
}

/// Block count as a framed control int, then each block's size as a
/// plain int.
pub fn default_send_index(state: &mut ConnectionState, payload: &SizedData) -> Result<()> {
    write_framed_int(state, payload.blocks().len() as i32)?;
    for block in payload.blocks() {
        state.write_all(&(block.len() as i32).to_le_bytes())?;
    }
    Ok(())
}

/// Counterpart of [`default_send_index`]; returns the total payload size.
pub fn default_expect_index(state: &mut ConnectionState) -> Result<Option<usize>> {
    let count = read_framed_int(state)?;
    if !(0..=MAX_INDEX_BLOCKS).contains(&count) {
        return Err(CarrierError::ProtocolViolation(format!(
            "unreasonable block count {count}"
        )));
    }
    let mut total = 0usize;
    for _ in 0..count {
        let mut raw = [0u8; 4];
        read_exact_or_closed(state, &mut raw)?;
        let len = i32::from_le_bytes(raw);
        if len < 0 {
            return Err(CarrierError::ProtocolViolation(format!(
                "negative block size {len}"
            )));
        }
        total += len as usize;
    }
    Ok(Some(total))
}

pub fn default_write_blocks(state: &mut ConnectionState, payload: &SizedData) -> Result<()> {
    for block in payload.blocks() {
        state.write_all(block)?;
    }
    state.flush()?;
    Ok(())
}

/// An ack is a framed control int; its value is read and discarded, so
/// the two ends only agree on when acks flow, not what they carry.
pub fn default_send_ack(state: &mut ConnectionState) -> Result<()> {
    write_framed_int(state, 0)?;
    state.flush()?;
    Ok(())
}

pub fn default_expect_ack(state: &mut ConnectionState) -> Result<()> {
    let _ = read_framed_int(state)?;
    Ok(())
}

fn read_exact_or_closed(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(CarrierError::ConnectionClosed)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use bytes::Bytes;
    use portlink_transport::pipe_pair;

    fn paired_states() -> (ConnectionState, ConnectionState) {
        let (a, b) = pipe_pair("carrier");
        (
            ConnectionState::new(Route::new("/src", "/dst", "tcp"), Box::new(a)),
            ConnectionState::new(Route::new("<unknown>", "/dst", "tcp"), Box::new(b)),
        )
    }

    #[test]
    fn header_and_specifier_identify_sender() {
        let (mut tx, mut rx) = paired_states();
        let writer = std::thread::spawn(move || {
            default_send_header(*b"PLNKtcp\0", &mut tx).unwrap();
            tx
        });

        let mut header = [0u8; 8];
        rx.read_exact(&mut header).unwrap();
        assert_eq!(&header, b"PLNKtcp\0");
        default_expect_sender_specifier(&mut rx).unwrap();
        assert_eq!(rx.route().from_name(), "/src");
        writer.join().unwrap();
    }

    #[test]
    fn index_round_trip_reports_total_size() {
        let (mut tx, mut rx) = paired_states();
        let mut payload = SizedData::default();
        payload.push_block(Bytes::from_static(b"abcd"));
        payload.push_block(Bytes::from_static(b"efg"));

        let writer = std::thread::spawn(move || {
            default_send_index(&mut tx, &payload).unwrap();
            tx.flush().unwrap();
        });
        assert_eq!(default_expect_index(&mut rx).unwrap(), Some(7));
        writer.join().unwrap();
    }

    #[test]
    fn absurd_block_count_is_a_violation() {
        let (mut tx, mut rx) = paired_states();
        write_framed_int(&mut tx, 100_000).unwrap();
        tx.flush().unwrap();
        assert!(matches!(
            default_expect_index(&mut rx).unwrap_err(),
            CarrierError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn ack_value_is_discarded() {
        let (mut tx, mut rx) = paired_states();
        write_framed_int(&mut tx, 12345).unwrap();
        tx.flush().unwrap();
        default_expect_ack(&mut rx).unwrap();
    }
}
