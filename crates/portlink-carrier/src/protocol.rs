//! The per-connection negotiation and streaming state machine.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use portlink_transport::{StreamAddr, StreamInterrupter, TwoWayStream};
use tracing::{debug, trace, warn};

use crate::carrier::Carrier;
use crate::error::{CarrierError, Result};
use crate::registry::CarrierRegistry;
use crate::route::Route;
use crate::state::ConnectionState;
use crate::wire::{SizedData, StreamWireReader, WireReader};

/// Greeting written to peers whose first 8 bytes match no carrier before
/// the connection is dropped.
const UNRECOGNIZED_GREETING: &[u8] = b"* Error. Protocol not found.\r\n\
* The first 8 bytes sent to a portlink port identify the carrier.\r\n\
* If you are a human, try typing \"CONNECT <port-name>\" followed by <RETURN>.\r\n\
* Goodbye.\r\n";

/// Lifecycle phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Stream attached, no handshake traffic yet.
    Setup,
    /// Our header is on the wire, awaiting the peer's response.
    HeaderSent,
    /// Handshake complete; no message has crossed yet.
    Negotiated,
    /// At least one message has crossed.
    Streaming,
    /// Connection torn down; only `close` is a no-op from here.
    Closed,
    /// An error made the connection unusable; it has been closed.
    Broken,
}

/// One live connection: a stream, a route, and the carrier negotiated to
/// drive it.
///
/// Construct with [`connect`](Protocol::connect) on the initiating side
/// or [`accept`](Protocol::accept) on the listening side; both return a
/// protocol already in the `Negotiated` phase or an error with the
/// stream closed. A connection is never left half-open.
pub struct Protocol {
    state: ConnectionState,
    carrier: Option<Box<dyn Carrier>>,
    phase: Phase,
    pending_ack: bool,
}

impl Protocol {
    /// Initiate: run the sender side of the handshake for `route` over
    /// `stream`, using the carrier `route` names.
    pub fn connect(
        route: Route,
        stream: Box<dyn TwoWayStream>,
        registry: &CarrierRegistry,
    ) -> Result<Self> {
        let carrier = registry.find(route.carrier_name())?;
        if !carrier.can_offer() {
            return Err(CarrierError::HandshakeFailed(format!(
                "carrier '{}' cannot initiate connections",
                carrier.name()
            )));
        }
        let mut proto = Self {
            state: ConnectionState::new(route, stream),
            carrier: Some(carrier),
            phase: Phase::Setup,
            pending_ack: false,
        };

        let outcome = proto
            .send_header()
            .and_then(|()| proto.expect_header_reply());
        if let Err(err) = outcome {
            warn!(route = %proto.state.route(), %err, "connect handshake failed");
            proto.mark_broken();
            return Err(err);
        }

        debug!(
            route = %proto.state.route(),
            carrier = proto.carrier_name().unwrap_or("?"),
            "connection negotiated"
        );
        Ok(proto)
    }

    /// Sender handshake, first half: identify ourselves on the wire.
    fn send_header(&mut self) -> Result<()> {
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        carrier.prepare_send(&mut self.state)?;
        carrier.send_header(&mut self.state)?;
        self.phase = Phase::HeaderSent;
        trace!(route = %self.state.route(), "header sent");
        Ok(())
    }

    /// Sender handshake, second half: the carrier may bootstrap-swap the
    /// stream here.
    fn expect_header_reply(&mut self) -> Result<()> {
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        carrier.expect_reply_to_header(&mut self.state)?;
        self.phase = Phase::Negotiated;
        Ok(())
    }

    /// Accept: sniff the first 8 bytes off `stream`, pick the carrier
    /// they identify, and run the receiver side of the handshake.
    ///
    /// Unrecognized prologues get a human-readable explanation before the
    /// connection is dropped.
    pub fn accept(
        stream: Box<dyn TwoWayStream>,
        registry: &CarrierRegistry,
        local_name: &str,
    ) -> Result<Self> {
        let mut state =
            ConnectionState::new(Route::new("<unknown>", local_name, "none"), stream);

        let mut header = [0u8; 8];
        if let Err(err) = read_header(&mut state, &mut header) {
            state.close();
            return Err(err);
        }

        let carrier = match registry.sniff(&header) {
            Some(carrier) => carrier,
            None => {
                debug!(?header, "unrecognized prologue; sending greeting");
                let _ = state.write_all(UNRECOGNIZED_GREETING);
                let _ = state.flush();
                state.close();
                return Err(CarrierError::UnrecognizedHeader(header));
            }
        };
        if !carrier.can_accept() {
            state.close();
            return Err(CarrierError::HandshakeFailed(format!(
                "carrier '{}' cannot accept connections",
                carrier.name()
            )));
        }

        state.set_route(
            state
                .route()
                .clone()
                .with_carrier(carrier.name().to_string()),
        );
        let mut proto = Self {
            state,
            carrier: Some(carrier),
            phase: Phase::Setup,
            pending_ack: false,
        };

        if let Err(err) = proto.respond_as_receiver(&header) {
            warn!(route = %proto.state.route(), %err, "accept handshake failed");
            proto.mark_broken();
            return Err(err);
        }

        debug!(
            route = %proto.state.route(),
            carrier = proto.carrier_name().unwrap_or("?"),
            "connection accepted"
        );
        Ok(proto)
    }

    /// Receiver handshake: learn who the sender is, then answer; the
    /// carrier may bootstrap-swap the stream here.
    fn respond_as_receiver(&mut self, header: &[u8; 8]) -> Result<()> {
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        carrier.consume_header_params(header);
        carrier.expect_sender_specifier(&mut self.state)?;
        carrier.respond_to_header(&mut self.state)?;
        self.phase = Phase::Negotiated;
        Ok(())
    }

    /// Send one fully-rendered message and collect the carrier's ack.
    pub fn write(&mut self, payload: &SizedData) -> Result<()> {
        self.ensure_active()?;
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        self.state.begin_packet();
        let outcome = match carrier.write(&mut self.state, payload) {
            Ok(()) => carrier.expect_ack(&mut self.state),
            Err(err) => Err(err),
        };
        self.state.end_packet();
        match outcome {
            Ok(()) => {
                self.phase = Phase::Streaming;
                Ok(())
            }
            Err(err) => {
                self.mark_broken();
                Err(err)
            }
        }
    }

    /// Send one message and parse the peer's reply with `parse`.
    ///
    /// Only meaningful on carriers that support replies; others fail
    /// without touching the wire.
    pub fn write_with_reply<T>(
        &mut self,
        payload: &SizedData,
        parse: impl FnOnce(&mut dyn WireReader) -> Result<T>,
    ) -> Result<T> {
        self.ensure_active()?;
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        if !carrier.supports_reply() {
            return Err(CarrierError::RepliesUnsupported(carrier.name()));
        }
        let text = carrier.is_text_mode();

        self.state.begin_packet();
        let outcome = (|| {
            carrier.write(&mut self.state, payload)?;
            let remaining = carrier.expect_index(&mut self.state)?;
            let mut reader = StreamWireReader::new(&mut self.state, text, remaining);
            let value = parse(&mut reader)?;
            carrier.expect_ack(&mut self.state)?;
            Ok(value)
        })();
        self.state.end_packet();
        match outcome {
            Ok(value) => {
                self.phase = Phase::Streaming;
                Ok(value)
            }
            Err(err) => {
                self.mark_broken();
                Err(err)
            }
        }
    }

    /// Receive one message, parsing its payload with `parse`.
    ///
    /// Leaves the ack pending: the caller must finish with
    /// [`end_read`](Protocol::end_read) (or [`reply`](Protocol::reply)
    /// then `end_read`) once it has consumed the message, so
    /// backpressure can be applied by delaying the ack.
    pub fn read_message<T>(
        &mut self,
        parse: impl FnOnce(&mut dyn WireReader) -> Result<T>,
    ) -> Result<T> {
        self.ensure_active()?;
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        let text = carrier.is_text_mode();
        self.state.begin_packet();
        let outcome = (|| {
            let remaining = carrier.expect_index(&mut self.state)?;
            let mut reader = StreamWireReader::new(&mut self.state, text, remaining);
            parse(&mut reader)
        })();
        match outcome {
            Ok(value) => {
                self.pending_ack = true;
                Ok(value)
            }
            Err(err) => {
                self.state.end_packet();
                self.mark_broken();
                Err(err)
            }
        }
    }

    /// Send a reply to the message currently being read.
    pub fn reply(&mut self, payload: &SizedData) -> Result<()> {
        self.ensure_active()?;
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        let outcome = carrier.write(&mut self.state, payload);
        if outcome.is_err() {
            self.mark_broken();
        }
        outcome
    }

    /// Acknowledge the message currently being read and close its packet.
    pub fn end_read(&mut self) -> Result<()> {
        self.ensure_active()?;
        let carrier = self
            .carrier
            .as_mut()
            .ok_or(CarrierError::ConnectionClosed)?;
        let outcome = carrier.send_ack(&mut self.state);
        self.pending_ack = false;
        self.state.end_packet();
        match outcome {
            Ok(()) => {
                self.phase = Phase::Streaming;
                Ok(())
            }
            Err(err) => {
                self.mark_broken();
                Err(err)
            }
        }
    }

    /// Unblock any read in flight on this connection, from any thread.
    pub fn interrupt_handle(&self) -> Arc<dyn StreamInterrupter> {
        self.state.interrupt_handle()
    }

    /// The peer's address, when the transport knows it.
    pub fn remote_address(&self) -> StreamAddr {
        self.state.remote_address()
    }

    /// Apply or clear a read timeout on the live stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.state.set_read_timeout(timeout)
    }

    /// Tear the connection down. Idempotent.
    ///
    /// If a received message was never acknowledged, a best-effort ack is
    /// sent first so a sender blocked on it is released.
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        if self.pending_ack {
            if let Some(carrier) = self.carrier.as_mut() {
                let _ = carrier.send_ack(&mut self.state);
            }
            self.pending_ack = false;
        }
        self.state.close();
        self.carrier = None;
        self.phase = Phase::Closed;
        debug!(route = %self.state.route(), "connection closed");
    }

    fn mark_broken(&mut self) {
        self.state.close();
        self.phase = Phase::Broken;
    }

    fn ensure_active(&self) -> Result<()> {
        match self.phase {
            Phase::Closed | Phase::Broken => Err(CarrierError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn route(&self) -> &Route {
        self.state.route()
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self.phase, Phase::Closed | Phase::Broken) && self.state.is_ok()
    }

    pub fn bootstrap_swapped(&self) -> bool {
        self.state.bootstrap_swapped()
    }

    pub fn carrier_name(&self) -> Option<&'static str> {
        self.carrier.as_ref().map(|c| c.name())
    }

    pub fn is_text_mode(&self) -> bool {
        self.carrier.as_ref().is_some_and(|c| c.is_text_mode())
    }

    pub fn requires_ack(&self) -> bool {
        self.carrier.as_ref().is_some_and(|c| c.requires_ack())
    }

    pub fn supports_reply(&self) -> bool {
        self.carrier.as_ref().is_some_and(|c| c.supports_reply())
    }

    pub fn is_local(&self) -> bool {
        self.carrier.as_ref().is_some_and(|c| c.is_local())
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("route", self.state.route())
            .field("carrier", &self.carrier_name())
            .field("phase", &self.phase)
            .finish()
    }
}

fn read_header(state: &mut ConnectionState, header: &mut [u8; 8]) -> Result<()> {
    match state.read_exact(header) {
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
    use crate::wire::BufferWireWriter;
    use crate::wire::WireWriter;
    use portlink_transport::pipe_pair;
    use std::io::BufRead;
    use std::thread;

    fn negotiate(carrier: &str) -> (Protocol, Protocol) {
        let registry = CarrierRegistry::with_defaults();
        let (init, acc) = pipe_pair("proto");
        let route = Route::new("/out", "/in", carrier);

        let connect_registry = CarrierRegistry::with_defaults();
        let handle = {
            let route = route.clone();
            // `local` needs both ends on one registry; everything else
            // does not care.
            let registry = if carrier == "local" {
                Arc::clone(&registry)
            } else {
                connect_registry
            };
            thread::spawn(move || Protocol::connect(route, Box::new(init), &registry))
        };
        let receiver = Protocol::accept(Box::new(acc), &registry, "/in").unwrap();
        let sender = handle.join().unwrap().unwrap();
        (sender, receiver)
    }

    fn render(values: &[i32]) -> SizedData {
        let mut writer = BufferWireWriter::new(false);
        for v in values {
            writer.append_int(*v).unwrap();
        }
        writer.into_sized_data()
    }

    #[test]
    fn sender_phases_advance_through_the_handshake() {
        let registry = CarrierRegistry::with_defaults();
        let (init, _peer) = pipe_pair("phases");
        let mut proto = Protocol {
            state: ConnectionState::new(Route::new("/out", "/in", "tcp"), Box::new(init)),
            carrier: Some(registry.find("tcp").unwrap()),
            phase: Phase::Setup,
            pending_ack: false,
        };
        assert_eq!(proto.phase(), Phase::Setup);
        proto.send_header().unwrap();
        assert_eq!(proto.phase(), Phase::HeaderSent);
        // tcp expects no reply to its header, so this completes at once.
        proto.expect_header_reply().unwrap();
        assert_eq!(proto.phase(), Phase::Negotiated);
    }

    #[test]
    fn tcp_negotiation_identifies_sender() {
        let (sender, receiver) = negotiate("tcp");
        assert_eq!(sender.phase(), Phase::Negotiated);
        assert_eq!(receiver.phase(), Phase::Negotiated);
        assert_eq!(receiver.route().from_name(), "/out");
        assert_eq!(receiver.carrier_name(), Some("tcp"));
        assert!(!sender.bootstrap_swapped());
    }

    #[test]
    fn message_crosses_with_ack() {
        let (mut sender, mut receiver) = negotiate("tcp");
        let payload = render(&[7, 8]);

        let reader = thread::spawn(move || {
            let values = receiver
                .read_message(|r| Ok((r.expect_int()?, r.expect_int()?)))
                .unwrap();
            receiver.end_read().unwrap();
            (values, receiver)
        });

        sender.write(&payload).unwrap();
        assert_eq!(sender.phase(), Phase::Streaming);
        let ((a, b), receiver) = reader.join().unwrap();
        assert_eq!((a, b), (7, 8));
        assert_eq!(receiver.phase(), Phase::Streaming);
    }

    #[test]
    fn fast_tcp_skips_the_ack() {
        let (mut sender, mut receiver) = negotiate("fast_tcp");
        assert!(!sender.requires_ack());
        // write returns without waiting on the receiver at all.
        sender.write(&render(&[1])).unwrap();
        let v = receiver.read_message(|r| r.expect_int()).unwrap();
        receiver.end_read().unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn reply_round_trip_over_tcp() {
        let (mut sender, mut receiver) = negotiate("tcp");

        let responder = thread::spawn(move || {
            let question = receiver.read_message(|r| r.expect_int()).unwrap();
            receiver.reply(&render(&[question * 2])).unwrap();
            receiver.end_read().unwrap();
            receiver
        });

        let answer = sender
            .write_with_reply(&render(&[21]), |r| r.expect_int())
            .unwrap();
        assert_eq!(answer, 42);
        responder.join().unwrap();
    }

    #[test]
    fn reply_on_fast_tcp_is_refused_before_io() {
        let (mut sender, _receiver) = negotiate("fast_tcp");
        let err = sender
            .write_with_reply(&render(&[1]), |r| r.expect_int())
            .unwrap_err();
        assert!(matches!(err, CarrierError::RepliesUnsupported("fast_tcp")));
        // The connection is still usable.
        assert!(sender.is_ok());
    }

    #[test]
    fn unrecognized_header_gets_greeting_then_eof() {
        let registry = CarrierRegistry::with_defaults();
        let (mut human, acc) = pipe_pair("human");

        let handle =
            thread::spawn(move || Protocol::accept(Box::new(acc), &registry, "/in"));

        std::io::Write::write_all(&mut human, b"HELLO?? \r\n").unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, CarrierError::UnrecognizedHeader(_)));

        let mut lines = std::io::BufReader::new(human);
        let mut first = String::new();
        lines.read_line(&mut first).unwrap();
        assert!(first.contains("Protocol not found"));
    }

    #[test]
    fn text_carrier_accepts_a_typed_connect_line() {
        let registry = CarrierRegistry::with_defaults();
        let (mut human, acc) = pipe_pair("typed");

        let handle =
            thread::spawn(move || Protocol::accept(Box::new(acc), &registry, "/in"));

        std::io::Write::write_all(&mut human, b"CONNECT /me\r\n").unwrap();
        let receiver = handle.join().unwrap().unwrap();
        assert_eq!(receiver.carrier_name(), Some("text"));
        assert_eq!(receiver.route().from_name(), "/me");
        assert!(receiver.is_text_mode());
    }

    #[test]
    fn local_carrier_swaps_to_pipe_exactly_once() {
        let (mut sender, mut receiver) = negotiate("local");
        assert!(sender.bootstrap_swapped());
        assert!(receiver.bootstrap_swapped());
        assert!(sender.is_local());

        let reader = thread::spawn(move || {
            let v = receiver.read_message(|r| r.expect_int()).unwrap();
            receiver.end_read().unwrap();
            v
        });
        sender.write(&render(&[99])).unwrap();
        assert_eq!(reader.join().unwrap(), 99);
    }

    #[test]
    fn close_is_idempotent_and_releases_pending_ack() {
        let (mut sender, mut receiver) = negotiate("tcp");

        let reader = thread::spawn(move || {
            let v = receiver.read_message(|r| r.expect_int()).unwrap();
            // Close without end_read; the pending ack must flow so the
            // sender is not stranded.
            receiver.close();
            receiver.close();
            v
        });

        sender.write(&render(&[5])).unwrap();
        assert_eq!(reader.join().unwrap(), 5);
        sender.close();
        sender.close();
        assert_eq!(sender.phase(), Phase::Closed);
        assert!(sender.write(&render(&[1])).is_err());
    }

    #[test]
    fn connect_failure_closes_the_stream() {
        let registry = CarrierRegistry::with_defaults();
        let (init, mut acc) = pipe_pair("refused");
        // Peer disappears before answering anything.
        acc.close();
        let err = Protocol::connect(
            Route::new("/out", "/in", "local"),
            Box::new(init),
            &registry,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CarrierError::Io(_) | CarrierError::HandshakeFailed(_) | CarrierError::ConnectionClosed
        ));
    }

    #[test]
    fn unknown_carrier_name_is_rejected_up_front() {
        let registry = CarrierRegistry::with_defaults();
        let (init, _acc) = pipe_pair("unknown");
        assert!(matches!(
            Protocol::connect(
                Route::new("/out", "/in", "warp_drive"),
                Box::new(init),
                &registry,
            )
            .unwrap_err(),
            CarrierError::UnknownCarrier(_)
        ));
    }
}
