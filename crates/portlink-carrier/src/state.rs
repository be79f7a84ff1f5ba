use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use portlink_transport::{StreamAddr, StreamInterrupter, TwoWayStream};
use tracing::debug;

use crate::error::{CarrierError, Result};
use crate::route::Route;

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "no stream attached")
}

/// Single-owner slot for a connection's live stream.
///
/// At most one stream is attached at a time. `take` removes it for a
/// swap, leaving the slot empty; `give` installs a replacement. I/O on
/// an empty slot fails with `NotConnected` rather than blocking.
#[derive(Default)]
pub struct ShiftStream {
    slot: Option<Box<dyn TwoWayStream>>,
}

impl ShiftStream {
    pub fn new(stream: Box<dyn TwoWayStream>) -> Self {
        Self { slot: Some(stream) }
    }

    /// Remove the attached stream, if any.
    ///
    /// Named to stay clear of `Read::take`, which method resolution would
    /// otherwise pick for a by-value receiver.
    pub fn take_stream(&mut self) -> Option<Box<dyn TwoWayStream>> {
        self.slot.take()
    }

    /// Attach a stream, dropping any previous occupant.
    pub fn give(&mut self, stream: Box<dyn TwoWayStream>) {
        if let Some(mut old) = self.slot.replace(stream) {
            old.close();
        }
    }

    pub fn is_ok(&self) -> bool {
        self.slot.as_ref().is_some_and(|s| s.is_ok())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.slot.as_mut() {
            stream.close();
        }
    }

    pub fn stream(&self) -> Option<&dyn TwoWayStream> {
        self.slot.as_deref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut (dyn TwoWayStream + 'static)> {
        self.slot.as_deref_mut()
    }
}

impl Read for ShiftStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.slot.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(not_connected()),
        }
    }
}

impl Write for ShiftStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.slot.as_mut() {
            Some(stream) => stream.write(buf),
            None => Err(not_connected()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.slot.as_mut() {
            Some(stream) => stream.flush(),
            None => Err(not_connected()),
        }
    }
}

/// Mutable state of one live connection: its [`Route`], its stream slot,
/// and an interrupter kept current across the bootstrap swap.
pub struct ConnectionState {
    route: Route,
    shift: ShiftStream,
    interrupter: Arc<dyn StreamInterrupter>,
    swapped: bool,
}

impl ConnectionState {
    pub fn new(route: Route, stream: Box<dyn TwoWayStream>) -> Self {
        let interrupter: Arc<dyn StreamInterrupter> = Arc::from(stream.interrupter());
        Self {
            route,
            shift: ShiftStream::new(stream),
            interrupter,
            swapped: false,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    /// Fill in the sender name once the peer has identified itself.
    pub fn rename_from(&mut self, from: &str) {
        self.route = self.route.clone().with_from(from);
    }

    /// Replace the bootstrap stream with the carrier's real stream.
    ///
    /// Allowed exactly once per connection. The old stream is closed and
    /// released before the replacement becomes visible; the interrupt
    /// handle is refreshed so teardown targets the live stream.
    pub fn bootstrap(&mut self, stream: Box<dyn TwoWayStream>) -> Result<()> {
        if self.swapped {
            return Err(CarrierError::ProtocolViolation(
                "stream already swapped on this connection".to_string(),
            ));
        }
        debug!(route = %self.route, "bootstrapping onto replacement stream");
        if let Some(mut old) = self.shift.take_stream() {
            old.close();
            drop(old);
        }
        self.interrupter = Arc::from(stream.interrupter());
        self.shift.give(stream);
        self.swapped = true;
        Ok(())
    }

    pub fn bootstrap_swapped(&self) -> bool {
        self.swapped
    }

    pub fn begin_packet(&mut self) {
        if let Some(stream) = self.shift.stream_mut() {
            stream.begin_packet();
        }
    }

    pub fn end_packet(&mut self) {
        if let Some(stream) = self.shift.stream_mut() {
            stream.end_packet();
        }
    }

    pub fn is_ok(&self) -> bool {
        self.shift.is_ok()
    }

    pub fn close(&mut self) {
        self.shift.close();
    }

    /// Handle that unblocks any read in flight on this connection.
    pub fn interrupt_handle(&self) -> Arc<dyn StreamInterrupter> {
        Arc::clone(&self.interrupter)
    }

    pub fn remote_address(&self) -> StreamAddr {
        self.shift
            .stream()
            .map(|s| s.remote_address())
            .unwrap_or_else(StreamAddr::invalid)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self.shift.stream() {
            Some(stream) => stream.set_read_timeout(timeout),
            None => Ok(()),
        }
    }
}

impl Read for ConnectionState {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.shift.read(buf)
    }
}

impl Write for ConnectionState {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.shift.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.shift.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portlink_transport::pipe_pair;

    fn state_with_pipe() -> (ConnectionState, portlink_transport::PipeStream) {
        let (near, far) = pipe_pair("state");
        (
            ConnectionState::new(Route::new("/a", "/b", "tcp"), Box::new(near)),
            far,
        )
    }

    #[test]
    fn empty_shift_slot_fails_io() {
        let mut shift = ShiftStream::default();
        assert!(!shift.is_ok());
        assert!(shift.read(&mut [0u8; 1]).is_err());
        assert!(shift.write(b"x").is_err());
    }

    #[test]
    fn take_stream_empties_the_slot() {
        let (near, _far) = pipe_pair("take");
        let mut shift = ShiftStream::new(Box::new(near));
        let taken = shift.take_stream();
        assert!(taken.is_some_and(|s| s.is_ok()));
        assert!(shift.take_stream().is_none());
        assert!(!shift.is_ok());
        assert!(shift.read(&mut [0u8; 1]).is_err());
    }

    #[test]
    fn io_flows_through_attached_stream() {
        let (mut state, mut far) = state_with_pipe();
        state.write_all(b"abc").unwrap();
        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(state.is_ok());
    }

    #[test]
    fn bootstrap_swaps_exactly_once() {
        let (mut state, _far) = state_with_pipe();
        assert!(!state.bootstrap_swapped());

        let (new_near, mut new_far) = pipe_pair("swap");
        state.bootstrap(Box::new(new_near)).unwrap();
        assert!(state.bootstrap_swapped());

        // Traffic now flows on the replacement stream.
        state.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        new_far.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        // A second swap is a protocol violation.
        let (again, _) = pipe_pair("again");
        assert!(matches!(
            state.bootstrap(Box::new(again)).unwrap_err(),
            CarrierError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn bootstrap_closes_the_old_stream() {
        let (mut state, mut far) = state_with_pipe();
        let (new_near, _new_far) = pipe_pair("swap2");
        state.bootstrap(Box::new(new_near)).unwrap();
        // Old stream's peer now observes EOF.
        assert_eq!(far.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn interrupt_handle_targets_live_stream_after_swap() {
        let (mut state, _far) = state_with_pipe();
        let (new_near, _keep) = pipe_pair("swap3");
        state.bootstrap(Box::new(new_near)).unwrap();
        state.interrupt_handle().interrupt();
        assert!(!state.is_ok());
    }

    #[test]
    fn rename_from_updates_route() {
        let (mut state, _far) = state_with_pipe();
        state.rename_from("/talker");
        assert_eq!(state.route().from_name(), "/talker");
    }
}
