use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use portlink_transport::{pipe_pair, PipeStream};
use tracing::debug;

use crate::carrier::{self, Carrier};
use crate::error::{CarrierError, Result};
use crate::state::ConnectionState;

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process meeting point where the two ends of a `local` connection
/// exchange a pipe end.
///
/// The receiver creates a pipe pair, offers one end under the key the
/// sender announced in its header, and bootstraps onto the other; the
/// sender takes its end and bootstraps too. Both ends of a connection
/// must share the same rendezvous (in practice, the same registry).
pub struct PipeRendezvous {
    slots: Mutex<HashMap<String, PipeStream>>,
    ready: Condvar,
    counter: AtomicU64,
}

impl PipeRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            counter: AtomicU64::new(0),
        })
    }

    fn next_key(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("local.{n}")
    }

    fn offer(&self, key: &str, stream: PipeStream) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CarrierError::HandshakeFailed("rendezvous lock poisoned".to_string()))?;
        slots.insert(key.to_string(), stream);
        self.ready.notify_all();
        Ok(())
    }

    fn take(&self, key: &str, timeout: Duration) -> Result<PipeStream> {
        let deadline = Instant::now() + timeout;
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CarrierError::HandshakeFailed("rendezvous lock poisoned".to_string()))?;
        loop {
            if let Some(stream) = slots.remove(key) {
                return Ok(stream);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CarrierError::HandshakeFailed(format!(
                    "no pipe offered for rendezvous key '{key}'"
                )));
            }
            let (guard, result) = self
                .ready
                .wait_timeout(slots, remaining)
                .map_err(|_| CarrierError::HandshakeFailed("rendezvous lock poisoned".to_string()))?;
            slots = guard;
            if result.timed_out() && !slots.contains_key(key) {
                return Err(CarrierError::HandshakeFailed(format!(
                    "no pipe offered for rendezvous key '{key}'"
                )));
            }
        }
    }
}

/// Carrier that detects same-process connections and bootstraps off the
/// network onto an in-process pipe pair.
///
/// The handshake still runs over the initial stream; only after both
/// sides agree does traffic move to the pipe. The initial stream is
/// closed at the swap, never used again.
pub struct LocalCarrier {
    rendezvous: Arc<PipeRendezvous>,
    key: Option<String>,
}

impl LocalCarrier {
    pub fn new(rendezvous: Arc<PipeRendezvous>) -> Self {
        Self {
            rendezvous,
            key: None,
        }
    }
}

impl Carrier for LocalCarrier {
    fn name(&self) -> &'static str {
        "local"
    }

    fn fresh(&self) -> Box<dyn Carrier> {
        Box::new(Self {
            rendezvous: Arc::clone(&self.rendezvous),
            key: None,
        })
    }

    fn header(&self) -> [u8; 8] {
        *b"PLNKloc\0"
    }

    fn requires_ack(&self) -> bool {
        true
    }

    fn supports_reply(&self) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        true
    }

    fn prepare_send(&mut self, _state: &mut ConnectionState) -> Result<()> {
        self.key = Some(self.rendezvous.next_key());
        Ok(())
    }

    fn send_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        carrier::default_send_header(self.header(), state)?;
        let key = self
            .key
            .clone()
            .ok_or_else(|| CarrierError::HandshakeFailed("no rendezvous key".to_string()))?;
        state.write_all(&(key.len() as i32).to_le_bytes())?;
        state.write_all(key.as_bytes())?;
        state.flush()?;
        Ok(())
    }

    fn expect_sender_specifier(&mut self, state: &mut ConnectionState) -> Result<()> {
        carrier::default_expect_sender_specifier(state)?;
        // The rendezvous key follows, same length-prefixed encoding.
        let mut raw = [0u8; 4];
        std::io::Read::read_exact(state, &mut raw)
            .map_err(|_| CarrierError::ConnectionClosed)?;
        let len = i32::from_le_bytes(raw);
        if !(1..=256).contains(&len) {
            return Err(CarrierError::ProtocolViolation(format!(
                "bad rendezvous key length {len}"
            )));
        }
        let mut key = vec![0u8; len as usize];
        std::io::Read::read_exact(state, &mut key)
            .map_err(|_| CarrierError::ConnectionClosed)?;
        let key = String::from_utf8(key)
            .map_err(|_| CarrierError::ProtocolViolation("non-UTF-8 rendezvous key".to_string()))?;
        self.key = Some(key);
        Ok(())
    }

    fn respond_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| CarrierError::HandshakeFailed("no rendezvous key".to_string()))?;
        // Offer the sender its pipe end first, then swap; the sender is
        // already waiting on the rendezvous, so ordering here cannot
        // deadlock.
        let (sender_end, receiver_end) = pipe_pair(&key);
        self.rendezvous.offer(&key, sender_end)?;
        debug!(route = %state.route(), %key, "local connection detected; swapping to pipe");
        state.bootstrap(Box::new(receiver_end))
    }

    fn expect_reply_to_header(&mut self, state: &mut ConnectionState) -> Result<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| CarrierError::HandshakeFailed("no rendezvous key".to_string()))?;
        let pipe = self.rendezvous.take(&key, RENDEZVOUS_TIMEOUT)?;
        state.bootstrap(Box::new(pipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use std::io::{Read, Write};

    #[test]
    fn rendezvous_hands_over_offered_pipe() {
        let rendezvous = PipeRendezvous::new();
        let (a, _b) = pipe_pair("slot");
        rendezvous.offer("k1", a).unwrap();
        rendezvous.take("k1", Duration::from_millis(100)).unwrap();
        // A second take for the same key times out.
        assert!(rendezvous.take("k1", Duration::from_millis(50)).is_err());
    }

    #[test]
    fn rendezvous_take_waits_for_a_late_offer() {
        let rendezvous = PipeRendezvous::new();
        let offerer = Arc::clone(&rendezvous);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let (a, _b) = pipe_pair("late");
            offerer.offer("k2", a).unwrap();
        });
        rendezvous.take("k2", Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn keys_are_unique() {
        let rendezvous = PipeRendezvous::new();
        let k1 = rendezvous.next_key();
        let k2 = rendezvous.next_key();
        assert_ne!(k1, k2);
    }

    #[test]
    fn handshake_bootstraps_both_ends_onto_one_pipe() {
        let rendezvous = PipeRendezvous::new();
        let (init, acc) = pipe_pair("local-hs");
        let mut tx_state = ConnectionState::new(Route::new("/a", "/b", "local"), Box::new(init));
        let mut rx_state =
            ConnectionState::new(Route::new("<unknown>", "/b", "local"), Box::new(acc));

        let mut tx_carrier = LocalCarrier::new(Arc::clone(&rendezvous));
        let mut rx_carrier = LocalCarrier::new(Arc::clone(&rendezvous));

        let sender = std::thread::spawn(move || {
            tx_carrier.prepare_send(&mut tx_state).unwrap();
            tx_carrier.send_header(&mut tx_state).unwrap();
            tx_carrier.expect_reply_to_header(&mut tx_state).unwrap();
            tx_state
        });

        let mut header = [0u8; 8];
        rx_state.read_exact(&mut header).unwrap();
        assert_eq!(&header, b"PLNKloc\0");
        rx_carrier.expect_sender_specifier(&mut rx_state).unwrap();
        rx_carrier.respond_to_header(&mut rx_state).unwrap();

        let mut tx_state = sender.join().unwrap();
        assert!(tx_state.bootstrap_swapped());
        assert!(rx_state.bootstrap_swapped());
        assert_eq!(rx_state.route().from_name(), "/a");

        // Traffic now crosses the pipe.
        tx_state.write_all(b"over the pipe").unwrap();
        let mut buf = [0u8; 13];
        rx_state.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"over the pipe");
    }

    #[test]
    fn sender_times_out_when_nothing_is_offered() {
        let rendezvous = PipeRendezvous::new();
        assert!(matches!(
            rendezvous.take("nobody", Duration::from_millis(50)).unwrap_err(),
            CarrierError::HandshakeFailed(_)
        ));
    }
}
