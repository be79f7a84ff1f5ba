use std::io::{Read, Write};
use std::time::Duration;

use crate::addr::StreamAddr;

/// Handle that can unblock a read in flight on another thread.
///
/// Closing a connection must interrupt any blocked read before the stream
/// is released, so teardown never waits for a transport timeout to elapse.
/// Interrupters stay valid after the stream is gone; interrupting a closed
/// stream is a no-op.
pub trait StreamInterrupter: Send + Sync {
    fn interrupt(&self);
}

/// A bidirectional byte transport carrying one connection.
///
/// Implementations supply blocking `Read`/`Write`; the extra surface here
/// covers lifecycle (`close`, `is_ok`), logical packet boundaries so a
/// carrier can drop a partially-corrupted message without desynchronizing
/// the stream, addressing, and interruption for teardown.
///
/// `close` is idempotent. Any I/O after `close` returns an error rather
/// than undefined behavior.
pub trait TwoWayStream: Read + Write + Send {
    /// True while the stream is usable for I/O.
    fn is_ok(&self) -> bool;

    /// Shut the stream down. Safe to call more than once.
    fn close(&mut self);

    /// Mark the start of an atomic logical unit.
    fn begin_packet(&mut self) {}

    /// Mark the end of an atomic logical unit.
    fn end_packet(&mut self) {}

    fn local_address(&self) -> StreamAddr {
        StreamAddr::invalid()
    }

    fn remote_address(&self) -> StreamAddr {
        StreamAddr::invalid()
    }

    /// Apply a read timeout, if the transport supports one.
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> std::io::Result<()> {
        Ok(())
    }

    /// Obtain a handle that unblocks reads from another thread.
    fn interrupter(&self) -> Box<dyn StreamInterrupter>;
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "stream closed")
}

/// A stream that is never OK.
///
/// Used as the safe default wherever a connection has not attached a real
/// stream yet; every I/O call fails cleanly.
#[derive(Debug, Default)]
pub struct NullStream;

impl Read for NullStream {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(closed_error())
    }
}

impl Write for NullStream {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(closed_error())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Err(closed_error())
    }
}

struct NullInterrupter;

impl StreamInterrupter for NullInterrupter {
    fn interrupt(&self) {}
}

impl TwoWayStream for NullStream {
    fn is_ok(&self) -> bool {
        false
    }

    fn close(&mut self) {}

    fn interrupter(&self) -> Box<dyn StreamInterrupter> {
        Box::new(NullInterrupter)
    }
}
