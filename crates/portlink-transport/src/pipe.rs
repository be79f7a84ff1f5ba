use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::addr::StreamAddr;
use crate::stream::{StreamInterrupter, TwoWayStream};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct Channel {
    buf: VecDeque<u8>,
    closed: bool,
}

struct Shared {
    state: Mutex<Channel>,
    readable: Condvar,
    writable: Condvar,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Channel::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    fn close(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// One end of an in-process byte pipe pair.
///
/// Reads drain this end's incoming channel; writes feed the peer's.
/// This is the stream a `local` carrier bootstraps into once both sides
/// of a connection turn out to live in the same process.
pub struct PipeStream {
    incoming: Arc<Shared>,
    outgoing: Arc<Shared>,
    tag: String,
}

/// Create a cross-connected pair of in-process pipe streams.
pub fn pipe_pair(tag: &str) -> (PipeStream, PipeStream) {
    let a = Shared::new();
    let b = Shared::new();
    (
        PipeStream {
            incoming: Arc::clone(&a),
            outgoing: Arc::clone(&b),
            tag: format!("{tag}.a"),
        },
        PipeStream {
            incoming: b,
            outgoing: a,
            tag: format!("{tag}.b"),
        },
    )
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self
            .incoming
            .state
            .lock()
            .map_err(|_| std::io::Error::other("pipe lock poisoned"))?;
        while state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            state = self
                .incoming
                .readable
                .wait(state)
                .map_err(|_| std::io::Error::other("pipe lock poisoned"))?;
        }
        let n = buf.len().min(state.buf.len());
        for slot in buf.iter_mut().take(n) {
            // VecDeque guarantees a front element for the first n pops.
            *slot = state.buf.pop_front().unwrap_or(0);
        }
        self.incoming.writable.notify_all();
        Ok(n)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self
            .outgoing
            .state
            .lock()
            .map_err(|_| std::io::Error::other("pipe lock poisoned"))?;
        loop {
            if state.closed {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                ));
            }
            if state.buf.len() < PIPE_CAPACITY {
                break;
            }
            state = self
                .outgoing
                .writable
                .wait(state)
                .map_err(|_| std::io::Error::other("pipe lock poisoned"))?;
        }
        let room = PIPE_CAPACITY - state.buf.len();
        let n = buf.len().min(room);
        state.buf.extend(&buf[..n]);
        self.outgoing.readable.notify_all();
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct PipeInterrupter {
    incoming: Arc<Shared>,
    outgoing: Arc<Shared>,
}

impl StreamInterrupter for PipeInterrupter {
    fn interrupt(&self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

impl TwoWayStream for PipeStream {
    fn is_ok(&self) -> bool {
        match self.incoming.state.lock() {
            Ok(state) => !state.closed,
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        self.incoming.close();
        self.outgoing.close();
    }

    fn local_address(&self) -> StreamAddr {
        StreamAddr::invalid()
    }

    fn interrupter(&self) -> Box<dyn StreamInterrupter> {
        Box::new(PipeInterrupter {
            incoming: Arc::clone(&self.incoming),
            outgoing: Arc::clone(&self.outgoing),
        })
    }
}

impl std::fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeStream").field("tag", &self.tag).finish()
    }
}
