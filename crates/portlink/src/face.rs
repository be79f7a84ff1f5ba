use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use portlink_carrier::{CarrierRegistry, Protocol};
use portlink_transport::{StreamAddr, StreamInterrupter, TcpTransport, TwoWayStream};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Ceiling on how long an inbound handshake may sit idle before the
/// negotiation read gives up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One in-flight (or finished) handshake thread.
struct Negotiation {
    interrupter: Arc<dyn StreamInterrupter>,
    done: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// The accepting side of a port: a TCP listener plus an accept thread.
///
/// Every accepted stream is negotiated on its own thread through the
/// shared carrier registry, so a slow or hostile handshake never blocks
/// the accept loop or existing connections. Negotiated connections are
/// handed to the owner's callback; failed handshakes are logged and
/// dropped. A peer that stalls mid-handshake is cut off by a read
/// timeout, or immediately when the face closes.
pub struct Face {
    address: StreamAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    negotiations: Arc<Mutex<Vec<Negotiation>>>,
}

impl Face {
    /// Bind on `host:port` (port 0 picks an ephemeral port) and start
    /// accepting for the port named `local_name`.
    pub fn open(
        host: &str,
        port: u16,
        local_name: &str,
        registry: Arc<CarrierRegistry>,
        on_connection: impl Fn(Protocol) + Send + Sync + 'static,
    ) -> Result<Self> {
        let transport = TcpTransport::bind(host, port)?;
        let address = transport.local_address();
        info!(name = local_name, %address, "port face listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let local_name = local_name.to_string();
        let on_connection = Arc::new(on_connection);
        let negotiations: Arc<Mutex<Vec<Negotiation>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_negotiations = Arc::clone(&negotiations);

        let accept_thread = std::thread::Builder::new()
            .name("portlink-face".to_string())
            .spawn(move || loop {
                let stream = match transport.accept() {
                    Ok(stream) => stream,
                    Err(err) => {
                        if !accept_shutdown.load(Ordering::SeqCst) {
                            warn!(%err, "face accept failed");
                        }
                        break;
                    }
                };
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let registry = Arc::clone(&registry);
                let local_name = local_name.clone();
                let on_connection = Arc::clone(&on_connection);
                let interrupter: Arc<dyn StreamInterrupter> = Arc::from(stream.interrupter());
                let done = Arc::new(AtomicBool::new(false));
                let thread_done = Arc::clone(&done);
                let spawned = std::thread::Builder::new()
                    .name("portlink-negotiate".to_string())
                    .spawn(move || {
                        // A peer that trickles or abandons its header must
                        // not pin this thread forever.
                        let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
                        let outcome =
                            Protocol::accept(Box::new(stream), &registry, &local_name);
                        thread_done.store(true, Ordering::SeqCst);
                        match outcome {
                            Ok(protocol) => {
                                let _ = protocol.set_read_timeout(None);
                                debug!(remote = %protocol.remote_address(), "inbound connection negotiated");
                                on_connection(protocol);
                            }
                            Err(err) => debug!(%err, "inbound handshake rejected"),
                        }
                    });
                match spawned {
                    Ok(thread) => {
                        let mut pending = match accept_negotiations.lock() {
                            Ok(pending) => pending,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        pending.push(Negotiation {
                            interrupter,
                            done,
                            thread,
                        });
                    }
                    Err(err) => warn!(%err, "cannot spawn negotiation thread"),
                }
            })?;

        Ok(Self {
            address,
            shutdown,
            accept_thread: Some(accept_thread),
            negotiations,
        })
    }

    /// The socket address this face is reachable on.
    pub fn address(&self) -> &StreamAddr {
        &self.address
    }

    /// Stop accepting, cut off any handshake still in flight, and join
    /// every thread this face spawned. Idempotent.
    pub fn close(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Poke the listener so the blocked accept returns.
        if let Ok(addr) = format!("{}:{}", self.address.host(), self.address.port()).parse() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        // The accept thread is gone, so the negotiation list is final.
        let pending = {
            let mut pending = match self.negotiations.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *pending)
        };
        for negotiation in &pending {
            if !negotiation.done.load(Ordering::SeqCst) {
                negotiation.interrupter.interrupt();
            }
        }
        for negotiation in pending {
            let _ = negotiation.thread.join();
        }
    }
}

impl Drop for Face {
    fn drop(&mut self) {
        self.close();
    }
}
