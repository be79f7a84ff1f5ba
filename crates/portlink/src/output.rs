use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use portlink_carrier::{CarrierRegistry, Protocol, Route};
use portlink_name::{Contact, NameSpace};
use portlink_transport::{StreamInterrupter, TcpTransport};
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::error::{PortError, Result};
use crate::message::{Portable, RecordedMessage};

/// Depth of the hand-off channel to the background writer.
const BACKGROUND_QUEUE: usize = 16;

/// One live outgoing connection.
struct OutputRecord {
    target: String,
    carrier: String,
    protocol: Protocol,
}

/// Summary of one outgoing connection, for inspection and tests.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub route: Route,
    pub text_mode: bool,
    pub swapped: bool,
}

/// The sending side of a port: a named set of outgoing connections with
/// fan-out delivery.
///
/// `write` renders the message exactly once per wire mode and replays
/// the bytes to every connection. A connection that fails mid-write is
/// dropped and logged; the remaining connections still receive the
/// message. With background writes enabled, `write` hands the rendered
/// message to a dedicated writer thread through a bounded channel and
/// returns once it is queued.
pub struct OutputPort {
    name: String,
    config: PortConfig,
    registry: Arc<CarrierRegistry>,
    namespace: Arc<dyn NameSpace>,
    records: Arc<Mutex<Vec<OutputRecord>>>,
    // Interrupt handles for every connection ever added, kept outside the
    // records lock so close() can unblock a writer that holds it. Stale
    // handles are harmless: interrupting a closed stream is a no-op.
    interrupters: Vec<Arc<dyn StreamInterrupter>>,
    writer: Option<BackgroundWriter>,
    closed: bool,
}

struct BackgroundWriter {
    sender: mpsc::SyncSender<RecordedMessage>,
    thread: JoinHandle<()>,
}

impl OutputPort {
    pub fn open(
        name: &str,
        config: PortConfig,
        registry: Arc<CarrierRegistry>,
        namespace: Arc<dyn NameSpace>,
    ) -> Result<Self> {
        let records: Arc<Mutex<Vec<OutputRecord>>> = Arc::new(Mutex::new(Vec::new()));

        let writer = if config.background_write() {
            let (sender, receiver) = mpsc::sync_channel::<RecordedMessage>(BACKGROUND_QUEUE);
            let worker_records = Arc::clone(&records);
            let port_name = name.to_string();
            let thread = std::thread::Builder::new()
                .name("portlink-writer".to_string())
                .spawn(move || {
                    while let Ok(recorded) = receiver.recv() {
                        broadcast(&worker_records, &recorded);
                    }
                    debug!(port = %port_name, "background writer stopped");
                })?;
            Some(BackgroundWriter { sender, thread })
        } else {
            None
        };

        info!(name, "output port open");
        Ok(Self {
            name: name.to_string(),
            config,
            registry,
            namespace,
            records,
            interrupters: Vec::new(),
            writer,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect this port to `target`, an input port name known to the
    /// name space or a literal `host:port`.
    ///
    /// On any failure (resolution, connect, handshake) the existing
    /// connection set is left unchanged.
    pub fn add_output(&mut self, target: &str, carrier: Option<&str>) -> Result<()> {
        if self.closed {
            return Err(PortError::Closed);
        }
        let contact = self.resolve(target)?;
        let carrier = carrier
            .map(str::to_string)
            .or_else(|| {
                let hint = contact.carrier();
                (!hint.is_empty()).then(|| hint.to_string())
            })
            .unwrap_or_else(|| self.config.carrier().to_string());

        {
            let records = lock(&self.records);
            if records
                .iter()
                .any(|r| r.target == target && r.carrier == carrier)
            {
                return Err(PortError::AlreadyConnected(target.to_string()));
            }
        }

        let stream = TcpTransport::connect(contact.host(), contact.port())?;
        let route = Route::new(self.name.clone(), target, carrier.clone());
        let protocol = Protocol::connect(route, Box::new(stream), &self.registry)?;
        info!(port = %self.name, target, %carrier, "output connected");

        self.interrupters.push(protocol.interrupt_handle());
        lock(&self.records).push(OutputRecord {
            target: target.to_string(),
            carrier,
            protocol,
        });
        Ok(())
    }

    /// Disconnect from `target`, closing every connection to it.
    pub fn remove_output(&mut self, target: &str) -> Result<()> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain_mut(|record| {
            if record.target == target {
                record.protocol.close();
                false
            } else {
                true
            }
        });
        if records.len() == before {
            return Err(PortError::NoSuchConnection(target.to_string()));
        }
        Ok(())
    }

    /// Send `message` to every connection.
    ///
    /// No connections is not an error; the message is simply dropped.
    pub fn write(&mut self, message: &dyn Portable) -> Result<()> {
        if self.closed {
            return Err(PortError::Closed);
        }
        let (need_binary, need_text) = self.needed_modes();
        if !need_binary && !need_text {
            return Ok(());
        }
        let recorded = RecordedMessage::record(message, need_binary, need_text)?;
        match &self.writer {
            Some(writer) => writer
                .sender
                .send(recorded)
                .map_err(|_| PortError::Closed)?,
            None => broadcast(&self.records, &recorded),
        }
        Ok(())
    }

    /// Send `message` and parse one peer's reply into `reply`.
    ///
    /// The reply comes from the first connection whose carrier supports
    /// replies; remaining connections receive the message without one.
    /// Always synchronous, regardless of the background-write setting.
    pub fn write_with_reply(
        &mut self,
        message: &dyn Portable,
        reply: &mut dyn Portable,
    ) -> Result<()> {
        if self.closed {
            return Err(PortError::Closed);
        }
        let (need_binary, need_text) = self.needed_modes();
        let recorded = RecordedMessage::record(message, need_binary, need_text)?;

        let mut records = lock(&self.records);
        if !records.iter().any(|r| r.protocol.supports_reply()) {
            return Err(PortError::RepliesUnsupported);
        }

        let mut replied = false;
        let mut outcome = Ok(());
        records.retain_mut(|record| {
            let Some(data) = recorded.for_mode(record.protocol.is_text_mode()) else {
                return true;
            };
            let result = if !replied && record.protocol.supports_reply() {
                replied = true;
                record
                    .protocol
                    .write_with_reply(data, |reader| reply.read_from(reader))
            } else {
                record.protocol.write(data)
            };
            match result {
                Ok(()) => true,
                Err(err) => {
                    warn!(route = %record.protocol.route(), %err, "dropping failed connection");
                    if replied && outcome.is_ok() {
                        outcome = Err(PortError::Carrier(err));
                    }
                    false
                }
            }
        });
        outcome
    }

    /// Snapshot of the current connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        lock(&self.records)
            .iter()
            .map(|record| ConnectionInfo {
                route: record.protocol.route().clone(),
                text_mode: record.protocol.is_text_mode(),
                swapped: record.protocol.bootstrap_swapped(),
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.records).len()
    }

    /// Close every connection and stop the background writer. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(writer) = self.writer.take() {
            // The writer thread may be blocked mid-send on a peer that is
            // withholding its ack, with the records lock held; unblock it
            // through the lock-free handles before waiting on it.
            for interrupter in &self.interrupters {
                interrupter.interrupt();
            }
            // Dropping the sender ends the writer's receive loop.
            drop(writer.sender);
            let _ = writer.thread.join();
        }
        let mut records = lock(&self.records);
        for record in records.iter_mut() {
            record.protocol.close();
        }
        records.clear();
        info!(name = %self.name, "output port closed");
    }

    fn resolve(&self, target: &str) -> Result<Contact> {
        let contact = self.namespace.query_name(target);
        if contact.is_valid() {
            return Ok(contact);
        }
        // Fall back to a literal host:port spec.
        if let Some((host, port)) = target.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() && port != 0 {
                    return Ok(Contact::by_socket(host, port));
                }
            }
        }
        Err(PortError::ResolveFailed(target.to_string()))
    }

    fn needed_modes(&self) -> (bool, bool) {
        let records = lock(&self.records);
        let need_text = records.iter().any(|r| r.protocol.is_text_mode());
        let need_binary = records.iter().any(|r| !r.protocol.is_text_mode());
        (need_binary, need_text)
    }
}

impl Drop for OutputPort {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(records: &Mutex<Vec<OutputRecord>>) -> std::sync::MutexGuard<'_, Vec<OutputRecord>> {
    match records.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Replay one rendered message to every connection, dropping the dead.
fn broadcast(records: &Mutex<Vec<OutputRecord>>, recorded: &RecordedMessage) {
    let mut records = lock(records);
    records.retain_mut(|record| {
        let Some(data) = recorded.for_mode(record.protocol.is_text_mode()) else {
            warn!(route = %record.protocol.route(), "no rendering for this peer's mode");
            return true;
        };
        match record.protocol.write(data) {
            Ok(()) => true,
            Err(err) => {
                warn!(route = %record.protocol.route(), %err, "dropping failed connection");
                false
            }
        }
    });
}
