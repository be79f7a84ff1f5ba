use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use portlink_carrier::{CarrierRegistry, Protocol};
use portlink_name::{Contact, NameSpace};
use portlink_transport::StreamInterrupter;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::error::Result;
use crate::face::Face;
use crate::message::{Portable, RecordedMessage};

type ReaderCallback<T> = Box<dyn FnMut(T) + Send>;
type ReplierCallback<T> = Box<dyn FnMut(&T) -> T + Send>;

struct InputState<T> {
    strict: bool,
    capacity: usize,
    fifo: VecDeque<T>,
    latest: Option<T>,
    closed: bool,
}

struct InputShared<T> {
    state: Mutex<InputState<T>>,
    readable: Condvar,
    writable: Condvar,
}

struct Callbacks<T> {
    reader: Mutex<Option<ReaderCallback<T>>>,
    replier: Mutex<Option<ReplierCallback<T>>>,
}

struct ServiceConn {
    interrupter: Arc<dyn StreamInterrupter>,
    thread: Option<JoinHandle<()>>,
}

/// The receiving side of a port: a listening [`Face`] plus one service
/// thread per inbound connection.
///
/// Two delivery disciplines:
/// - non-strict (default): only the freshest unread message is kept;
///   a reader always observes the latest state, never a backlog
/// - strict: every message is kept in arrival order in a bounded queue;
///   when it fills, the service thread withholds the carrier ack until
///   space frees up, so acknowledging senders stall instead of flooding
///
/// A reader callback, when set, replaces the queue entirely; a replier
/// callback answers reply-capable senders in-line.
pub struct InputPort<T: Portable + Default + Send + 'static> {
    name: String,
    face: Option<Face>,
    contact: Contact,
    shared: Arc<InputShared<T>>,
    callbacks: Arc<Callbacks<T>>,
    connections: Arc<Mutex<Vec<ServiceConn>>>,
    namespace: Arc<dyn NameSpace>,
    registered: bool,
    closed: bool,
}

impl<T: Portable + Default + Send + 'static> InputPort<T> {
    /// Bind a face, register the port's name, and start accepting.
    pub fn open(
        name: &str,
        config: PortConfig,
        registry: Arc<CarrierRegistry>,
        namespace: Arc<dyn NameSpace>,
    ) -> Result<Self> {
        let shared = Arc::new(InputShared {
            state: Mutex::new(InputState {
                strict: config.strict(),
                capacity: config.queue_capacity(),
                fifo: VecDeque::new(),
                latest: None,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        });
        let callbacks = Arc::new(Callbacks {
            reader: Mutex::new(None),
            replier: Mutex::new(None),
        });
        let connections: Arc<Mutex<Vec<ServiceConn>>> = Arc::new(Mutex::new(Vec::new()));

        let conn_shared = Arc::clone(&shared);
        let conn_callbacks = Arc::clone(&callbacks);
        let conn_list = Arc::clone(&connections);
        let face = Face::open(
            config.host(),
            0,
            name,
            registry,
            move |protocol| {
                attach_connection(
                    protocol,
                    Arc::clone(&conn_shared),
                    Arc::clone(&conn_callbacks),
                    &conn_list,
                );
            },
        )?;

        let address = face.address().clone();
        let contact = Contact::by_name(name).with_socket(address.host(), address.port());
        let registered = match namespace.register_name(contact.clone()) {
            Ok(_) => true,
            Err(err) => {
                warn!(name, %err, "name registration failed; port reachable by socket only");
                false
            }
        };

        info!(name, %address, "input port open");
        Ok(Self {
            name: name.to_string(),
            face: Some(face),
            contact,
            shared,
            callbacks,
            connections,
            namespace,
            registered,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where this port can be reached.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Take the next message.
    ///
    /// Strict ports yield every message in arrival order; non-strict
    /// ports yield only the freshest. With `wait` set, blocks until a
    /// message arrives or the port closes; otherwise returns `None`
    /// immediately when nothing is pending.
    pub fn read(&self, wait: bool) -> Option<T> {
        let mut state = lock_state(&self.shared);
        loop {
            // A closed port yields nothing, even if messages were queued
            // before the close.
            if state.closed {
                return None;
            }
            if state.strict {
                if let Some(message) = state.fifo.pop_front() {
                    self.shared.writable.notify_all();
                    return Some(message);
                }
            } else if let Some(message) = state.latest.take() {
                return Some(message);
            }
            if !wait {
                return None;
            }
            state = match self.shared.readable.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Deliver messages to `callback` instead of the read queue.
    ///
    /// Invoked once per message, on the delivering connection's service
    /// thread.
    pub fn set_reader(&self, callback: impl FnMut(T) + Send + 'static) {
        *lock_mutex(&self.callbacks.reader) = Some(Box::new(callback));
    }

    /// Answer reply-capable senders with `callback`'s return value.
    pub fn set_replier(&self, callback: impl FnMut(&T) -> T + Send + 'static) {
        *lock_mutex(&self.callbacks.replier) = Some(Box::new(callback));
    }

    /// Switch delivery discipline. Messages already queued are kept.
    pub fn set_strict(&self, strict: bool) {
        let mut state = lock_state(&self.shared);
        state.strict = strict;
        self.shared.writable.notify_all();
    }

    /// Number of live inbound connections.
    pub fn connection_count(&self) -> usize {
        lock_mutex(&self.connections).len()
    }

    /// Stop accepting, unblock and join every service thread, release
    /// the name. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut face) = self.face.take() {
            face.close();
        }

        {
            let mut state = lock_state(&self.shared);
            state.closed = true;
            self.shared.readable.notify_all();
            self.shared.writable.notify_all();
        }

        let mut connections = lock_mutex(&self.connections);
        for conn in connections.iter_mut() {
            conn.interrupter.interrupt();
        }
        for conn in connections.iter_mut() {
            if let Some(handle) = conn.thread.take() {
                let _ = handle.join();
            }
        }
        connections.clear();
        drop(connections);

        if self.registered {
            if let Err(err) = self.namespace.unregister_name(&self.name) {
                debug!(name = %self.name, %err, "unregister failed");
            }
        }
        info!(name = %self.name, "input port closed");
    }
}

impl<T: Portable + Default + Send + 'static> Drop for InputPort<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn attach_connection<T: Portable + Default + Send + 'static>(
    protocol: Protocol,
    shared: Arc<InputShared<T>>,
    callbacks: Arc<Callbacks<T>>,
    connections: &Mutex<Vec<ServiceConn>>,
) {
    if lock_state(&shared).closed {
        return;
    }
    let interrupter = protocol.interrupt_handle();
    let spawned = std::thread::Builder::new()
        .name("portlink-service".to_string())
        .spawn(move || service_loop(protocol, shared, callbacks));
    match spawned {
        Ok(handle) => {
            lock_mutex(connections).push(ServiceConn {
                interrupter,
                thread: Some(handle),
            });
        }
        Err(err) => warn!(%err, "cannot spawn service thread"),
    }
}

/// Drain one inbound connection until it breaks or the port closes.
fn service_loop<T: Portable + Default + Send + 'static>(
    mut protocol: Protocol,
    shared: Arc<InputShared<T>>,
    callbacks: Arc<Callbacks<T>>,
) {
    let route = protocol.route().clone();
    debug!(%route, "service thread started");
    loop {
        let message = match protocol.read_message(|reader| {
            let mut message = T::default();
            message.read_from(reader)?;
            Ok(message)
        }) {
            Ok(message) => message,
            Err(err) => {
                debug!(%route, %err, "connection ended");
                break;
            }
        };

        // A replier answers in-line and consumes the message.
        if protocol.supports_reply() {
            let mut replier = lock_mutex(&callbacks.replier);
            if let Some(replier) = replier.as_mut() {
                let response = replier(&message);
                let text = protocol.is_text_mode();
                let outcome = RecordedMessage::record(&response, !text, text)
                    .and_then(|recorded| match recorded.for_mode(text) {
                        Some(data) => protocol.reply(data),
                        None => Ok(()),
                    })
                    .and_then(|()| protocol.end_read());
                if outcome.is_err() {
                    break;
                }
                continue;
            }
        }

        {
            let mut reader = lock_mutex(&callbacks.reader);
            if let Some(reader) = reader.as_mut() {
                reader(message);
                if protocol.end_read().is_err() {
                    break;
                }
                continue;
            }
        }

        if !deliver(&shared, message) {
            break;
        }
        // Ack only after the message is safely queued; a full strict
        // queue therefore stalls acknowledging senders.
        if protocol.end_read().is_err() {
            break;
        }
    }
    protocol.close();
}

/// Queue one message per the current discipline. False means the port
/// closed while waiting for queue space.
fn deliver<T>(shared: &InputShared<T>, message: T) -> bool {
    let mut state = lock_state(shared);
    if state.strict {
        while state.fifo.len() >= state.capacity {
            if state.closed {
                return false;
            }
            state = match shared.writable.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if state.closed {
            return false;
        }
        state.fifo.push_back(message);
    } else {
        if state.closed {
            return false;
        }
        state.latest = Some(message);
    }
    shared.readable.notify_all();
    true
}

fn lock_state<'a, T>(shared: &'a InputShared<T>) -> std::sync::MutexGuard<'a, InputState<T>> {
    match shared.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
