use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{NameRequest, NameResponse};
use crate::contact::Contact;
use crate::error::Result;
use crate::namespace::{LocalNameSpace, NameSpace};

/// In-process name server speaking the JSON-line name exchange.
///
/// Backs onto a [`LocalNameSpace`] table; persistence is out of scope.
/// Each accepted connection is served on its own thread and carries one
/// or more request lines.
pub struct NameServer {
    table: Arc<LocalNameSpace>,
    contact: Contact,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl NameServer {
    /// Bind on `host:port` (port 0 picks an ephemeral port) and start
    /// serving.
    pub fn spawn(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(format!("{host}:{port}"))?;
        let local = listener.local_addr()?;
        let contact = Contact::by_name("/name-server").with_socket(host, local.port());
        info!(%contact, "name server listening");

        let table = Arc::new(LocalNameSpace::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_table = Arc::clone(&table);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = std::thread::Builder::new()
            .name("portlink-name-server".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let table = Arc::clone(&accept_table);
                            let _ = std::thread::Builder::new()
                                .name("portlink-name-conn".to_string())
                                .spawn(move || serve_connection(stream, &table));
                        }
                        Err(err) => {
                            warn!(%err, "name server accept failed");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            table,
            contact,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    /// Where this server can be reached.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// The table being served, usable directly as a local name space.
    pub fn table(&self) -> Arc<LocalNameSpace> {
        Arc::clone(&self.table)
    }

    /// Stop accepting and join the accept thread. Idempotent.
    pub fn close(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Poke the listener so the blocked accept returns.
        if let Ok(addr) = format!("{}:{}", self.contact.host(), self.contact.port()).parse() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NameServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn serve_connection(stream: TcpStream, table: &LocalNameSpace) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let mut writer = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            warn!(%err, "cannot clone name connection");
            return;
        }
    };
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<NameRequest>(&line) {
            Ok(request) => handle_request(request, table, &peer),
            Err(err) => NameResponse::rejected(format!("malformed request: {err}")),
        };
        let mut out = match serde_json::to_string(&response) {
            Ok(out) => out,
            Err(_) => break,
        };
        out.push('\n');
        if writer.write_all(out.as_bytes()).is_err() {
            break;
        }
    }
}

fn handle_request(request: NameRequest, table: &LocalNameSpace, peer: &str) -> NameResponse {
    match request {
        NameRequest::Query { name } => {
            let contact = table.query_name(&name);
            debug!(%name, %contact, peer, "name query");
            if contact.is_valid() {
                NameResponse::found(contact)
            } else {
                NameResponse::empty()
            }
        }
        NameRequest::Register { contact } => match table.register_name(contact) {
            Ok(registered) => NameResponse::found(registered),
            Err(err) => NameResponse::rejected(err.to_string()),
        },
        NameRequest::Unregister { name } => {
            let _ = table.unregister_name(&name);
            NameResponse::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NameClient;

    #[test]
    fn register_then_query_over_the_wire() {
        let server = NameServer::spawn("127.0.0.1", 0).unwrap();
        let client = NameClient::new(server.contact().host(), server.contact().port());

        let registered = client
            .register_name(Contact::by_name("/cam").with_socket("127.0.0.1", 14250))
            .unwrap();
        assert_eq!(registered.port(), 14250);

        let found = client.query_name("/cam");
        assert!(found.is_valid());
        assert_eq!(found.name(), "/cam");

        client.unregister_name("/cam").unwrap();
        assert!(!client.query_name("/cam").is_valid());
    }

    #[test]
    fn unknown_name_resolves_invalid() {
        let server = NameServer::spawn("127.0.0.1", 0).unwrap();
        let client = NameClient::new(server.contact().host(), server.contact().port());
        assert!(!client.query_name("/never-registered").is_valid());
    }

    #[test]
    fn close_is_idempotent() {
        let mut server = NameServer::spawn("127.0.0.1", 0).unwrap();
        server.close();
        server.close();
    }

    #[test]
    fn malformed_request_is_rejected_without_killing_server() {
        let server = NameServer::spawn("127.0.0.1", 0).unwrap();
        let addr = format!("{}:{}", server.contact().host(), server.contact().port());

        let mut raw = TcpStream::connect(&addr).unwrap();
        raw.write_all(b"{this is not json\n").unwrap();
        let mut reply = String::new();
        BufReader::new(raw).read_line(&mut reply).unwrap();
        assert!(reply.contains("\"ok\":false"));

        // Server still answers well-formed requests afterwards.
        let client = NameClient::new(server.contact().host(), server.contact().port());
        assert!(!client.query_name("/x").is_valid());
    }
}
