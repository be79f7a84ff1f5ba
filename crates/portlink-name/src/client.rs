use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::contact::Contact;
use crate::error::{NameError, Result};
use crate::namespace::NameSpace;

/// Default name-server location, used when no override is configured.
pub const DEFAULT_NAME_SERVER: (&str, u16) = ("127.0.0.1", 10000);

/// Environment variable overriding the name-server location (`host:port`).
pub const NAME_SERVER_ENV: &str = "PORTLINK_NAME_SERVER";

/// One request in the name exchange, sent as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NameRequest {
    Query { name: String },
    Register { contact: Contact },
    Unregister { name: String },
}

/// One response in the name exchange, a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NameResponse {
    pub fn found(contact: Contact) -> Self {
        Self {
            ok: true,
            contact: Some(contact),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            ok: true,
            contact: None,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            contact: None,
            error: Some(error.into()),
        }
    }
}

/// Client side of the name exchange.
///
/// Opens a fresh connection per request; the exchange is a single
/// request line followed by a single response line.
pub struct NameClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl NameClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(3),
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn exchange(&self, request: &NameRequest) -> Result<NameResponse> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| NameError::Rejected(format!("bad server address {}", self.host)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply)?;
        let response: NameResponse = serde_json::from_str(reply.trim_end())?;
        if !response.ok {
            return Err(NameError::Rejected(
                response.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        Ok(response)
    }
}

impl NameSpace for NameClient {
    fn query_name(&self, name: &str) -> Contact {
        let request = NameRequest::Query {
            name: name.to_string(),
        };
        match self.exchange(&request) {
            Ok(response) => response.contact.unwrap_or_else(Contact::invalid),
            Err(err) => {
                debug!(name, %err, "name query failed");
                Contact::invalid()
            }
        }
    }

    fn register_name(&self, contact: Contact) -> Result<Contact> {
        let response = self.exchange(&NameRequest::Register {
            contact: contact.clone(),
        })?;
        Ok(response.contact.unwrap_or(contact))
    }

    fn unregister_name(&self, name: &str) -> Result<()> {
        self.exchange(&NameRequest::Unregister {
            name: name.to_string(),
        })?;
        Ok(())
    }
}

/// Probe for a reachable name server.
///
/// Checks the `PORTLINK_NAME_SERVER` environment override, then the
/// default location. Absence is reported as `None`, never an error.
pub fn detect_name_server() -> Option<Contact> {
    let (host, port) = match std::env::var(NAME_SERVER_ENV) {
        Ok(spec) => match parse_host_port(&spec) {
            Some(pair) => pair,
            None => {
                warn!(%spec, "ignoring malformed {NAME_SERVER_ENV}");
                (DEFAULT_NAME_SERVER.0.to_string(), DEFAULT_NAME_SERVER.1)
            }
        },
        Err(_) => (DEFAULT_NAME_SERVER.0.to_string(), DEFAULT_NAME_SERVER.1),
    };

    let addr: SocketAddr = format!("{host}:{port}").parse().ok()?;
    match TcpStream::connect_timeout(&addr, Duration::from_millis(500)) {
        Ok(_) => {
            debug!(%host, port, "name server detected");
            Some(Contact::by_socket(host, port))
        }
        Err(_) => None,
    }
}

fn parse_host_port(spec: &str) -> Option<(String, u16)> {
    let (host, port) = spec.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}
