use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::contact::Contact;
use crate::error::{NameError, Result};

/// A pluggable source of name-to-contact resolution.
///
/// Implementations may be a centralized server, a local-only table, or a
/// chain of fallbacks. Resolution is best-effort: `query_name` answers an
/// invalid [`Contact`] for unknown names, never an error.
pub trait NameSpace: Send + Sync {
    /// Resolve a logical name. Invalid contact means "not found".
    fn query_name(&self, name: &str) -> Contact;

    /// Record where a named endpoint can be reached.
    ///
    /// Returns the contact as registered (a server may rewrite the host it
    /// observed the registration from).
    fn register_name(&self, contact: Contact) -> Result<Contact>;

    /// Remove a name from the table. Unknown names are not an error.
    fn unregister_name(&self, name: &str) -> Result<()>;

    /// True if this name space never touches the network.
    fn is_local_mode(&self) -> bool {
        false
    }
}

/// In-memory name table for single-process operation and tests.
///
/// This is the "local mode" variant: all queries are answered from the
/// table, no network is ever consulted.
#[derive(Default)]
pub struct LocalNameSpace {
    table: Mutex<HashMap<String, Contact>>,
}

impl LocalNameSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameSpace for LocalNameSpace {
    fn query_name(&self, name: &str) -> Contact {
        match self.table.lock() {
            Ok(table) => table.get(name).cloned().unwrap_or_else(Contact::invalid),
            Err(_) => Contact::invalid(),
        }
    }

    fn register_name(&self, contact: Contact) -> Result<Contact> {
        if contact.name().is_empty() || !contact.is_valid() {
            return Err(NameError::InvalidContact(contact.name().to_string()));
        }
        let mut table = self
            .table
            .lock()
            .map_err(|_| NameError::Rejected("name table lock poisoned".to_string()))?;
        debug!(name = contact.name(), %contact, "registered name locally");
        table.insert(contact.name().to_string(), contact.clone());
        Ok(contact)
    }

    fn unregister_name(&self, name: &str) -> Result<()> {
        if let Ok(mut table) = self.table.lock() {
            table.remove(name);
        }
        Ok(())
    }

    fn is_local_mode(&self) -> bool {
        true
    }
}

/// Ordered chain of name spaces; the first valid answer wins.
pub struct MultiNameSpace {
    spaces: Vec<Arc<dyn NameSpace>>,
}

impl MultiNameSpace {
    pub fn new(spaces: Vec<Arc<dyn NameSpace>>) -> Self {
        Self { spaces }
    }
}

impl NameSpace for MultiNameSpace {
    fn query_name(&self, name: &str) -> Contact {
        for space in &self.spaces {
            let contact = space.query_name(name);
            if contact.is_valid() {
                return contact;
            }
        }
        Contact::invalid()
    }

    fn register_name(&self, contact: Contact) -> Result<Contact> {
        let mut registered = None;
        for space in &self.spaces {
            match space.register_name(contact.clone()) {
                Ok(result) => {
                    registered.get_or_insert(result);
                }
                Err(err) => debug!(%err, "name space in chain refused registration"),
            }
        }
        registered.ok_or_else(|| NameError::Rejected("all name spaces refused".to_string()))
    }

    fn unregister_name(&self, name: &str) -> Result<()> {
        for space in &self.spaces {
            let _ = space.unregister_name(name);
        }
        Ok(())
    }

    fn is_local_mode(&self) -> bool {
        self.spaces.iter().all(|space| space.is_local_mode())
    }
}
