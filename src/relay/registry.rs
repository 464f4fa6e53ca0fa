//! # Session Registry
//!
//! Process-wide lookup of live clients: `client_id → (event channel, relay session)`.
//!
//! ## Ownership:
//! The registry never keeps a session alive. It stores a `Weak` reference; the
//! WebSocket actor that accepted the client holds the only strong one. When the
//! actor stops it removes its entry, and any lookup racing with that removal
//! just sees `None`.
//!
//! ## Capacity:
//! `register` refuses new clients once `max_sessions` entries exist. Replacing
//! the session of an existing client (language change) never counts against it.

use crate::relay::session::{ConnectionState, EventSink, RelaySession};

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Why a client could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Maximum concurrent sessions ({0}) reached")]
    Full(usize),

    #[error("Client {0} is already registered")]
    Duplicate(String),
}

struct Entry {
    events: EventSink,
    session: Weak<RelaySession>,
}

/// Read-only view of one registered client, for the sessions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub client_id: String,
    pub from: String,
    pub to: String,
    pub state: ConnectionState,
}

pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Whether another client would be accepted right now.
    pub fn has_capacity(&self) -> bool {
        self.entries.read().len() < self.max_sessions
    }

    /// Add a new client.
    pub fn register(
        &self,
        client_id: &str,
        events: EventSink,
        session: &Arc<RelaySession>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();

        if entries.contains_key(client_id) {
            return Err(RegistryError::Duplicate(client_id.to_string()));
        }
        if entries.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }

        entries.insert(
            client_id.to_string(),
            Entry {
                events,
                session: Arc::downgrade(session),
            },
        );
        Ok(())
    }

    /// Point an existing client at a new session. Returns false if the client is gone.
    pub fn replace_session(&self, client_id: &str, session: &Arc<RelaySession>) -> bool {
        match self.entries.write().get_mut(client_id) {
            Some(entry) => {
                entry.session = Arc::downgrade(session);
                true
            }
            None => false,
        }
    }

    /// The client's current session, if both are still alive.
    pub fn get(&self, client_id: &str) -> Option<Arc<RelaySession>> {
        self.entries
            .read()
            .get(client_id)
            .and_then(|entry| entry.session.upgrade())
    }

    /// The client's event channel.
    pub fn events_for(&self, client_id: &str) -> Option<EventSink> {
        self.entries
            .read()
            .get(client_id)
            .map(|entry| entry.events.clone())
    }

    /// Drop a client. Idempotent.
    pub fn remove(&self, client_id: &str) -> bool {
        self.entries.write().remove(client_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Summaries of every client whose session is still alive, sorted by id.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .entries
            .read()
            .iter()
            .filter_map(|(client_id, entry)| {
                let session = entry.session.upgrade()?;
                let languages = session.languages();
                Some(SessionSummary {
                    client_id: client_id.clone(),
                    from: languages.from.clone(),
                    to: languages.to.clone(),
                    state: session.state(),
                })
            })
            .collect();

        summaries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        summaries
    }
}
