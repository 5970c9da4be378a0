use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::RelaySettings;
use crate::error::{Error, Result};
use crate::relay::listener::{ClientLink, ConnectionEvents};
use crate::relay::session::RelaySession;
use crate::relay::ConnectionId;

/// Live relay sessions and the client links they write back through,
/// keyed by connection identifier.
pub struct Registry {
    target_addr: String,
    settings: RelaySettings,
    sessions: DashMap<ConnectionId, Arc<RelaySession>>,
    clients: DashMap<ConnectionId, Arc<ClientLink>>,
    this: Weak<Registry>,
}

/// The slice of the registry a session is allowed to touch.
///
/// Holds only a weak reference so sessions never keep the registry alive.
#[derive(Clone)]
pub struct RegistryHandle {
    registry: Weak<Registry>,
}

impl Registry {
    pub fn new(target_addr: impl Into<String>, settings: RelaySettings) -> Arc<Self> {
        let target_addr = target_addr.into();
        Arc::new_cyclic(|this| Self {
            target_addr,
            settings,
            sessions: DashMap::new(),
            clients: DashMap::new(),
            this: this.clone(),
        })
    }

    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            registry: self.this.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session(&self, id: ConnectionId) -> Option<Arc<RelaySession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Track a new session. The session must not be registered already.
    pub fn insert(&self, session: Arc<RelaySession>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn attach_client(&self, link: Arc<ClientLink>) {
        self.clients.insert(link.id(), link);
    }

    /// Drop the session and close its client link. Returns whether a
    /// session entry was removed.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if let Some((_, link)) = self.clients.remove(&id) {
            link.close();
        }
        removed
    }

    /// Write to the client behind `id`.
    pub async fn send_to_client(&self, id: ConnectionId, data: &[u8]) -> Result<()> {
        let link = self
            .clients
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::ConnectionClosed(id))?;

        link.send(data, self.settings.io_timeout).await
    }

    /// Free every live session. Returns how many were torn down here.
    pub fn free_all(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let freed = sessions.iter().filter(|session| session.free()).count();
        info!(freed, "all relay sessions freed");
        freed
    }
}

impl RegistryHandle {
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.contains(id))
            .unwrap_or(false)
    }

    pub fn deregister(&self, id: ConnectionId) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.deregister(id))
            .unwrap_or(false)
    }

    pub async fn send_to_client(&self, id: ConnectionId, data: &[u8]) -> Result<()> {
        let registry = self.registry.upgrade().ok_or(Error::ConnectionClosed(id))?;
        registry.send_to_client(id, data).await
    }
}

#[async_trait]
impl ConnectionEvents for Registry {
    async fn on_accept(&self, id: ConnectionId, link: Arc<ClientLink>) {
        self.attach_client(link);

        let session = RelaySession::new(id, self.handle(), self.settings.clone());
        self.insert(Arc::clone(&session));

        // The dial runs alongside the inbound reader; bytes that arrive first
        // wait in the session queue.
        let target_addr = self.target_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = session.start(&target_addr).await {
                debug!(conn = id, error = %e, "session ended before relaying");
            }
        });
    }

    async fn on_receive(&self, id: ConnectionId, data: Bytes) {
        match self.session(id) {
            Some(session) => session.deliver_from_client(data).await,
            None => debug!(conn = id, len = data.len(), "no session for inbound data, ignoring"),
        }
    }

    async fn on_close(&self, id: ConnectionId) {
        match self.session(id) {
            Some(session) => {
                session.free();
            }
            None => {
                // Session already gone; make sure the link does not linger.
                if let Some((_, link)) = self.clients.remove(&id) {
                    link.close();
                }
                debug!(conn = id, "close for unknown session, ignoring");
            }
        }
    }
}
