use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use crate::config::NetConfig;
use crate::session::session::{Session, SessionId, SessionKey};
use crate::transport::channel_transport::ChannelTransport;

/// Issues session ids for newly established sessions
pub trait SessionIdSource: Send {
    fn next_session_id(&mut self) -> SessionId;
}

/// Random non-zero session ids (0 marks a rejected greeting on the wire)
pub struct RandomSessionIds;

impl SessionIdSource for RandomSessionIds {
    fn next_session_id(&mut self) -> SessionId {
        SessionId::from_raw(rand::thread_rng().gen_range(1..=u64::MAX))
    }
}

/// Allocates session keys. This is shared between the protocol engine and the application
///  facade so that applications know a session's key before the engine sees the session.
#[derive(Clone)]
pub struct SessionKeySource(Arc<AtomicU64>);

impl Default for SessionKeySource {
    fn default() -> Self {
        SessionKeySource(Arc::new(AtomicU64::new(1)))
    }
}

impl SessionKeySource {
    pub fn next_key(&self) -> SessionKey {
        SessionKey::from_raw(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Holds all sessions of an end point. Every session is stored by its [SessionKey]; sessions
///  that reached ESTABLISHED are additionally registered by their [SessionId] so that resume
///  requests can find them after their transport was lost.
///
/// NB: This is owned by the protocol engine and touched only from its pump, so there is no
///      internal locking
pub struct SessionManager {
    sessions: FxHashMap<SessionKey, Session>,
    registry: FxHashMap<SessionId, SessionKey>,
    key_source: SessionKeySource,
    id_source: Box<dyn SessionIdSource>,
}

impl SessionManager {
    pub fn new(key_source: SessionKeySource) -> SessionManager {
        SessionManager {
            sessions: Default::default(),
            registry: Default::default(),
            key_source,
            id_source: Box::new(RandomSessionIds),
        }
    }

    pub fn set_session_id_source(&mut self, id_source: Box<dyn SessionIdSource>) {
        self.id_source = id_source;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn num_registered(&self) -> usize {
        self.registry.len()
    }

    /// Creates a client session for a key that was handed out before (see
    ///  [SessionKeySource]). The session id is assigned by the server on establishment.
    pub fn create_client_session(&mut self, key: SessionKey, remote_addr: SocketAddr, config: &NetConfig, now: Instant) -> anyhow::Result<&mut Session> {
        if self.sessions.contains_key(&key) {
            anyhow::bail!("session key {} is already in use", key);
        }
        debug!("creating client session {} for {}", key, remote_addr);
        Ok(self.sessions.entry(key)
            .or_insert_with(|| Session::new_client(key, remote_addr, config, now)))
    }

    /// creates a provisional server-side session for a newly accepted transport
    pub fn create_session(&mut self, transport: Arc<ChannelTransport>, config: &NetConfig, now: Instant) -> &mut Session {
        let key = self.key_source.next_key();
        debug!("creating server session {} for {:?}", key, transport);
        self.sessions.entry(key)
            .or_insert_with(|| Session::new_server(key, transport, config, now))
    }

    /// issues an id that is not in use by a registered session
    pub fn issue_session_id(&mut self) -> SessionId {
        loop {
            let candidate = self.id_source.next_session_id();
            if !self.registry.contains_key(&candidate) {
                return candidate;
            }
            warn!("session id collision for {} - retrying", candidate);
        }
    }

    pub fn register_session(&mut self, id: SessionId, key: SessionKey) {
        if let Some(previous) = self.registry.insert(id, key) {
            if previous != key {
                warn!("session id {} was registered for {} and is now re-registered for {}", id, previous, key);
            }
        }
    }

    pub fn lookup_session(&self, id: SessionId) -> Option<SessionKey> {
        self.registry.get(&id).copied()
    }

    pub fn get(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.get(&key)
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(&key)
    }

    /// Removes a session permanently, including its registry entry
    pub fn remove_session(&mut self, key: SessionKey) -> Option<Session> {
        let result = self.sessions.remove(&key)?;
        if let Some(id) = result.session_id() {
            if self.registry.get(&id) == Some(&key) {
                self.registry.remove(&id);
            }
        }
        debug!("removed session {}", key);
        Some(result)
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
pub struct FixedSessionIds(pub Vec<u64>);

#[cfg(test)]
impl SessionIdSource for FixedSessionIds {
    fn next_session_id(&mut self) -> SessionId {
        SessionId::from_raw(self.0.remove(0))
    }
}
