//! Registry of live peer sessions
//!
//! Sessions are indexed twice: by inside address for routing outbound
//! packets, and by outside address for connection bookkeeping. Both
//! indices change under one lock so they never disagree.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::PeerSession;

#[derive(Default)]
struct Indices {
    by_outside: HashMap<SocketAddr, Arc<PeerSession>>,
    by_inside: HashMap<IpAddr, Arc<PeerSession>>,
}

impl Indices {
    /// Remove `session` from both indices if it is the registered one
    fn remove(&mut self, session: &Arc<PeerSession>) -> bool {
        let mut removed = false;

        if self
            .by_outside
            .get(&session.outside_addr())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            self.by_outside.remove(&session.outside_addr());
            removed = true;
        }

        if self
            .by_inside
            .get(&session.inside_addr())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            self.by_inside.remove(&session.inside_addr());
            removed = true;
        }

        removed
    }
}

/// Thread-safe peer session registry
#[derive(Default)]
pub struct PeerRegistry {
    indices: RwLock<Indices>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session under both of its addresses.
    ///
    /// Sessions previously registered under either address are removed
    /// from both indices and returned so the caller can stop them.
    pub fn add(&self, session: Arc<PeerSession>) -> Vec<Arc<PeerSession>> {
        let mut indices = self.write();
        let mut displaced: Vec<Arc<PeerSession>> = Vec::new();

        let previous = [
            indices.by_outside.get(&session.outside_addr()).cloned(),
            indices.by_inside.get(&session.inside_addr()).cloned(),
        ];

        for old in previous.into_iter().flatten() {
            if Arc::ptr_eq(&old, &session) || displaced.iter().any(|d| Arc::ptr_eq(d, &old)) {
                continue;
            }
            indices.remove(&old);
            displaced.push(old);
        }

        indices.by_outside.insert(session.outside_addr(), Arc::clone(&session));
        indices.by_inside.insert(session.inside_addr(), session);

        displaced
    }

    /// Session that owns the given inside address
    pub fn get_by_inside(&self, inside: &IpAddr) -> Option<Arc<PeerSession>> {
        self.read().by_inside.get(inside).cloned()
    }

    /// Session with the given outside address
    pub fn get_by_outside(&self, outside: &SocketAddr) -> Option<Arc<PeerSession>> {
        self.read().by_outside.get(outside).cloned()
    }

    pub fn contains_outside(&self, outside: &SocketAddr) -> bool {
        self.read().by_outside.contains_key(outside)
    }

    /// Remove whatever session is registered at `outside`
    pub fn remove_by_outside(&self, outside: &SocketAddr) -> Option<Arc<PeerSession>> {
        let mut indices = self.write();
        let session = indices.by_outside.get(outside).cloned()?;
        indices.remove(&session);
        Some(session)
    }

    /// Remove `session` only if it is still the registered one
    pub fn remove_session(&self, session: &Arc<PeerSession>) -> bool {
        self.write().remove(session)
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Arc<PeerSession>> {
        let mut indices = self.write();
        indices.by_inside.clear();
        indices.by_outside.drain().map(|(_, session)| session).collect()
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.read().by_outside.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_outside.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
