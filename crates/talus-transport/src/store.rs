//! Three-index concurrent session store.
//!
//! Sessions are reachable by remote endpoint while handshaking, and after
//! that either by endpoint (no connection ID) or by connection ID. The
//! same endpoint may host one handshaking session and one established
//! CID session at once — a CID session can migrate away, freeing its
//! original endpoint for a newcomer — and that is the only permitted
//! overlap.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};

use bytes::Bytes;
use dashmap::DashMap;

use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("endpoint {0} already has a session")]
    EndpointInUse(SocketAddr),
    #[error("connection ID already in use")]
    DuplicateConnectionId,
    #[error("endpoint {0} already has an established session")]
    DuplicateEndpoint(SocketAddr),
    #[error("connection IDs must have constant length (expected {expected}, got {actual})")]
    ConnectionIdLength { expected: usize, actual: usize },
    #[error("established session at {0} carries a connection ID")]
    CorruptEndpointIndex(SocketAddr),
}

/// Result of a datagram lookup.
#[derive(Clone)]
pub enum FindResult {
    FoundByEndpoint(Arc<Session>),
    FoundByConnectionId(Arc<Session>),
    NotFound,
}

#[derive(Default)]
pub struct SessionStore {
    accepting: DashMap<SocketAddr, Arc<Session>>,
    established_by_endpoint: DashMap<SocketAddr, Arc<Session>>,
    established_by_cid: DashMap<Bytes, Arc<Session>>,
    /// Pinned by the first accepted CID; every later CID must match, or
    /// the stateless record parser could not extract CIDs at all.
    cid_len: OnceLock<usize>,
    /// Composite mutations take the write side; lookups and snapshots the
    /// read side, so no lookup observes a half-applied transition.
    guard: RwLock<()>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pinned connection ID length, once any CID session exists.
    pub fn connection_id_length(&self) -> Option<usize> {
        self.cid_len.get().copied()
    }

    /// Route a datagram to a session.
    ///
    /// Precedence: an established CID session wins for CID-bearing
    /// records; an established endpoint session wins for plain records;
    /// either kind still reaches a handshaking session at the source
    /// endpoint, because a handshake in flight has not published its CID
    /// yet and retransmitted or early-CID records must reach it.
    pub fn try_find(
        &self,
        endpoint: SocketAddr,
        cid: Option<&[u8]>,
    ) -> Result<FindResult, StoreError> {
        let _guard = self.guard.read().unwrap();
        match cid {
            Some(cid) => {
                if let Some(session) = self.established_by_cid.get(cid) {
                    return Ok(FindResult::FoundByConnectionId(session.clone()));
                }
            }
            None => {
                if let Some(session) = self.established_by_endpoint.get(&endpoint) {
                    if session.has_connection_id() {
                        return Err(StoreError::CorruptEndpointIndex(endpoint));
                    }
                    return Ok(FindResult::FoundByEndpoint(session.clone()));
                }
            }
        }
        if let Some(session) = self.accepting.get(&endpoint) {
            return Ok(FindResult::FoundByEndpoint(session.clone()));
        }
        Ok(FindResult::NotFound)
    }

    /// Register a freshly created handshaking session.
    pub fn add(&self, session: Arc<Session>) -> Result<(), StoreError> {
        let _guard = self.guard.write().unwrap();
        let endpoint = session.endpoint();
        if self.accepting.contains_key(&endpoint)
            || self.established_by_endpoint.contains_key(&endpoint)
        {
            return Err(StoreError::EndpointInUse(endpoint));
        }
        self.accepting.insert(endpoint, session);
        Ok(())
    }

    /// Move a session from the accepting index to the established index
    /// matching its negotiated CID.
    ///
    /// On failure the session stays in the accepting index; the caller
    /// must [`SessionStore::remove`] it to restore the invariant.
    pub fn notify_session_accepted(&self, session: &Arc<Session>) -> Result<(), StoreError> {
        let _guard = self.guard.write().unwrap();
        let endpoint = session.endpoint();
        match session.connection_id() {
            Some(cid) => {
                let expected = *self.cid_len.get_or_init(|| cid.len());
                if cid.len() != expected {
                    return Err(StoreError::ConnectionIdLength {
                        expected,
                        actual: cid.len(),
                    });
                }
                if self.established_by_cid.contains_key(cid.as_ref() as &[u8]) {
                    return Err(StoreError::DuplicateConnectionId);
                }
                self.accepting
                    .remove_if(&endpoint, |_, s| Arc::ptr_eq(s, session));
                self.established_by_cid.insert(cid.clone(), session.clone());
            }
            None => {
                if self.established_by_endpoint.contains_key(&endpoint) {
                    return Err(StoreError::DuplicateEndpoint(endpoint));
                }
                self.accepting
                    .remove_if(&endpoint, |_, s| Arc::ptr_eq(s, session));
                self.established_by_endpoint
                    .insert(endpoint, session.clone());
            }
        }
        Ok(())
    }

    /// Remove a session from whichever index holds it.
    ///
    /// Removal is conditional on identity: an accepting session and an
    /// established CID session can share an endpoint, and evicting the
    /// wrong one would corrupt the indexes.
    pub fn remove(&self, session: &Arc<Session>) {
        let _guard = self.guard.write().unwrap();
        if self
            .accepting
            .remove_if(&session.initial_endpoint(), |_, s| Arc::ptr_eq(s, session))
            .is_some()
        {
            return;
        }
        match session.connection_id() {
            Some(cid) => {
                self.established_by_cid
                    .remove_if(cid.as_ref() as &[u8], |_, s| Arc::ptr_eq(s, session));
            }
            None => {
                self.established_by_endpoint
                    .remove_if(&session.endpoint(), |_, s| Arc::ptr_eq(s, session));
            }
        }
    }

    /// Snapshot of every live session across all three indexes.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let _guard = self.guard.read().unwrap();
        self.accepting
            .iter()
            .map(|entry| entry.value().clone())
            .chain(
                self.established_by_endpoint
                    .iter()
                    .map(|entry| entry.value().clone()),
            )
            .chain(
                self.established_by_cid
                    .iter()
                    .map(|entry| entry.value().clone()),
            )
            .collect()
    }

    pub fn count(&self) -> usize {
        let _guard = self.guard.read().unwrap();
        self.accepting.len() + self.established_by_endpoint.len() + self.established_by_cid.len()
    }

    /// Number of sessions still handshaking.
    pub fn accepting_count(&self) -> usize {
        self.accepting.len()
    }
}
