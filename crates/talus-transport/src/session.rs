//! One DTLS association, end to end.
//!
//! A session owns its queue transport, the record handle the provider
//! returned, the negotiated connection ID and the endpoint state. The
//! transport's demux loop feeds it datagrams; a dedicated handler task
//! drives `accept` and then `receive` until the association ends.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::provider::{
    Accepted, AcceptError, ConnectionInfo, DatagramTransport, DtlsRecord, DtlsServerProtocol,
    RecordError, RecordFlags,
};
use crate::queue::{EndpointState, QueueTransport, SendFn};

/// Wait for the provider poll after a signal wakeup. Never zero (some
/// providers read zero as "no wait" and starve their retransmit logic)
/// and never large (a spurious wakeup must not park the handler task).
const RECEIVE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not established")]
    NotEstablished,
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// State installed once the handshake completes.
struct Association {
    record: Arc<dyn DtlsRecord>,
    connection_id: Option<Bytes>,
    connection_info: Option<ConnectionInfo>,
}

pub struct Session {
    endpoint: Arc<EndpointState>,
    queue: Arc<QueueTransport>,
    state: Mutex<SessionState>,
    association: OnceLock<Association>,
    /// Released once per enqueued datagram; the receive loop consumes one
    /// permit per wakeup.
    packets_received: Semaphore,
    started: Instant,
    start_time: SystemTime,
    last_received: Mutex<Instant>,
}

impl Session {
    pub fn new(remote: SocketAddr, mtu: usize, send_fn: SendFn) -> Arc<Self> {
        let endpoint = Arc::new(EndpointState::new(remote));
        let queue = Arc::new(QueueTransport::new(endpoint.clone(), mtu, send_fn));
        Arc::new(Self {
            endpoint,
            queue,
            state: Mutex::new(SessionState::Handshaking),
            association: OnceLock::new(),
            packets_received: Semaphore::new(0),
            started: Instant::now(),
            start_time: SystemTime::now(),
            last_received: Mutex::new(Instant::now()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Endpoint the first ClientHello arrived from. Never changes.
    pub fn initial_endpoint(&self) -> SocketAddr {
        self.endpoint.initial()
    }

    /// Current remote endpoint; changes only on a committed migration.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint.current()
    }

    /// Connection ID the peer puts on its records, set at handshake
    /// completion and immutable afterwards.
    pub fn connection_id(&self) -> Option<&Bytes> {
        self.association
            .get()
            .and_then(|a| a.connection_id.as_ref())
    }

    pub fn has_connection_id(&self) -> bool {
        self.connection_id().is_some()
    }

    /// Provider-published facts about the association.
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.association
            .get()
            .and_then(|a| a.connection_info.as_ref())
    }

    /// Token cancelled when this session's transport closes.
    pub fn closed_token(&self) -> &CancellationToken {
        self.queue.closed()
    }

    pub fn session_start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn last_received_time(&self) -> SystemTime {
        SystemTime::now() - self.idle_for()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_received.lock().unwrap().elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Feed one inbound UDP datagram belonging to this session.
    pub fn enqueue_datagram(&self, datagram: Bytes, source: SocketAddr) {
        *self.last_received.lock().unwrap() = Instant::now();
        self.queue.enqueue_received(datagram, source);
        self.packets_received.add_permits(1);
    }

    /// Drive the DTLS handshake to completion.
    ///
    /// The receive signal exists from construction and every enqueued
    /// datagram released a permit, so a record queued while the handshake
    /// was still finishing already holds its wakeup — the lost-wakeup race
    /// cannot occur, only spurious permits, which the bounded poll in
    /// [`Session::receive`] absorbs.
    pub async fn accept(&self, protocol: &dyn DtlsServerProtocol) -> Result<(), AcceptError> {
        let transport: Arc<dyn DatagramTransport> = self.queue.clone();
        let accepted = protocol.accept(transport).await?;
        self.install_association(accepted);
        Ok(())
    }

    pub(crate) fn install_association(&self, accepted: Accepted) {
        let Accepted {
            record,
            connection_id,
            connection_info,
        } = accepted;
        let _ = self.association.set(Association {
            record,
            connection_id,
            connection_info,
        });
        *self.state.lock().unwrap() = SessionState::Established;
    }

    /// Return one decrypted application payload.
    ///
    /// Order matters: records the DTLS layer already buffered are drained
    /// before waiting, and the wait is followed by a bounded poll so a
    /// spurious permit never parks the task inside the provider.
    pub async fn receive(&self, shutdown: &CancellationToken) -> Result<Bytes, SessionError> {
        let association = self.association.get().ok_or(SessionError::NotEstablished)?;
        let mut buf = vec![0u8; association.record.receive_limit()];
        loop {
            if self.state() == SessionState::Closed {
                return Err(SessionError::Closed);
            }
            if let Some((n, flags)) = association.record.receive_pending(&mut buf).await? {
                self.apply_record_flags(flags);
                return Ok(Bytes::copy_from_slice(&buf[..n]));
            }
            tokio::select! {
                permit = self.packets_received.acquire() => {
                    match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => return Err(SessionError::Closed),
                    }
                }
                _ = shutdown.cancelled() => return Err(SessionError::Closed),
                _ = self.queue.closed().cancelled() => return Err(SessionError::Closed),
            }
            if let Some((n, flags)) = association.record.receive(&mut buf, RECEIVE_POLL).await? {
                self.apply_record_flags(flags);
                return Ok(Bytes::copy_from_slice(&buf[..n]));
            }
        }
    }

    /// Commit a pending endpoint migration once the DTLS layer confirms a
    /// newest CID-protected record (RFC 9146 §6).
    fn apply_record_flags(&self, flags: RecordFlags) {
        if flags.is_newest && flags.uses_connection_id && self.has_connection_id() {
            if let Some((previous, current)) = self.endpoint.commit_pending() {
                tracing::info!(
                    %previous,
                    %current,
                    cid = %self.connection_id().map(hex::encode).unwrap_or_default(),
                    "session migrated to new endpoint"
                );
            }
        }
    }

    /// Encrypt and send one application payload to the current endpoint.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        if self.state() != SessionState::Established {
            return Err(SessionError::NotEstablished);
        }
        let association = self.association.get().ok_or(SessionError::NotEstablished)?;
        association.record.send(payload).await?;
        Ok(())
    }

    /// Close the session. Idempotent.
    ///
    /// When the peer is not to be notified (or no record exists yet), the
    /// queue transport closes first so the DTLS layer cannot emit an alert
    /// toward an endpoint that may since belong to someone else.
    pub async fn close(&self, notify_peer: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        let record = self.association.get().map(|a| a.record.clone());
        if !notify_peer || record.is_none() {
            self.queue.close();
        }
        if let Some(record) = record {
            record.close().await;
        }
        self.queue.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint.current())
            .field("state", &self.state())
            .field("cid", &self.connection_id().map(hex::encode))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stub record and session builders shared by the unit tests.

    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Record stub: serves queued payloads through `receive_pending`.
    #[derive(Default)]
    pub struct StubRecord {
        pub buffered: Mutex<VecDeque<(Vec<u8>, RecordFlags)>>,
    }

    #[async_trait]
    impl DtlsRecord for StubRecord {
        async fn receive_pending(
            &self,
            buf: &mut [u8],
        ) -> Result<Option<(usize, RecordFlags)>, RecordError> {
            match self.buffered.lock().unwrap().pop_front() {
                Some((payload, flags)) => {
                    buf[..payload.len()].copy_from_slice(&payload);
                    Ok(Some((payload.len(), flags)))
                }
                None => Ok(None),
            }
        }

        async fn receive(
            &self,
            buf: &mut [u8],
            _wait: Duration,
        ) -> Result<Option<(usize, RecordFlags)>, RecordError> {
            self.receive_pending(buf).await
        }

        async fn send(&self, _payload: &[u8]) -> Result<(), RecordError> {
            Ok(())
        }

        fn receive_limit(&self) -> usize {
            1472
        }

        async fn close(&self) {}
    }

    pub fn noop_send_fn() -> SendFn {
        Arc::new(|_, _| {})
    }

    pub fn handshaking_session(endpoint: SocketAddr) -> Arc<Session> {
        Session::new(endpoint, 1500, noop_send_fn())
    }

    pub fn established_session(endpoint: SocketAddr, cid: Option<&[u8]>) -> Arc<Session> {
        let session = handshaking_session(endpoint);
        session.install_association(Accepted {
            record: Arc::new(StubRecord::default()),
            connection_id: cid.map(Bytes::copy_from_slice),
            connection_info: None,
        });
        session
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        format!("172.0.0.11:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn send_before_established_fails() {
        let session = handshaking_session(endpoint(1111));
        assert!(matches!(
            session.send(b"payload").await,
            Err(SessionError::NotEstablished)
        ));
    }

    #[tokio::test]
    async fn receive_before_established_fails() {
        let session = handshaking_session(endpoint(1111));
        let shutdown = CancellationToken::new();
        assert!(matches!(
            session.receive(&shutdown).await,
            Err(SessionError::NotEstablished)
        ));
    }

    #[tokio::test]
    async fn receive_drains_buffered_records_first() {
        let session = handshaking_session(endpoint(1111));
        let record = Arc::new(StubRecord::default());
        record
            .buffered
            .lock()
            .unwrap()
            .push_back((b"payload".to_vec(), RecordFlags::default()));
        session.install_association(Accepted {
            record: record.clone(),
            connection_id: None,
            connection_info: None,
        });

        let shutdown = CancellationToken::new();
        let payload = session.receive(&shutdown).await.unwrap();
        assert_eq!(&payload[..], b"payload");
    }

    #[tokio::test]
    async fn receive_cancelled_by_shutdown() {
        let session = established_session(endpoint(1111), None);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(matches!(
            session.receive(&shutdown).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn migration_commits_only_on_newest_cid_record() {
        let session = handshaking_session(endpoint(1111));
        let record = Arc::new(StubRecord::default());
        session.install_association(Accepted {
            record: record.clone(),
            connection_id: Some(Bytes::from_static(b"\xde\xad\xbe\xef")),
            connection_info: None,
        });
        let buffer = |payload: &[u8], flags: RecordFlags| {
            record
                .buffered
                .lock()
                .unwrap()
                .push_back((payload.to_vec(), flags));
        };
        let shutdown = CancellationToken::new();

        // Datagram from a new source records the candidate but does not move
        // the endpoint.
        session.enqueue_datagram(Bytes::from_static(b"x"), endpoint(2222));
        assert_eq!(session.endpoint(), endpoint(1111));

        // A record that is not the newest leaves the endpoint alone.
        buffer(
            b"old",
            RecordFlags {
                is_newest: false,
                uses_connection_id: true,
            },
        );
        session.receive(&shutdown).await.unwrap();
        assert_eq!(session.endpoint(), endpoint(1111));

        // A newest CID-protected record commits the migration.
        session.enqueue_datagram(Bytes::from_static(b"y"), endpoint(2222));
        buffer(
            b"new",
            RecordFlags {
                is_newest: true,
                uses_connection_id: true,
            },
        );
        session.receive(&shutdown).await.unwrap();
        assert_eq!(session.endpoint(), endpoint(2222));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_enqueue() {
        let session = established_session(endpoint(1111), None);
        session.close(false).await;
        session.close(true).await;
        assert_eq!(session.state(), SessionState::Closed);
        session.enqueue_datagram(Bytes::from_static(b"late"), endpoint(1111));
        assert!(session.queue.is_empty());
    }
}
