//! The top-level UDP transport.
//!
//! Owns the socket and three long-running tasks: the inbound demux loop,
//! the outbound sender draining the shared send queue, and the idle
//! reaper. Every accepted ClientHello spawns one handler task that drives
//! its session's handshake and receive loop.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use talus_core::config::TalusConfig;
use talus_core::record;

use crate::provider::{AcceptError, ConnectionInfo, DtlsServerProtocol, RecordError};
use crate::queue::SendFn;
use crate::session::{Session, SessionError};
use crate::stats::{
    HandshakeOutcome, PacketClass, SessionSnapshot, TransportCounters, TransportStats,
    unix_seconds,
};
use crate::store::{FindResult, SessionStore};

/// Everything a request handler may need about the association a payload
/// arrived on.
pub struct RequestContext {
    local_endpoint: SocketAddr,
    session: Arc<Session>,
}

impl RequestContext {
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    /// The session's current remote endpoint — follows migrations.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.session.endpoint()
    }

    /// Provider-published facts, e.g. the authenticated PSK identity.
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.session.connection_info()
    }

    /// Encrypt and send a response over the same association.
    pub async fn reply(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.session.send(payload).await
    }
}

/// Application-supplied handler for decrypted payloads.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn process_request(&self, context: RequestContext, payload: Bytes);
}

/// Tuning knobs for a bound transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// UDP port to bind. 0 picks an ephemeral port.
    pub port: u16,
    /// Outbound MTU budget in bytes.
    pub mtu: usize,
    /// Inactivity limit for sessions without a connection ID.
    pub session_timeout: Duration,
    /// Inactivity limit for sessions with a connection ID.
    pub session_timeout_with_cid: Duration,
    /// Cap on concurrently handshaking sessions.
    pub max_simultaneous_handshakes: usize,
    /// How often the idle reaper scans.
    pub reaper_interval: Duration,
    /// How long unbind waits for queued sends to flush.
    pub drain_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            port: 5684,
            mtu: 1500,
            session_timeout: Duration::from_secs(3600),
            session_timeout_with_cid: Duration::from_secs(3600),
            max_simultaneous_handshakes: 1000,
            reaper_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&TalusConfig> for TransportOptions {
    fn from(config: &TalusConfig) -> Self {
        Self {
            port: config.network.port,
            mtu: config.network.mtu,
            session_timeout: config.sessions.timeout(),
            session_timeout_with_cid: config.sessions.timeout_with_cid(),
            max_simultaneous_handshakes: config.sessions.max_handshakes,
            reaper_interval: config.sessions.reaper_interval(),
            drain_timeout: config.sessions.drain_timeout(),
        }
    }
}

/// The bound transport. Construct with [`DtlsTransport::bind`]; tear down
/// with [`DtlsTransport::unbind`].
pub struct DtlsTransport {
    inner: Arc<Inner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
    store: SessionStore,
    counters: TransportCounters,
    options: TransportOptions,
    protocol: Arc<dyn DtlsServerProtocol>,
    handler: Arc<dyn RequestHandler>,
    send_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    pending_sends: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    /// Handler tasks of live sessions; unbind waits for their teardown.
    session_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DtlsTransport {
    /// Bind a dual-stack IPv6 UDP socket and start the transport tasks.
    pub async fn bind(
        options: TransportOptions,
        protocol: Arc<dyn DtlsServerProtocol>,
        handler: Arc<dyn RequestHandler>,
    ) -> io::Result<Self> {
        let socket = make_socket(options.port)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let local_endpoint = socket.local_addr()?;

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            socket,
            local_endpoint,
            store: SessionStore::new(),
            counters: TransportCounters::default(),
            options,
            protocol,
            handler,
            send_tx,
            pending_sends: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            session_tasks: std::sync::Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(inner.clone().inbound_loop()),
            tokio::spawn(inner.clone().outbound_loop(send_rx)),
            tokio::spawn(inner.clone().reaper_loop()),
        ];

        tracing::info!(endpoint = %local_endpoint, "DTLS transport bound");
        Ok(Self {
            inner,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.inner.local_endpoint
    }

    pub fn session_count(&self) -> usize {
        self.inner.store.count()
    }

    /// Point-in-time statistics: live sessions and the counter bundle.
    pub fn stats(&self) -> TransportStats {
        let sessions = self
            .inner
            .store
            .sessions()
            .iter()
            .map(|session| SessionSnapshot {
                endpoint: session.endpoint().to_string(),
                connection_info: session.connection_info().cloned(),
                session_start_unix: unix_seconds(session.session_start_time()),
                last_received_unix: unix_seconds(session.last_received_time()),
                has_connection_id: session.has_connection_id(),
            })
            .collect();
        TransportStats {
            sessions,
            counters: self.inner.counters.snapshot(),
        }
    }

    /// Close every session (notifying peers), flush queued sends, stop the
    /// tasks and release the socket.
    pub async fn unbind(&self) {
        tracing::info!(endpoint = %self.inner.local_endpoint, "unbinding DTLS transport");
        for session in self.inner.store.sessions() {
            session.close(true).await;
        }
        let deadline = tokio::time::Instant::now() + self.inner.options.drain_timeout;
        while self.inner.pending_sends.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        // The handler tasks hold the last session references and run the
        // store-removal teardown; the socket is not released until every
        // one has exited.
        let session_tasks = std::mem::take(&mut *self.inner.session_tasks.lock().unwrap());
        for task in session_tasks {
            let _ = task.await;
        }
    }
}

impl Drop for DtlsTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn inbound_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("inbound task stopping");
                    return;
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (len, source) = match result {
                        Ok(r) => r,
                        // Windows reports an ICMP port-unreachable for an
                        // earlier send as a reset on recv_from. The dead
                        // flow is identified by its missing keep-alives and
                        // reaped later.
                        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                            tracing::debug!(error = %e, "ignoring connection reset");
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    if let Some(session) = self.route_datagram(datagram, source) {
                        let inner = self.clone();
                        let task = tokio::spawn(async move { inner.run_session(session).await });
                        let mut tasks = self.session_tasks.lock().unwrap();
                        tasks.retain(|task| !task.is_finished());
                        tasks.push(task);
                    }
                }
            }
        }
    }

    /// Classify one datagram. Returns a session only when a new handshake
    /// was started and needs its handler task spawned.
    fn route_datagram(&self, datagram: Bytes, source: SocketAddr) -> Option<Arc<Session>> {
        let cid = self
            .store
            .connection_id_length()
            .and_then(|len| record::try_get_connection_id(&datagram, len))
            .map(Bytes::copy_from_slice);

        match self.store.try_find(source, cid.as_deref()) {
            Ok(FindResult::FoundByEndpoint(session)) => {
                session.enqueue_datagram(datagram, source);
                self.counters.record_received(PacketClass::ByEndpoint);
                None
            }
            Ok(FindResult::FoundByConnectionId(session)) => {
                session.enqueue_datagram(datagram, source);
                self.counters.record_received(PacketClass::ByConnectionId);
                None
            }
            Ok(FindResult::NotFound) => {
                if cid.is_some() {
                    tracing::debug!(%source, "datagram with unknown connection ID dropped");
                    self.counters.record_received(PacketClass::UnknownCid);
                    None
                } else if record::may_be_client_hello(&datagram) {
                    self.start_session(datagram, source)
                } else {
                    tracing::trace!(%source, len = datagram.len(), "unclassifiable datagram dropped");
                    self.counters.record_received(PacketClass::Invalid);
                    None
                }
            }
            Err(e) => {
                tracing::warn!(%source, error = %e, "session lookup failed, dropping datagram");
                self.counters.record_received(PacketClass::Invalid);
                None
            }
        }
    }

    fn start_session(&self, datagram: Bytes, source: SocketAddr) -> Option<Arc<Session>> {
        if self.store.accepting_count() >= self.options.max_simultaneous_handshakes {
            tracing::warn!(%source, "handshake capacity reached, dropping ClientHello");
            self.counters.record_received(PacketClass::Invalid);
            return None;
        }

        let send_tx = self.send_tx.clone();
        let pending = self.pending_sends.clone();
        let send_fn: SendFn = Arc::new(move |bytes, target| {
            pending.fetch_add(1, Ordering::AcqRel);
            if send_tx.send((bytes, target)).is_err() {
                pending.fetch_sub(1, Ordering::AcqRel);
            }
        });

        let session = Session::new(source, self.options.mtu, send_fn);
        if let Err(e) = self.store.add(session.clone()) {
            // Lost a race with another datagram from the same endpoint.
            tracing::debug!(%source, error = %e, "not starting session");
            return None;
        }
        self.counters.record_received(PacketClass::NewSession);
        session.enqueue_datagram(datagram, source);
        tracing::debug!(%source, "new session handshaking");
        Some(session)
    }

    /// Handler task: one per session, from ClientHello to teardown.
    async fn run_session(self: Arc<Self>, session: Arc<Session>) {
        let endpoint = session.initial_endpoint();
        match session.accept(self.protocol.as_ref()).await {
            Ok(()) => {
                self.counters.record_handshake(HandshakeOutcome::Success);
                match self.store.notify_session_accepted(&session) {
                    Ok(()) => {
                        tracing::info!(
                            %endpoint,
                            cid = %session.connection_id().map(hex::encode).unwrap_or_default(),
                            "session established"
                        );
                        self.serve_session(&session).await;
                    }
                    Err(e) => {
                        // Duplicate CID or endpoint: drop this session and
                        // let the peer retry its handshake.
                        tracing::warn!(%endpoint, error = %e, "rejecting accepted session");
                    }
                }
            }
            Err(e) => {
                let outcome = match &e {
                    AcceptError::TimedOut => HandshakeOutcome::TimedOut,
                    AcceptError::Tls(_) => HandshakeOutcome::TlsError,
                    AcceptError::Other(_) => HandshakeOutcome::Error,
                };
                self.counters.record_handshake(outcome);
                tracing::debug!(%endpoint, error = %e, "handshake failed");
            }
        }

        // Single exit path for every termination cause: eviction, peer
        // close, fatal error, shutdown.
        self.store.remove(&session);
        session.close(false).await;
        tracing::debug!(
            %endpoint,
            uptime_secs = session.uptime().as_secs(),
            "session finished"
        );
    }

    async fn serve_session(&self, session: &Arc<Session>) {
        loop {
            let payload = match session.receive(&self.shutdown).await {
                Ok(payload) => payload,
                Err(SessionError::Closed) => {
                    tracing::debug!(endpoint = %session.endpoint(), "session receive cancelled");
                    return;
                }
                Err(SessionError::Record(RecordError::PeerClosed)) => {
                    tracing::debug!(endpoint = %session.endpoint(), "peer closed session");
                    return;
                }
                Err(e) => {
                    tracing::debug!(endpoint = %session.endpoint(), error = %e, "session receive failed");
                    return;
                }
            };
            let context = RequestContext {
                local_endpoint: self.local_endpoint,
                session: session.clone(),
            };
            self.handler.process_request(context, payload).await;
        }
    }

    async fn outbound_loop(
        self: Arc<Self>,
        mut send_rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("outbound task stopping");
                    return;
                }
                item = send_rx.recv() => {
                    let Some((datagram, target)) = item else { return };
                    match self.socket.send_to(&datagram, target).await {
                        Ok(_) => self.counters.record_sent(),
                        Err(e) => tracing::warn!(%target, error = %e, "send_to failed"),
                    }
                    self.pending_sends.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.reaper_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("reaper task stopping");
                    return;
                }
                _ = interval.tick() => self.reap_idle().await,
            }
        }
    }

    async fn reap_idle(&self) {
        for session in self.store.sessions() {
            let limit = if session.has_connection_id() {
                self.options.session_timeout_with_cid
            } else {
                self.options.session_timeout
            };
            if session.idle_for() >= limit {
                // With a CID the original endpoint may since have been
                // reused by an unrelated party, so no alert is sent there.
                let notify_peer = !session.has_connection_id();
                tracing::info!(
                    endpoint = %session.endpoint(),
                    idle_secs = session.idle_for().as_secs(),
                    "evicting idle session"
                );
                session.close(notify_peer).await;
            }
        }
    }
}

/// Dual-stack IPv6 UDP socket, nonblocking for tokio.
fn make_socket(port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}
