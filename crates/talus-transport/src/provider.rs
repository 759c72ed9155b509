//! The seam to the external DTLS implementation.
//!
//! talus does not implement the DTLS record or handshake state machine.
//! It drives a provider through these traits: the provider reads and
//! writes one [`DatagramTransport`] per association (the session's queue
//! transport) and hands back a [`DtlsRecord`] once the handshake
//! completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Sentinel returned by [`DatagramTransport::receive`] when no datagram
/// was available within the wait budget or the transport has been closed.
///
/// Zero is reserved for a genuine zero-length datagram — the DTLS layer
/// treats a zero return as received data, which would bypass its
/// retransmit and abort logic.
pub const RECEIVE_NO_DATA: i32 = -1;

/// Flags the DTLS layer reports for each decrypted record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFlags {
    /// The record is the newest seen in epoch/sequence order.
    pub is_newest: bool,
    /// The record was protected with a Connection ID.
    pub uses_connection_id: bool,
}

/// Key/value facts a provider publishes about a completed handshake,
/// e.g. the authenticated PSK identity.
pub type ConnectionInfo = HashMap<String, String>;

/// Outcome of a successful handshake.
pub struct Accepted {
    /// Record-layer handle for the established association.
    pub record: Arc<dyn DtlsRecord>,
    /// Connection ID the peer will put on its records, if negotiated.
    pub connection_id: Option<Bytes>,
    /// Provider-published facts about the association.
    pub connection_info: Option<ConnectionInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("fatal TLS alert: {0}")]
    Tls(String),
    #[error("handshake failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The peer sent close_notify.
    #[error("peer closed the association")]
    PeerClosed,
    #[error("fatal alert: {0}")]
    Alert(String),
    /// The underlying datagram transport was closed locally.
    #[error("transport closed")]
    TransportClosed,
    #[error("{0}")]
    Other(String),
}

/// Server side of the handshake. The implementation owns its credentials
/// (certificates, PSK table); `accept` only needs the wire.
#[async_trait]
pub trait DtlsServerProtocol: Send + Sync + 'static {
    /// Drive one handshake to completion over `transport`. Blocks until
    /// the association is established or fails.
    async fn accept(&self, transport: Arc<dyn DatagramTransport>) -> Result<Accepted, AcceptError>;
}

/// An established DTLS association, as seen by the session that owns it.
#[async_trait]
pub trait DtlsRecord: Send + Sync + 'static {
    /// Return one record already buffered inside the DTLS layer, without
    /// touching the transport. `Ok(None)` when nothing is pending.
    async fn receive_pending(
        &self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, RecordFlags)>, RecordError>;

    /// Receive and decrypt one record, waiting at most `wait` for a
    /// datagram. `Ok(None)` on timeout.
    async fn receive(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<(usize, RecordFlags)>, RecordError>;

    /// Encrypt and send one application payload.
    async fn send(&self, payload: &[u8]) -> Result<(), RecordError>;

    /// Largest plaintext the record layer will deliver into `buf`.
    fn receive_limit(&self) -> usize;

    /// Close the association. Whether a close_notify alert reaches the
    /// peer depends on the transport still being open.
    async fn close(&self);
}

/// Datagram-level transport the provider reads and writes. Implemented by
/// the per-session queue transport.
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Dequeue one datagram into `buf` with a bounded wait. Returns the
    /// number of bytes copied, or [`RECEIVE_NO_DATA`] on timeout and on
    /// close — never zero for "no data".
    async fn receive(&self, buf: &mut [u8], wait: Duration) -> i32;

    /// Queue one datagram for the session's current remote endpoint.
    fn send(&self, datagram: &[u8]);

    /// Largest datagram the transport will deliver.
    fn receive_limit(&self) -> usize;

    /// Largest datagram the transport will accept for sending.
    fn send_limit(&self) -> usize;

    /// Whether [`DatagramTransport::close`] has run. Lets a provider tell
    /// a closed transport apart from an ordinary receive timeout — both
    /// surface as [`RECEIVE_NO_DATA`].
    fn is_closed(&self) -> bool;

    /// Cancel an in-progress receive and refuse further input.
    fn close(&self);
}
