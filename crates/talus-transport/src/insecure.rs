//! Null-encryption development provider.
//!
//! Implements the DTLS provider surface with DTLS-shaped records — real
//! content types, epoch and 48-bit sequence numbers, the RFC 9146 CID
//! record layout — but no cryptography, in the spirit of CoAP's NoSec
//! mode. The handshake is a single ClientHello / acknowledgement exchange
//! that verifies a PSK identity against a configured table.
//!
//! Used by talusd for local development and by the test suite to exercise
//! the demultiplexer end to end over real sockets. Not interoperable with
//! any actual DTLS peer.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use tokio::net::UdpSocket;

use talus_core::record::{
    CONTENT_TYPE_ALERT, CONTENT_TYPE_APPLICATION_DATA, CONTENT_TYPE_HANDSHAKE,
    CONTENT_TYPE_TLS12_CID, HANDSHAKE_CLIENT_HELLO, RECORD_HEADER_LEN,
};

use crate::provider::{
    Accepted, AcceptError, ConnectionInfo, DatagramTransport, DtlsRecord, DtlsServerProtocol,
    RecordError, RecordFlags,
};

const DTLS_VERSION: [u8; 2] = [254, 253]; // DTLS 1.2
const HANDSHAKE_SERVER_ACK: u8 = 2;
const HANDSHAKE_HEADER_LEN: usize = 12;
const ALERT_LEVEL_WARNING: u8 = 1;
const ALERT_LEVEL_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;
const ALERT_HANDSHAKE_FAILURE: u8 = 40;
/// Epoch stamped on records once the handshake is done.
const DATA_EPOCH: u16 = 1;

/// Slice of the handshake timeout spent per transport poll.
const HANDSHAKE_POLL: Duration = Duration::from_millis(500);

/// PSK identity → key table.
#[derive(Debug, Clone, Default)]
pub struct PskTable {
    entries: HashMap<String, Vec<u8>>,
}

impl PskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: impl Into<String>, key: impl Into<Vec<u8>>) {
        self.entries.insert(identity.into(), key.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_for(&self, identity: &str) -> Option<&[u8]> {
        self.entries.get(identity).map(|key| key.as_slice())
    }
}

/// The server side of the null-encryption handshake.
pub struct InsecureServerProtocol {
    psk: PskTable,
    cid_length: usize,
    handshake_timeout: Duration,
}

impl InsecureServerProtocol {
    pub fn new(psk: PskTable) -> Self {
        Self {
            psk,
            cid_length: 6,
            handshake_timeout: Duration::from_secs(15),
        }
    }

    /// Length of the connection IDs this server assigns.
    pub fn with_cid_length(mut self, length: usize) -> Self {
        self.cid_length = length;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl DtlsServerProtocol for InsecureServerProtocol {
    async fn accept(&self, transport: Arc<dyn DatagramTransport>) -> Result<Accepted, AcceptError> {
        let mut buf = vec![0u8; transport.receive_limit()];
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        let hello = loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(AcceptError::TimedOut);
            }
            let n = transport.receive(&mut buf, HANDSHAKE_POLL).await;
            if n < 0 {
                if transport.is_closed() {
                    return Err(AcceptError::Other("transport closed".into()));
                }
                continue;
            }
            let mut datagram = Bytes::copy_from_slice(&buf[..n as usize]);
            let record = match decode_record(&mut datagram, 0) {
                Ok(Some(record)) => record,
                _ => continue,
            };
            if record.content_type != CONTENT_TYPE_HANDSHAKE {
                continue;
            }
            match decode_client_hello(&record.payload) {
                Some(hello) => break hello,
                None => return Err(AcceptError::Other("malformed ClientHello".into())),
            }
        };

        let Some(expected_key) = self.psk.key_for(&hello.identity) else {
            transport.send(&handshake_failure_alert());
            return Err(AcceptError::Tls(format!(
                "unknown PSK identity {:?}",
                hello.identity
            )));
        };
        if expected_key != hello.key {
            transport.send(&handshake_failure_alert());
            return Err(AcceptError::Tls("PSK verification failed".into()));
        }

        let connection_id = hello.request_cid.then(|| random_cid(self.cid_length));
        transport.send(&encode_hello_ack(connection_id.as_ref()));

        let mut info = ConnectionInfo::new();
        info.insert("psk_identity".to_string(), hello.identity);
        let record = InsecureRecord::new(transport, connection_id.clone());
        Ok(Accepted {
            record: Arc::new(record),
            connection_id,
            connection_info: Some(info),
        })
    }
}

/// An established null-encryption association.
pub struct InsecureRecord {
    transport: Arc<dyn DatagramTransport>,
    connection_id: Option<Bytes>,
    /// Highest (epoch, sequence) seen; drives [`RecordFlags::is_newest`].
    highest: Mutex<Option<(u16, u64)>>,
    send_seq: AtomicU64,
    buffered: Mutex<VecDeque<(Bytes, RecordFlags)>>,
    closed: AtomicBool,
}

impl InsecureRecord {
    fn new(transport: Arc<dyn DatagramTransport>, connection_id: Option<Bytes>) -> Self {
        Self {
            transport,
            connection_id,
            highest: Mutex::new(None),
            send_seq: AtomicU64::new(0),
            buffered: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn note_sequence(&self, epoch: u16, sequence: u64) -> bool {
        let mut highest = self.highest.lock().unwrap();
        let newest = match *highest {
            Some(seen) => (epoch, sequence) > seen,
            None => true,
        };
        if newest {
            *highest = Some((epoch, sequence));
        }
        newest
    }

    fn pop_buffered(&self, buf: &mut [u8]) -> Option<(usize, RecordFlags)> {
        let (payload, flags) = self.buffered.lock().unwrap().pop_front()?;
        buf[..payload.len()].copy_from_slice(&payload);
        Some((payload.len(), flags))
    }

    /// Split one datagram into deliverable application payloads. An alert
    /// ends the association immediately.
    fn decode_datagram(&self, datagram: &[u8]) -> Result<Vec<(Bytes, RecordFlags)>, RecordError> {
        let cid_len = self.connection_id.as_ref().map_or(0, |cid| cid.len());
        let mut buf = Bytes::copy_from_slice(datagram);
        let mut out = Vec::new();
        loop {
            let record = match decode_record(&mut buf, cid_len) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed record");
                    break;
                }
            };
            match record.content_type {
                CONTENT_TYPE_TLS12_CID => {
                    // The real content type of a CID record rides inside
                    // the protected payload.
                    let Some((&inner, data)) = record.payload.split_first() else {
                        continue;
                    };
                    let flags = RecordFlags {
                        is_newest: self.note_sequence(record.epoch, record.sequence),
                        uses_connection_id: true,
                    };
                    match inner {
                        CONTENT_TYPE_APPLICATION_DATA => {
                            out.push((Bytes::copy_from_slice(data), flags));
                        }
                        CONTENT_TYPE_ALERT => return Err(alert_error(data)),
                        _ => {}
                    }
                }
                CONTENT_TYPE_APPLICATION_DATA => {
                    let flags = RecordFlags {
                        is_newest: self.note_sequence(record.epoch, record.sequence),
                        uses_connection_id: false,
                    };
                    out.push((record.payload, flags));
                }
                CONTENT_TYPE_ALERT => return Err(alert_error(&record.payload)),
                // Retransmitted handshake flight; the association already
                // exists, nothing to do.
                CONTENT_TYPE_HANDSHAKE => {}
                _ => {}
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DtlsRecord for InsecureRecord {
    async fn receive_pending(
        &self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, RecordFlags)>, RecordError> {
        Ok(self.pop_buffered(buf))
    }

    async fn receive(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<(usize, RecordFlags)>, RecordError> {
        if let Some(delivery) = self.pop_buffered(buf) {
            return Ok(Some(delivery));
        }
        let deadline = tokio::time::Instant::now() + wait;
        let mut datagram = vec![0u8; self.transport.receive_limit()];
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let n = self.transport.receive(&mut datagram, deadline - now).await;
            if n < 0 {
                return Ok(None);
            }
            let mut records = self.decode_datagram(&datagram[..n as usize])?;
            if records.is_empty() {
                continue;
            }
            let (payload, flags) = records.remove(0);
            buf[..payload.len()].copy_from_slice(&payload);
            self.buffered.lock().unwrap().extend(records);
            return Ok(Some((payload.len(), flags)));
        }
    }

    async fn send(&self, payload: &[u8]) -> Result<(), RecordError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RecordError::TransportClosed);
        }
        let sequence = self.send_seq.fetch_add(1, Ordering::Relaxed);
        let record = encode_record(
            CONTENT_TYPE_APPLICATION_DATA,
            None,
            DATA_EPOCH,
            sequence,
            payload,
        );
        self.transport.send(&record);
        Ok(())
    }

    fn receive_limit(&self) -> usize {
        let cid_len = self.connection_id.as_ref().map_or(0, |cid| cid.len());
        self.transport
            .receive_limit()
            .saturating_sub(RECORD_HEADER_LEN + cid_len)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sequence = self.send_seq.fetch_add(1, Ordering::Relaxed);
        let alert = encode_record(
            CONTENT_TYPE_ALERT,
            None,
            DATA_EPOCH,
            sequence,
            &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY],
        );
        // Dropped on the floor if the queue transport closed first.
        self.transport.send(&alert);
        self.transport.close();
    }
}

fn handshake_failure_alert() -> Bytes {
    encode_record(
        CONTENT_TYPE_ALERT,
        None,
        0,
        2,
        &[ALERT_LEVEL_FATAL, ALERT_HANDSHAKE_FAILURE],
    )
}

fn alert_error(payload: &[u8]) -> RecordError {
    match payload.get(1) {
        Some(&ALERT_CLOSE_NOTIFY) => RecordError::PeerClosed,
        Some(description) => RecordError::Alert(format!("alert {description}")),
        None => RecordError::Other("empty alert".into()),
    }
}

fn random_cid(length: usize) -> Bytes {
    let mut cid = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut cid);
    Bytes::from(cid)
}

// ── Wire encoding ─────────────────────────────────────────────────────────────

struct WireRecord {
    content_type: u8,
    epoch: u16,
    sequence: u64,
    payload: Bytes,
}

fn encode_record(
    content_type: u8,
    cid: Option<&Bytes>,
    epoch: u16,
    sequence: u64,
    payload: &[u8],
) -> Bytes {
    let cid_len = cid.map_or(0, |cid| cid.len());
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + cid_len + payload.len());
    buf.put_u8(content_type);
    buf.put_slice(&DTLS_VERSION);
    buf.put_u16(epoch);
    buf.put_uint(sequence, 6);
    if let Some(cid) = cid {
        buf.put_slice(cid);
    }
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode one record off the front of `buf`. `Ok(None)` when empty.
fn decode_record(buf: &mut Bytes, cid_len: usize) -> Result<Option<WireRecord>, RecordError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let content_type = buf.chunk()[0];
    let header_len = if content_type == CONTENT_TYPE_TLS12_CID {
        RECORD_HEADER_LEN + cid_len
    } else {
        RECORD_HEADER_LEN
    };
    if buf.len() < header_len {
        return Err(RecordError::Other("truncated record header".into()));
    }
    buf.advance(1);
    let _version = buf.get_u16();
    let epoch = buf.get_u16();
    let sequence = buf.get_uint(6);
    if content_type == CONTENT_TYPE_TLS12_CID {
        // The demux already matched the CID; only its length matters here.
        buf.advance(cid_len);
    }
    let length = buf.get_u16() as usize;
    if buf.remaining() < length {
        return Err(RecordError::Other("truncated record payload".into()));
    }
    let payload = buf.split_to(length);
    Ok(Some(WireRecord {
        content_type,
        epoch,
        sequence,
        payload,
    }))
}

struct HelloRequest {
    request_cid: bool,
    identity: String,
    key: Vec<u8>,
}

fn encode_client_hello(identity: &str, key: &[u8], request_cid: bool) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(request_cid as u8);
    body.put_u16(identity.len() as u16);
    body.put_slice(identity.as_bytes());
    body.put_u16(key.len() as u16);
    body.put_slice(key);
    let message = encode_handshake(HANDSHAKE_CLIENT_HELLO, &body);
    encode_record(CONTENT_TYPE_HANDSHAKE, None, 0, 0, &message)
}

fn encode_hello_ack(cid: Option<&Bytes>) -> Bytes {
    let mut body = BytesMut::new();
    match cid {
        Some(cid) => {
            body.put_u8(cid.len() as u8);
            body.put_slice(cid);
        }
        None => body.put_u8(0),
    }
    let message = encode_handshake(HANDSHAKE_SERVER_ACK, &body);
    encode_record(CONTENT_TYPE_HANDSHAKE, None, 0, 1, &message)
}

fn encode_handshake(message_type: u8, body: &[u8]) -> Bytes {
    let mut message = BytesMut::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    message.put_u8(message_type);
    message.put_uint(body.len() as u64, 3);
    message.put_u16(0); // message_seq
    message.put_uint(0, 3); // fragment_offset
    message.put_uint(body.len() as u64, 3); // fragment_length
    message.put_slice(body);
    message.freeze()
}

fn decode_client_hello(payload: &[u8]) -> Option<HelloRequest> {
    let mut buf = payload;
    if buf.remaining() < HANDSHAKE_HEADER_LEN {
        return None;
    }
    if buf.get_u8() != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    buf.advance(HANDSHAKE_HEADER_LEN - 1);
    if buf.remaining() < 3 {
        return None;
    }
    let request_cid = buf.get_u8() != 0;
    let identity_len = buf.get_u16() as usize;
    if buf.remaining() < identity_len + 2 {
        return None;
    }
    let identity = String::from_utf8(buf.copy_to_bytes(identity_len).to_vec()).ok()?;
    let key_len = buf.get_u16() as usize;
    if buf.remaining() < key_len {
        return None;
    }
    let key = buf.copy_to_bytes(key_len).to_vec();
    Some(HelloRequest {
        request_cid,
        identity,
        key,
    })
}

fn decode_hello_ack(payload: &[u8]) -> Option<Option<Bytes>> {
    let mut buf = payload;
    if buf.remaining() < HANDSHAKE_HEADER_LEN {
        return None;
    }
    if buf.get_u8() != HANDSHAKE_SERVER_ACK {
        return None;
    }
    buf.advance(HANDSHAKE_HEADER_LEN - 1);
    if buf.remaining() < 1 {
        return None;
    }
    let cid_len = buf.get_u8() as usize;
    if cid_len == 0 {
        return Some(None);
    }
    if buf.remaining() < cid_len {
        return None;
    }
    Some(Some(buf.copy_to_bytes(cid_len)))
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Minimal client for the null-encryption protocol. Exists for the test
/// suite and local experiments; rebinding its socket simulates a roaming
/// peer.
pub struct InsecureClient {
    socket: UdpSocket,
    server: SocketAddr,
    connection_id: Option<Bytes>,
    sequence: u64,
}

const CLIENT_HANDSHAKE_WAIT: Duration = Duration::from_secs(3);

impl InsecureClient {
    /// Handshake with `server`, optionally requesting a connection ID.
    pub async fn connect(
        server: SocketAddr,
        identity: &str,
        key: &[u8],
        request_cid: bool,
    ) -> anyhow::Result<Self> {
        let socket = bind_client_socket(&server).await?;
        socket
            .send_to(&encode_client_hello(identity, key, request_cid), server)
            .await?;

        let mut buf = vec![0u8; 2048];
        let deadline = tokio::time::Instant::now() + CLIENT_HANDSHAKE_WAIT;
        let connection_id = loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                anyhow::bail!("timed out waiting for handshake ack");
            }
            let Ok(result) = tokio::time::timeout(deadline - now, socket.recv_from(&mut buf)).await
            else {
                anyhow::bail!("timed out waiting for handshake ack");
            };
            let (n, _) = result?;
            let mut datagram = Bytes::copy_from_slice(&buf[..n]);
            let Ok(Some(record)) = decode_record(&mut datagram, 0) else {
                continue;
            };
            match record.content_type {
                CONTENT_TYPE_HANDSHAKE => match decode_hello_ack(&record.payload) {
                    Some(cid) => break cid,
                    None => continue,
                },
                CONTENT_TYPE_ALERT => anyhow::bail!("handshake rejected by server"),
                _ => continue,
            }
        };

        Ok(Self {
            socket,
            server,
            connection_id,
            sequence: 0,
        })
    }

    pub fn connection_id(&self) -> Option<&Bytes> {
        self.connection_id.as_ref()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Move to a fresh socket, as a roaming peer would. The connection ID
    /// and sequence numbers carry over.
    pub async fn rebind(&mut self) -> anyhow::Result<()> {
        self.socket = bind_client_socket(&self.server).await?;
        Ok(())
    }

    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let record = self.encode_outbound(CONTENT_TYPE_APPLICATION_DATA, payload);
        self.socket.send_to(&record, self.server).await?;
        Ok(())
    }

    pub async fn recv(&mut self, wait: Duration) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; 2048];
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                anyhow::bail!("timed out waiting for response");
            }
            let Ok(result) = tokio::time::timeout(deadline - now, self.socket.recv_from(&mut buf))
            .await
            else {
                anyhow::bail!("timed out waiting for response");
            };
            let (n, _) = result?;
            let mut datagram = Bytes::copy_from_slice(&buf[..n]);
            let Ok(Some(record)) = decode_record(&mut datagram, 0) else {
                continue;
            };
            match record.content_type {
                CONTENT_TYPE_APPLICATION_DATA => return Ok(record.payload),
                CONTENT_TYPE_ALERT => anyhow::bail!("server closed the session"),
                _ => continue,
            }
        }
    }

    /// Send close_notify. Best effort, as on a real datagram transport.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        let record =
            self.encode_outbound(CONTENT_TYPE_ALERT, &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY]);
        self.socket.send_to(&record, self.server).await?;
        Ok(())
    }

    /// Sessions with a CID wrap every outbound record in a tls12_cid
    /// record; the real content type rides in the protected payload.
    fn encode_outbound(&mut self, content_type: u8, payload: &[u8]) -> Bytes {
        let sequence = self.sequence;
        self.sequence += 1;
        match &self.connection_id {
            Some(cid) => {
                let mut inner = BytesMut::with_capacity(1 + payload.len());
                inner.put_u8(content_type);
                inner.put_slice(payload);
                encode_record(
                    CONTENT_TYPE_TLS12_CID,
                    Some(cid),
                    DATA_EPOCH,
                    sequence,
                    &inner,
                )
            }
            None => encode_record(content_type, None, DATA_EPOCH, sequence, payload),
        }
    }
}

async fn bind_client_socket(server: &SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr: SocketAddr = if server.is_ipv6() {
        "[::]:0".parse().expect("static address")
    } else {
        "0.0.0.0:0".parse().expect("static address")
    };
    UdpSocket::bind(bind_addr).await
}
