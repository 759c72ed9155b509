//! Per-session datagram queue.
//!
//! Bridges the shared UDP demux loop, which pushes datagrams
//! asynchronously, to the DTLS layer, which pulls them with a bounded
//! wait. One queue transport exists per session and lives exactly as long
//! as the session does.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::provider::{DatagramTransport, RECEIVE_NO_DATA};

/// IPv4 header bytes assumed by the receive budget.
const IP_HEADER: usize = 20;
/// UDP header bytes.
const UDP_HEADER: usize = 8;
/// Headroom reserved on the send path for IP options.
const IP_OPTIONS_BUDGET: usize = 64;

/// Shared send path: hands an encrypted datagram and its target to the
/// transport's outbound queue.
pub type SendFn = Arc<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

/// Endpoint bookkeeping shared between a session and its queue transport.
///
/// `current` is where outbound datagrams go. `pending` tracks the source
/// of the most recent inbound datagram when it differs from `current`;
/// the session commits it only once the DTLS layer confirms a newest
/// CID-protected record (RFC 9146 §6). Until then responses keep going to
/// the pre-migration endpoint. A datagram from `current` clears the
/// candidate: the committed migration target must be the source of the
/// datagram whose record satisfied the rule, never a leftover from an
/// earlier stray.
#[derive(Debug)]
pub struct EndpointState {
    initial: SocketAddr,
    current: RwLock<SocketAddr>,
    pending: Mutex<Option<SocketAddr>>,
}

impl EndpointState {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            initial: endpoint,
            current: RwLock::new(endpoint),
            pending: Mutex::new(None),
        }
    }

    /// Endpoint the first ClientHello arrived from.
    pub fn initial(&self) -> SocketAddr {
        self.initial
    }

    /// Endpoint outbound datagrams currently target.
    pub fn current(&self) -> SocketAddr {
        *self.current.read().unwrap()
    }

    /// Record the source of an inbound datagram as the migration
    /// candidate. A datagram from the current endpoint resets it, so a
    /// stale candidate from an old or spoofed datagram cannot ride a
    /// later record that actually arrived from `current`.
    pub fn note_source(&self, source: SocketAddr) {
        *self.pending.lock().unwrap() = (source != self.current()).then_some(source);
    }

    /// Commit the pending candidate. Returns `(previous, new)` when the
    /// endpoint actually changed.
    pub fn commit_pending(&self) -> Option<(SocketAddr, SocketAddr)> {
        let next = self.pending.lock().unwrap().take()?;
        let mut current = self.current.write().unwrap();
        if *current == next {
            return None;
        }
        let previous = *current;
        *current = next;
        Some((previous, next))
    }
}

/// The in-memory datagram transport handed to the DTLS provider.
pub struct QueueTransport {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: CancellationToken,
    endpoint: Arc<EndpointState>,
    send_fn: SendFn,
    mtu: usize,
}

impl QueueTransport {
    pub fn new(endpoint: Arc<EndpointState>, mtu: usize, send_fn: SendFn) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: CancellationToken::new(),
            endpoint,
            send_fn,
            mtu,
        }
    }

    /// Append one inbound datagram. Silently dropped after close — DTLS
    /// retransmission recovers anything the peer still cares about.
    pub fn enqueue_received(&self, datagram: Bytes, source: SocketAddr) {
        if self.closed.is_cancelled() {
            tracing::trace!(%source, "datagram for closed transport dropped");
            return;
        }
        self.endpoint.note_source(source);
        self.queue.lock().unwrap().push_back(datagram);
        self.notify.notify_one();
    }

    /// Number of datagrams waiting to be pulled.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token cancelled once the transport is closed. Observed by the
    /// session's receive loop.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

#[async_trait]
impl DatagramTransport for QueueTransport {
    async fn receive(&self, buf: &mut [u8], wait: Duration) -> i32 {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register for wakeup before checking the queue, so an enqueue
            // racing this check leaves a stored permit rather than a lost
            // notification.
            let notified = self.notify.notified();
            if let Some(datagram) = self.queue.lock().unwrap().pop_front() {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                return n as i32;
            }
            if self.closed.is_cancelled() {
                return RECEIVE_NO_DATA;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.closed.cancelled() => return RECEIVE_NO_DATA,
                _ = tokio::time::sleep_until(deadline) => return RECEIVE_NO_DATA,
            }
        }
    }

    fn send(&self, datagram: &[u8]) {
        (self.send_fn)(Bytes::copy_from_slice(datagram), self.endpoint.current());
    }

    fn receive_limit(&self) -> usize {
        self.mtu - IP_HEADER - UDP_HEADER
    }

    fn send_limit(&self) -> usize {
        self.mtu - IP_HEADER - IP_OPTIONS_BUDGET - UDP_HEADER
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn close(&self) {
        self.closed.cancel();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn endpoint(port: u16) -> SocketAddr {
        format!("172.0.0.11:{port}").parse().unwrap()
    }

    fn transport() -> (Arc<QueueTransport>, Arc<StdMutex<Vec<(Bytes, SocketAddr)>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = sent.clone();
        let send_fn: SendFn = Arc::new(move |bytes, target| {
            sink.lock().unwrap().push((bytes, target));
        });
        let state = Arc::new(EndpointState::new(endpoint(1111)));
        (Arc::new(QueueTransport::new(state, 1500, send_fn)), sent)
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (queue, _) = transport();
        queue.enqueue_received(Bytes::from_static(b"one"), endpoint(1111));
        queue.enqueue_received(Bytes::from_static(b"two"), endpoint(1111));

        let mut buf = [0u8; 16];
        let n = queue.receive(&mut buf, Duration::from_millis(10)).await;
        assert_eq!(&buf[..n as usize], b"one");
        let n = queue.receive(&mut buf, Duration::from_millis(10)).await;
        assert_eq!(&buf[..n as usize], b"two");
    }

    #[tokio::test]
    async fn timeout_returns_sentinel_not_zero() {
        let (queue, _) = transport();
        let mut buf = [0u8; 16];
        let n = queue.receive(&mut buf, Duration::from_millis(5)).await;
        assert_eq!(n, RECEIVE_NO_DATA);
    }

    #[tokio::test]
    async fn close_cancels_blocked_receive() {
        let (queue, _) = transport();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                queue.receive(&mut buf, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), RECEIVE_NO_DATA);
    }

    #[tokio::test]
    async fn enqueue_after_close_is_dropped() {
        let (queue, _) = transport();
        queue.close();
        queue.enqueue_received(Bytes::from_static(b"late"), endpoint(1111));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn receive_races_with_concurrent_enqueue() {
        let (queue, _) = transport();
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                queue.receive(&mut buf, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue_received(Bytes::from_static(b"ping"), endpoint(1111));
        assert_eq!(reader.await.unwrap(), 4);
    }

    #[test]
    fn send_targets_current_endpoint() {
        let (queue, sent) = transport();
        queue.send(b"payload");
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, endpoint(1111));
    }

    #[test]
    fn mtu_budgets() {
        let (queue, _) = transport();
        assert_eq!(queue.receive_limit(), 1500 - 20 - 8);
        assert_eq!(queue.send_limit(), 1500 - 84 - 8);
    }

    #[test]
    fn pending_endpoint_commits_only_once() {
        let state = EndpointState::new(endpoint(1111));
        state.note_source(endpoint(1111));
        assert_eq!(state.commit_pending(), None);

        state.note_source(endpoint(2222));
        assert_eq!(state.current(), endpoint(1111));
        assert_eq!(
            state.commit_pending(),
            Some((endpoint(1111), endpoint(2222)))
        );
        assert_eq!(state.current(), endpoint(2222));
        assert_eq!(state.commit_pending(), None);
    }

    #[test]
    fn stale_candidate_is_cleared_by_current_endpoint_traffic() {
        // A stray datagram from a new source, then a legitimate datagram
        // from the current endpoint: the stray must not be committed on
        // the strength of the later datagram's record.
        let state = EndpointState::new(endpoint(1111));
        state.note_source(endpoint(2222));
        state.note_source(endpoint(1111));
        assert_eq!(state.commit_pending(), None);
        assert_eq!(state.current(), endpoint(1111));
    }
}
