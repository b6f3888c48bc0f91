//! Virtual connections.
//!
//! A [`Channel`] is one logical byte stream to one remote peer, carried over
//! the shared relay connection. Inbound payloads queue up in the channel's
//! inbox in arrival order until [`Channel::read`] takes them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::registry::ChannelRegistry;
use crate::sink::{Delivery, PeerSink};
use crate::transport::{HandlerId, Transport};
use crate::{Error, Result};

/// Cloning a channel yields another handle to the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    peer_id: String,
    transport: Arc<Transport>,
    inbox: Arc<Inbox>,
    handler: HandlerId,
    registry: Weak<ChannelRegistry>,
    released: AtomicBool,
    /// Cancelled by `close` or when the transport closes.
    closed: CancellationToken,
    bytes_sent: AtomicU64,
    opened_at: chrono::DateTime<chrono::Utc>,
}

/// Traffic counters for one channel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChannelMetrics {
    pub peer_id: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connected: bool,
    pub opened_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
    bytes_received: AtomicU64,
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<Bytes>,
    /// No more payloads will arrive: closed locally, finished by the peer,
    /// or the relay connection went away.
    closed: bool,
}

impl Inbox {
    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, payload: Bytes) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            self.bytes_received
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            state.queue.push_back(payload);
        }
        self.notify.notify_waiters();
        true
    }

    fn shut(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl PeerSink for Inbox {
    fn accept(&self, peer_id: &str, payload: Bytes) -> Delivery {
        if payload.is_empty() {
            tracing::debug!(%peer_id, "Peer finished the stream");
            self.shut();
            return Delivery::Finished;
        }

        if self.push(payload) {
            Delivery::Accepted
        } else {
            Delivery::Finished
        }
    }

    fn close(&self) {
        self.shut();
    }
}

impl Channel {
    /// Open a channel to `peer_id` on `transport`.
    ///
    /// The channel is registered with the transport before this returns, so
    /// no payload from the peer is missed.
    pub fn new(peer_id: impl Into<String>, transport: Arc<Transport>) -> Self {
        Self::open(peer_id.into(), transport, Weak::new())
    }

    pub(crate) fn open(
        peer_id: String,
        transport: Arc<Transport>,
        registry: Weak<ChannelRegistry>,
    ) -> Self {
        let inbox = Arc::new(Inbox::default());
        let handler = transport.register_handler(&peer_id, inbox.clone());
        let closed = transport.child_token();
        tracing::debug!(%peer_id, "Channel opened");

        Self {
            inner: Arc::new(ChannelInner {
                peer_id,
                transport,
                inbox,
                handler,
                registry,
                released: AtomicBool::new(false),
                closed,
                bytes_sent: AtomicU64::new(0),
                opened_at: chrono::Utc::now(),
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.released.load(Ordering::Acquire) && !self.inner.inbox.is_closed()
    }

    /// Next payload from the peer, oldest first.
    ///
    /// Waits while the inbox is empty. Payloads that arrived before the
    /// channel closed are still returned; after that every call fails with
    /// [`Error::ConnectionClosed`].
    pub async fn read(&self) -> Result<Bytes> {
        let inbox = &self.inner.inbox;
        loop {
            let notified = inbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = inbox.lock();
                if let Some(payload) = state.queue.pop_front() {
                    return Ok(payload);
                }
                if state.closed {
                    return Err(Error::ConnectionClosed);
                }
            }

            notified.await;
        }
    }

    /// Send `data` to the peer. Empty writes are ignored.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;
        self.inner.transport.send(&self.inner.peer_id, data).await?;
        self.inner.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Tell the peer this session is over by sending the end-of-stream
    /// marker. The channel itself stays open until [`Channel::close`].
    pub async fn finish(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        self.inner
            .transport
            .send(&self.inner.peer_id, Bytes::new())
            .await
    }

    /// Close the channel and stop routing the peer's frames to it.
    ///
    /// Idempotent. Pending [`Channel::read`] calls drain what is buffered
    /// and then fail with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.inbox.shut();
        self.inner.closed.cancel();
        self.inner
            .transport
            .unregister_handler(&self.inner.peer_id, self.inner.handler);
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self);
        }

        tracing::debug!(peer_id = %self.inner.peer_id, "Channel closed");
    }

    /// Resolves once the channel has been closed, or its transport has.
    ///
    /// Unlike [`Channel::read`] this does not wait for buffered payloads to
    /// be taken.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics {
            peer_id: self.inner.peer_id.clone(),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.inbox.bytes_received.load(Ordering::Relaxed),
            connected: self.is_connected(),
            opened_at: self.inner.opened_at,
        }
    }

    /// Queue a payload as if it had arrived from the peer.
    pub(crate) fn deliver(&self, payload: Bytes) {
        self.inner.inbox.accept(&self.inner.peer_id, payload);
    }

    pub(crate) fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer_id", &self.inner.peer_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Graceful;
    use peerlink_net::MemoryRelay;
    use std::time::Duration;

    async fn pair(relay: &MemoryRelay) -> (Arc<Transport>, Arc<Transport>) {
        let alice = Transport::new(Arc::new(relay.dialer("alice")), Graceful::new());
        let bob = Transport::new(Arc::new(relay.dialer("bob")), Graceful::new());
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_write_and_read_in_order() {
        let relay = MemoryRelay::new();
        let (alice, bob) = pair(&relay).await;

        let to_bob = Channel::new("bob", alice);
        let to_alice = Channel::new("alice", bob);

        for chunk in ["one", "two", "three"] {
            to_bob.write(chunk).await.unwrap();
        }
        for chunk in ["one", "two", "three"] {
            assert_eq!(to_alice.read().await.unwrap(), chunk.as_bytes());
        }

        let metrics = to_bob.metrics();
        assert_eq!(metrics.bytes_sent, 11);
        assert!(metrics.connected);
        assert_eq!(to_alice.metrics().bytes_received, 11);
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let relay = MemoryRelay::new();
        let (alice, _bob) = pair(&relay).await;
        let channel = Channel::new("bob", alice.clone());

        let reader = channel.clone();
        let pending = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.close();
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(!alice.has_handler("bob"));
    }

    #[tokio::test]
    async fn test_read_drains_after_close() {
        let relay = MemoryRelay::new();
        let (alice, _bob) = pair(&relay).await;
        let channel = Channel::new("bob", alice);

        channel.deliver(Bytes::from_static(b"buffered"));
        channel.close();
        channel.close();

        assert_eq!(channel.read().await.unwrap(), &b"buffered"[..]);
        assert!(matches!(channel.read().await, Err(Error::ConnectionClosed)));
        assert!(matches!(
            channel.write("late").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_channel() {
        let relay = MemoryRelay::new();
        let (alice, bob) = pair(&relay).await;
        let to_bob = Channel::new("bob", alice.clone());
        let to_alice = Channel::new("alice", bob);

        to_alice.write("last").await.unwrap();
        to_alice.finish().await.unwrap();

        assert_eq!(to_bob.read().await.unwrap(), &b"last"[..]);
        assert!(matches!(to_bob.read().await, Err(Error::ConnectionClosed)));
        assert!(!to_bob.is_connected());
        assert!(!alice.has_handler("bob"));
    }

    #[tokio::test]
    async fn test_link_loss_surfaces_closed() {
        let relay = MemoryRelay::new();
        let (alice, _bob) = pair(&relay).await;
        let channel = Channel::new("bob", alice.clone());

        relay.disconnect("alice");
        alice.closed().await;

        assert!(matches!(channel.read().await, Err(Error::ConnectionClosed)));
        assert!(matches!(
            channel.write("x").await,
            Err(Error::ConnectionClosed)
        ));
    }
}
