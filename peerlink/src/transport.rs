//! The single physical relay connection and frame routing.
//!
//! The [`Transport`] owns the relay socket. Outgoing payloads are wrapped in
//! a [`Frame`] tagged with the destination peer; incoming frames are routed
//! to the [`PeerSink`] registered for the sending peer, or to the unmatched
//! peer sink when nobody has registered for it yet.
//!
//! Routing happens on the receive loop, synchronously with frame arrival, so
//! payloads from one peer are delivered in the order the relay sent them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use peerlink_net::{Dialer, Frame, FrameSink, FrameSource, Incoming};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordination::Graceful;
use crate::sink::{Delivery, PeerSink};
use crate::{Error, Result};

/// How long [`Transport::close`] waits for the relay socket to close cleanly.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Identifies one registration, so a stale owner can't remove a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    sink: Arc<dyn PeerSink>,
}

/// The receive loop of the current physical connection.
struct Link {
    generation: u64,
    cancel: CancellationToken,
}

pub struct Transport {
    dialer: Arc<dyn Dialer>,
    graceful: Graceful,
    state: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    link: Mutex<Option<Link>>,
    handlers: scc::HashMap<String, Registration>,
    unmatched: RwLock<Option<Arc<dyn PeerSink>>>,
    next_handler: AtomicU64,
    generation: AtomicU64,
    shutdown: AtomicBool,
    /// Cancelled by `close`; aborts writes stuck on a slow relay.
    closing: CancellationToken,
}

impl Transport {
    pub fn new(dialer: Arc<dyn Dialer>, graceful: Graceful) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            dialer,
            graceful,
            state,
            connect_lock: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(None),
            link: Mutex::new(None),
            handlers: scc::HashMap::new(),
            unmatched: RwLock::new(None),
            next_handler: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            closing: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the relay connection is gone, by `close` or by loss.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Establish the relay connection.
    ///
    /// Returns immediately when already connected. Concurrent callers share
    /// one dial attempt. After the link is lost this dials again; after
    /// [`Transport::close`] it fails with [`Error::ConnectionClosed`].
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if self.is_connected() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if self.is_connected() {
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);
        tracing::debug!("Dialing relay");

        let (sink, source) = match self.dialer.dial().await {
            Ok(halves) => halves,
            Err(source) => {
                tracing::warn!(error = %source, "Failed to connect to relay");
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(Error::ConnectFailure { source });
            }
        };

        *self.writer.lock().await = Some(sink);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = self.graceful.child_token();
        let installed = {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            if self.shutdown.load(Ordering::Acquire) {
                false
            } else {
                *link = Some(Link {
                    generation,
                    cancel: cancel.clone(),
                });
                true
            }
        };
        if !installed {
            // closed while dialing
            self.writer.lock().await.take();
            return Err(Error::ConnectionClosed);
        }

        self.state.send_replace(ConnectionState::Connected);
        tracing::info!(generation, "Relay connection established");

        let transport = self.clone();
        self.graceful
            .spawn(async move { transport.receive_loop(source, generation, cancel).await });

        Ok(())
    }

    /// Frame `payload` for `peer_id` and write it to the relay.
    pub async fn send(&self, peer_id: &str, payload: Bytes) -> Result<()> {
        let text = Frame::new(peer_id, payload)
            .encode()
            .map_err(|e| Error::Send {
                source: eyre::Error::from(e),
            })?;

        // Holding the writer lock for the whole write keeps frames whole.
        let mut writer = tokio::select! {
            _ = self.closing.cancelled() => return Err(Error::ConnectionClosed),
            writer = self.writer.lock() => writer,
        };
        let Some(sink) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };

        tokio::select! {
            _ = self.closing.cancelled() => Err(Error::ConnectionClosed),
            sent = sink.send(text) => sent.map_err(|e| {
                tracing::debug!(%peer_id, error = %e, "Relay write failed");
                Error::Send {
                    source: eyre::Error::from(e),
                }
            }),
        }
    }

    /// Token cancelled when this transport is closed.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.closing.child_token()
    }

    /// Route frames from `peer_id` to `sink`, replacing any previous sink.
    pub fn register_handler(&self, peer_id: &str, sink: Arc<dyn PeerSink>) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let registration = Registration { id, sink };

        match self.handlers.entry(peer_id.to_string()) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                tracing::debug!(%peer_id, "Replacing handler");
                *entry.get_mut() = registration;
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(registration);
            }
        }

        id
    }

    /// Remove the registration `id` for `peer_id`. A registration that has
    /// since been replaced is left alone.
    pub fn unregister_handler(&self, peer_id: &str, id: HandlerId) -> bool {
        self.handlers
            .remove_if(peer_id, |registration| registration.id == id)
            .is_some()
    }

    pub fn has_handler(&self, peer_id: &str) -> bool {
        self.handlers.contains(peer_id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Sink for frames from peers with no registered handler.
    pub fn set_unmatched(&self, sink: Arc<dyn PeerSink>) {
        *self.unmatched.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Close the relay connection. Idempotent and terminal.
    ///
    /// Pending sends fail with [`Error::ConnectionClosed`] instead of waiting
    /// for the relay to accept them.
    pub async fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        self.closing.cancel();
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            link.cancel.cancel();
        }

        self.close_handlers();
        self.state.send_replace(ConnectionState::Closed);

        let writer = self.writer.lock().await.take();
        if let Some(mut sink) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Error closing relay connection"),
                Err(_) => tracing::debug!("Timed out closing relay connection"),
            }
        }
        tracing::info!("Transport closed");
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut source: FrameSource,
        generation: u64,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(generation, "Receive loop cancelled");
                    return;
                }
                message = source.next() => message,
            };

            match message {
                Some(Ok(text)) => self.dispatch(&text),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Relay connection failed");
                    break;
                }
                None => {
                    tracing::info!("Relay closed the connection");
                    break;
                }
            }
        }

        self.link_lost(generation).await;
    }

    fn dispatch(&self, text: &str) {
        match peerlink_net::decode(text) {
            Ok(Incoming::Frame(frame)) => self.route(frame),
            Ok(Incoming::Other(kind)) => {
                tracing::debug!(%kind, "Ignoring relay message");
            }
            Err(source) => {
                let e = Error::DecodeFailure { source };
                tracing::warn!(error = %e, "Dropping frame");
            }
        }
    }

    fn route(&self, frame: Frame) {
        let Frame { peer_id, payload } = frame;
        tracing::trace!(%peer_id, len = payload.len(), "Routing frame");

        let target = self
            .handlers
            .read(&peer_id, |_, registration| {
                (registration.id, registration.sink.clone())
            });

        if let Some((id, sink)) = target {
            if sink.accept(&peer_id, payload) == Delivery::Finished {
                self.unregister_handler(&peer_id, id);
                tracing::debug!(%peer_id, "Handler finished");
            }
            return;
        }

        let unmatched = self
            .unmatched
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match unmatched {
            Some(sink) => {
                sink.accept(&peer_id, payload);
            }
            None => {
                tracing::debug!(%peer_id, "No handler for peer, dropping frame");
            }
        }
    }

    async fn link_lost(&self, generation: u64) {
        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            if link.as_ref().map(|current| current.generation) != Some(generation) {
                return;
            }
            link.take();
        }

        self.writer.lock().await.take();
        self.close_handlers();
        self.state.send_replace(ConnectionState::Closed);
        tracing::warn!(generation, "Relay connection lost");
    }

    fn close_handlers(&self) {
        let mut sinks = Vec::new();
        self.handlers.scan(|_, registration| sinks.push(registration.sink.clone()));
        self.handlers.clear();
        for sink in sinks {
            sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_net::MemoryRelay;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        payloads: StdMutex<Vec<(String, Bytes)>>,
        closed: AtomicBool,
        finish_on_empty: bool,
    }

    impl PeerSink for Recorder {
        fn accept(&self, peer_id: &str, payload: Bytes) -> Delivery {
            let finished = self.finish_on_empty && payload.is_empty();
            self.payloads
                .lock()
                .unwrap()
                .push((peer_id.to_string(), payload));
            if finished {
                Delivery::Finished
            } else {
                Delivery::Accepted
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Relay connection whose writes never complete.
    struct StalledDialer;

    #[async_trait::async_trait]
    impl Dialer for StalledDialer {
        async fn dial(&self) -> Result<(FrameSink, FrameSource), peerlink_net::SocketError> {
            let sink = futures_util::sink::unfold((), |(), _: String| {
                futures_util::future::pending::<Result<(), peerlink_net::SocketError>>()
            });
            let source =
                futures_util::stream::pending::<Result<String, peerlink_net::SocketError>>();
            Ok((Box::pin(sink), Box::pin(source)))
        }
    }

    fn transport(relay: &MemoryRelay, name: &str) -> Arc<Transport> {
        Transport::new(Arc::new(relay.dialer(name)), Graceful::new())
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");
        assert!(matches!(
            alice.send("bob", Bytes::from_static(b"x")).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");

        let (a, b) = tokio::join!(alice.connect(), alice.connect());
        a.unwrap();
        b.unwrap();
        alice.connect().await.unwrap();
        assert_eq!(alice.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);
        let alice = transport(&relay, "alice");

        assert!(matches!(
            alice.connect().await,
            Err(Error::ConnectFailure { .. })
        ));
        assert_eq!(alice.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_routes_in_order_per_peer() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");
        let bob = transport(&relay, "bob");
        let carol = transport(&relay, "carol");
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        carol.connect().await.unwrap();

        let from_bob = Arc::new(Recorder::default());
        let from_carol = Arc::new(Recorder::default());
        alice.register_handler("bob", from_bob.clone());
        alice.register_handler("carol", from_carol.clone());

        for i in 0..20u8 {
            bob.send("alice", Bytes::from(vec![i])).await.unwrap();
            carol.send("alice", Bytes::from(vec![100 + i])).await.unwrap();
        }

        wait_until(|| from_bob.count() == 20 && from_carol.count() == 20).await;

        let bob_payloads: Vec<u8> = from_bob
            .payloads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p[0])
            .collect();
        assert_eq!(bob_payloads, (0..20).collect::<Vec<_>>());
        assert!(
            from_carol
                .payloads
                .lock()
                .unwrap()
                .iter()
                .all(|(peer, p)| peer == "carol" && p[0] >= 100)
        );
    }

    #[tokio::test]
    async fn test_unmatched_sink_and_malformed_frames() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");
        let bob = transport(&relay, "bob");
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();

        let unmatched = Arc::new(Recorder::default());
        alice.set_unmatched(unmatched.clone());

        relay.inject("alice", "{not json");
        relay.inject("alice", r#"{"type":"p2p","peer_id":"bob","payload":"***"}"#);
        bob.send("alice", Bytes::from_static(b"after")).await.unwrap();

        wait_until(|| unmatched.count() == 1).await;
        assert_eq!(
            unmatched.payloads.lock().unwrap()[0],
            ("bob".to_string(), Bytes::from_static(b"after"))
        );
        assert!(alice.is_connected());
    }

    #[tokio::test]
    async fn test_finished_sink_is_unregistered() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");
        let bob = transport(&relay, "bob");
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();

        let sink = Arc::new(Recorder {
            finish_on_empty: true,
            ..Recorder::default()
        });
        alice.register_handler("bob", sink.clone());
        bob.send("alice", Bytes::new()).await.unwrap();

        wait_until(|| !alice.has_handler("bob")).await;
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_replacement() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");

        let first = alice.register_handler("bob", Arc::new(Recorder::default()));
        let second = alice.register_handler("bob", Arc::new(Recorder::default()));
        assert_ne!(first, second);
        assert_eq!(alice.handler_count(), 1);

        assert!(!alice.unregister_handler("bob", first));
        assert!(alice.has_handler("bob"));
        assert!(alice.unregister_handler("bob", second));
        assert!(!alice.has_handler("bob"));
    }

    #[tokio::test]
    async fn test_link_loss_closes_sinks_and_allows_redial() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");
        alice.connect().await.unwrap();

        let sink = Arc::new(Recorder::default());
        alice.register_handler("bob", sink.clone());

        relay.disconnect("alice");
        alice.closed().await;
        assert!(sink.closed.load(Ordering::SeqCst));
        assert_eq!(alice.handler_count(), 0);
        assert!(matches!(
            alice.send("bob", Bytes::from_static(b"x")).await,
            Err(Error::NotConnected)
        ));

        alice.connect().await.unwrap();
        assert!(alice.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay, "alice");
        alice.connect().await.unwrap();

        alice.close().await;
        alice.close().await;
        assert_eq!(alice.state(), ConnectionState::Closed);
        assert!(matches!(alice.connect().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_aborts_stalled_write() {
        let alice = Transport::new(Arc::new(StalledDialer), Graceful::new());
        alice.connect().await.unwrap();

        let sending = tokio::spawn({
            let alice = alice.clone();
            async move { alice.send("bob", Bytes::from_static(b"stuck")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sending.is_finished());

        tokio::time::timeout(Duration::from_secs(5), alice.close())
            .await
            .unwrap();
        assert_eq!(alice.state(), ConnectionState::Closed);

        let sent = tokio::time::timeout(Duration::from_secs(5), sending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, Err(Error::ConnectionClosed)));
    }
}
