//! In-process relay.
//!
//! Routes frames between named endpoints living in the same process, the same
//! way the real relay does: a frame addressed to `bob` is delivered to bob's
//! connection with `peer_id` rewritten to the sender's name. Frames for names
//! with no live connection are dropped.
//!
//! Used by tests and demos in place of a network relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::protocol::{Incoming, decode};
use crate::{Dialer, Frame, FrameSink, FrameSource, SocketError};

type Delivery = mpsc::UnboundedSender<Result<String, SocketError>>;

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Default)]
struct RelayState {
    endpoints: HashMap<String, (u64, Delivery)>,
    offline: bool,
}

/// A [`Dialer`] that connects `name` to a [`MemoryRelay`].
pub struct MemoryDialer {
    relay: MemoryRelay,
    name: String,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self, name: impl Into<String>) -> MemoryDialer {
        MemoryDialer {
            relay: self.clone(),
            name: name.into(),
        }
    }

    /// While offline every dial fails with [`SocketError::Unavailable`].
    /// Existing connections are left alone.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Go offline and drop every connection.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.offline = true;
        state.endpoints.clear();
    }

    /// Drop the connection of `name`, as if the relay closed it.
    pub fn disconnect(&self, name: &str) -> bool {
        self.lock().endpoints.remove(name).is_some()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.lock().endpoints.contains_key(name)
    }

    /// Deliver a raw text message to `name` without any routing.
    pub fn inject(&self, name: &str, raw: impl Into<String>) -> bool {
        match self.lock().endpoints.get(name) {
            Some((_, tx)) => tx.send(Ok(raw.into())).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        // A poisoned lock only means a test panicked mid-route; the map
        // itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, name: &str) -> Result<(u64, FrameSource), SocketError> {
        let mut state = self.lock();
        if state.offline {
            return Err(SocketError::Unavailable("memory relay is offline".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if state.endpoints.insert(name.to_string(), (id, tx)).is_some() {
            tracing::debug!(%name, "Replacing existing memory relay connection");
        }

        Ok((id, Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))))
    }

    fn route(&self, from: &str, connection: u64, text: String) -> Result<(), SocketError> {
        let state = self.lock();
        match state.endpoints.get(from) {
            Some((id, _)) if *id == connection => {}
            _ => return Err(SocketError::Closed),
        }

        let frame = match decode(&text) {
            Ok(Incoming::Frame(frame)) => frame,
            Ok(Incoming::Other(kind)) => {
                tracing::debug!(%from, %kind, "Memory relay ignoring non-p2p message");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(%from, error = %e, "Memory relay dropping malformed message");
                return Ok(());
            }
        };

        let Some((_, tx)) = state.endpoints.get(&frame.peer_id) else {
            tracing::debug!(%from, to = %frame.peer_id, "No such peer, dropping frame");
            return Ok(());
        };

        let delivered = Frame::new(from, frame.payload);
        let text = delivered.encode().map_err(|e| SocketError::Request {
            source: eyre::Error::from(e),
        })?;
        let _ = tx.send(Ok(text));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<(FrameSink, FrameSource), SocketError> {
        let (connection, source) = self.relay.attach(&self.name)?;

        let sink = futures_util::sink::unfold(
            (self.relay.clone(), self.name.clone()),
            move |(relay, name), text: String| async move {
                relay.route(&name, connection, text)?;
                Ok::<_, SocketError>((relay, name))
            },
        );

        Ok((Box::pin(sink), source))
    }
}
