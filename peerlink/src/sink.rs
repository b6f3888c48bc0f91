use bytes::Bytes;

/// What a sink wants done with its registration after accepting a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The sink takes no more payloads; the transport drops its
    /// registration before routing the next frame.
    Finished,
}

/// Receiver of payloads routed by the [`Transport`](crate::Transport).
///
/// `accept` runs on the receive loop, synchronously with frame arrival. It
/// must not block: enqueue and return.
pub trait PeerSink: Send + Sync + 'static {
    fn accept(&self, peer_id: &str, payload: Bytes) -> Delivery;

    /// Called when the relay connection is lost or the transport closes.
    fn close(&self) {}
}
