use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Channel, Error, Result};

/// Largest payload a splice puts in one frame.
pub const CHUNK_SIZE: usize = 4096;

/// Bytes moved by one finished splice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SpliceStats {
    /// Local stream to peer.
    pub sent: u64,
    /// Peer to local stream.
    pub received: u64,
}

/// Copy between `local` and `channel` in both directions until either side
/// ends.
///
/// End of stream on either side is a normal exit, and so is the channel
/// being closed underneath it, even while a local write is stuck. The first
/// error from either direction is returned. On every exit the peer is sent
/// the end-of-stream marker (unless it already finished), the local stream
/// is shut down and the channel is closed.
pub async fn splice<S>(local: S, channel: &Channel) -> Result<SpliceStats>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(local);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let result = tokio::select! {
        r = upstream(&mut reader, channel, &sent) => r,
        r = downstream(channel, &mut writer, &received) => r,
        _ = channel.closed() => {
            tracing::debug!(peer_id = %channel.peer_id(), "Channel closed under splice");
            Ok(())
        }
    };

    if channel.is_connected()
        && let Err(e) = channel.finish().await
    {
        tracing::debug!(peer_id = %channel.peer_id(), error = %e, "Could not send end of stream");
    }
    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "Local shutdown failed");
    }
    channel.close();

    let stats = SpliceStats {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    };
    tracing::debug!(
        peer_id = %channel.peer_id(),
        ?stats,
        ok = result.is_ok(),
        "Splice finished"
    );

    result.map(|()| stats)
}

async fn upstream<R>(reader: &mut R, channel: &Channel, counter: &AtomicU64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            tracing::trace!(peer_id = %channel.peer_id(), "Local side reached end of stream");
            return Ok(());
        }
        channel.write(Bytes::copy_from_slice(&buf[..n])).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn downstream<W>(channel: &Channel, writer: &mut W, counter: &AtomicU64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = match channel.read().await {
            Ok(payload) => payload,
            Err(Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        writer.write_all(&payload).await?;
        writer.flush().await?;
        counter.fetch_add(payload.len() as u64, Ordering::Relaxed);
    }
}
