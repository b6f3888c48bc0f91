use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use peerlink::{Client, Config, Direction, Error, MemoryRelay, TunnelConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn client(relay: &MemoryRelay, name: &str) -> Client {
    Client::with_dialer(Config::new("token"), relay.dialer(name))
}

fn handshake(port: u16) -> String {
    format!(r#"{{"type":"tunnel","port":{port}}}"#)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_inbound_tunnel_echo() {
    let relay = MemoryRelay::new();
    let port = echo_server().await;

    let alice = client(&relay, "alice");
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");

    let channel = bob.connect("alice").await.unwrap();
    channel.write(handshake(port)).await.unwrap();
    channel.write("hello").await.unwrap();

    let echoed = tokio::time::timeout(WAIT, channel.read())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], b"hello");
    assert_eq!(alice.peers(), vec!["bob".to_string()]);
}

#[tokio::test]
async fn test_outbound_tunnel_sessions() {
    let relay = MemoryRelay::new();
    let port = echo_server().await;

    let alice = client(&relay, "alice");
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");

    let tunnel = bob
        .create_tunnel(TunnelConfig::new("alice", port, 0))
        .await
        .unwrap();
    assert_eq!(tunnel.descriptor().direction, Direction::Outbound);
    assert_eq!(tunnel.descriptor().local_port, tunnel.local_addr().port());

    for message in [&b"first session"[..], &b"second session"[..]] {
        let mut local = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        local.write_all(message).await.unwrap();

        let mut echoed = vec![0u8; message.len()];
        tokio::time::timeout(WAIT, local.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, message);

        drop(local);
        wait_until(|| bob.channel("alice").is_none()).await;
    }

    tunnel.close();
    tunnel.closed().await;
    assert!(tunnel.is_closed());
}

#[tokio::test]
async fn test_second_local_connection_refused() {
    let relay = MemoryRelay::new();
    let port = echo_server().await;

    let alice = client(&relay, "alice");
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");
    let tunnel = bob
        .create_tunnel(TunnelConfig::new("alice", port, 0))
        .await
        .unwrap();

    let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    first.write_all(b"busy").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, first.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let mut second = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    let mut rest = [0u8; 1];
    let read = tokio::time::timeout(WAIT, second.read(&mut rest)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // the first session is unaffected
    first.write_all(b"more").await.unwrap();
    tokio::time::timeout(WAIT, first.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"more");
}

#[tokio::test]
async fn test_unreachable_local_service_closes_only_that_channel() {
    let relay = MemoryRelay::new();
    let dead_port = unused_port().await;
    let live_port = echo_server().await;

    let alice = client(&relay, "alice");
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");
    let carol = client(&relay, "carol");

    let to_alice = bob.connect("alice").await.unwrap();
    to_alice.write(handshake(dead_port)).await.unwrap();
    let result = tokio::time::timeout(WAIT, to_alice.read()).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));

    let from_carol = carol.connect("alice").await.unwrap();
    from_carol.write(handshake(live_port)).await.unwrap();
    from_carol.write("still up").await.unwrap();
    let echoed = tokio::time::timeout(WAIT, from_carol.read())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], b"still up");
    assert!(alice.transport().is_connected());
}

#[tokio::test]
async fn test_rejected_and_invalid_handshakes() {
    let relay = MemoryRelay::new();
    let port = echo_server().await;

    let mut config = Config::new("token");
    config.allowed_ports = vec![port];
    let alice = Client::with_dialer(config, relay.dialer("alice"));
    alice.listen().await.unwrap();

    let bob = client(&relay, "bob");
    let channel = bob.connect("alice").await.unwrap();
    channel.write(handshake(port.wrapping_add(1).max(1))).await.unwrap();
    let result = tokio::time::timeout(WAIT, channel.read()).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));

    let carol = client(&relay, "carol");
    let channel = carol.connect("alice").await.unwrap();
    channel.write("not a handshake").await.unwrap();
    let result = tokio::time::timeout(WAIT, channel.read()).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));

    // garbage on the relay connection doesn't stop alice either
    relay.inject("alice", "{{{");

    let dave = client(&relay, "dave");
    let channel = dave.connect("alice").await.unwrap();
    channel.write(handshake(port)).await.unwrap();
    channel.write("ok").await.unwrap();
    let echoed = tokio::time::timeout(WAIT, channel.read())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], b"ok");
}

#[tokio::test]
async fn test_close_stops_tunnels() {
    let relay = MemoryRelay::new();
    let port = echo_server().await;

    let alice = client(&relay, "alice");
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");
    let tunnel = bob
        .create_tunnel(TunnelConfig::new("alice", port, 0))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, bob.close()).await.unwrap();
    tokio::time::timeout(WAIT, tunnel.closed()).await.unwrap();

    // alice sees bob's end of stream and drops the channel
    wait_until(|| alice.peers().is_empty()).await;
}

#[tokio::test]
async fn test_close_with_stalled_local_service() {
    let relay = MemoryRelay::new();

    // accepts and never reads
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let alice = client(&relay, "alice");
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");

    let channel = bob.connect("alice").await.unwrap();
    channel.write(handshake(port)).await.unwrap();
    let chunk = vec![0x5au8; 4096];
    for _ in 0..8192 {
        channel.write(chunk.clone()).await.unwrap();
    }

    let total = 8192 * 4096;
    wait_until(|| {
        alice
            .channel("bob")
            .is_some_and(|c| c.metrics().bytes_received >= total)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    tokio::time::timeout(WAIT, alice.close())
        .await
        .expect("close blocked on a stalled local write");
    assert!(alice.peers().is_empty());
}

#[tokio::test]
async fn test_finished_primed_session_is_replaced() {
    let relay = MemoryRelay::new();
    let port = echo_server().await;

    // the first handshake is refused, later ones accepted
    let attempts = Arc::new(AtomicUsize::new(0));
    let alice = client(&relay, "alice").with_tunnel_auth({
        let attempts = attempts.clone();
        move |_, _| attempts.fetch_add(1, Ordering::SeqCst) > 0
    });
    alice.listen().await.unwrap();
    let bob = client(&relay, "bob");

    let tunnel = bob
        .create_tunnel(TunnelConfig::new("alice", port, 0))
        .await
        .unwrap();
    wait_until(|| bob.channel("alice").is_none()).await;
    wait_until(|| alice.peers().is_empty()).await;

    let mut local = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    local.write_all(b"retry").await.unwrap();
    let mut echoed = [0u8; 5];
    tokio::time::timeout(WAIT, local.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"retry");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
