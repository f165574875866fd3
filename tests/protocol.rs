//! End-to-end protocol tests over loopback TCP.
//!
//! These drive the transport, framer, and crypto channel together the way
//! the bridge does, without needing a TUN device or root: handshake, data
//! exchange, silent auth failure, and the oversized-frame kill switch.

use linknet::frame::{Frame, FrameDecoder, PacketType, HEADER_SIZE};
use linknet::transport;
use linknet::CryptoChannel;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const PSK: &[u8] = b"0123456789abcdef0123456789abcdef";

/// The minimally-valid 24-byte IPv4 packet used as test traffic.
fn test_packet() -> Vec<u8> {
    let mut packet = vec![0x45u8, 0x00, 0x00, 0x14];
    packet.extend_from_slice(&[0u8; 16]);
    packet.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    packet
}

/// Read socket bytes until the decoder yields one frame.
async fn read_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Frame {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame().expect("framing") {
            return frame;
        }
        let n = stream.read(&mut buf).await.expect("socket read");
        assert!(n > 0, "peer closed while a frame was expected");
        decoder.feed(&buf[..n]);
    }
}

#[tokio::test]
async fn handshake_and_data_echo() {
    let listener = transport::listen(0).expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (mut stream, _peer) = transport::accept_one(&listener).await.expect("accept");
        let crypto = CryptoChannel::new(PSK).expect("server channel");
        let mut decoder = FrameDecoder::new();

        // Handshake: verify the request, answer with success.
        let request = read_frame(&mut stream, &mut decoder).await;
        assert_eq!(request.packet_type(), Some(PacketType::AuthRequest));
        let response = crypto.handle_auth_request(&request).expect("valid request");
        stream.write_all(&response).await.expect("send response");
        assert!(crypto.is_authenticated());

        // Receive one data packet and echo it back.
        let data = read_frame(&mut stream, &mut decoder).await;
        assert_eq!(data.packet_type(), Some(PacketType::Data));
        let plaintext = crypto.unwrap(&data).expect("unwrap data");
        assert_eq!(plaintext, test_packet());

        let echo = crypto.wrap(&plaintext).expect("wrap echo");
        stream.write_all(&echo).await.expect("send echo");
    });

    let mut stream = transport::connect("127.0.0.1", port).await.expect("connect");
    let crypto = CryptoChannel::new(PSK).expect("client channel");
    let mut decoder = FrameDecoder::new();

    let request = crypto.create_auth_request().expect("auth request");
    stream.write_all(&request).await.expect("send request");

    let response = read_frame(&mut stream, &mut decoder).await;
    crypto
        .handle_auth_response(&response)
        .expect("server accepted us");
    assert!(crypto.is_authenticated());

    let wire = crypto.wrap(&test_packet()).expect("wrap data");
    stream.write_all(&wire).await.expect("send data");

    let echo = read_frame(&mut stream, &mut decoder).await;
    let plaintext = crypto.unwrap(&echo).expect("unwrap echo");
    assert_eq!(plaintext, test_packet());

    timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished in time")
        .expect("server task");
}

#[tokio::test]
async fn psk_mismatch_fails_silently() {
    let listener = transport::listen(0).expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (mut stream, _peer) = transport::accept_one(&listener).await.expect("accept");
        let crypto = CryptoChannel::new(b"bbbbbbbbbbbbbbbb").expect("server channel");
        let stats = linknet::BridgeStats::new();
        let mut decoder = FrameDecoder::new();

        let request = read_frame(&mut stream, &mut decoder).await;
        if crypto.handle_auth_request(&request).is_err() {
            // Silent failure: count it, send no response frame.
            stats.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
        assert!(!crypto.is_authenticated());
        stats.snapshot().auth_failures
    });

    let mut stream = transport::connect("127.0.0.1", port).await.expect("connect");
    let crypto = CryptoChannel::new(b"aaaaaaaaaaaaaaaa").expect("client channel");

    let request = crypto.create_auth_request().expect("auth request");
    stream.write_all(&request).await.expect("send request");

    let auth_failures = timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished in time")
        .expect("server task");
    assert_eq!(auth_failures, 1);

    // No response ever arrives; the client stays unauthenticated.
    let mut buf = [0u8; 4096];
    match timeout(Duration::from_millis(300), stream.read(&mut buf)).await {
        Err(_) => {}    // nothing within the window
        Ok(Ok(0)) => {} // server closed without answering
        Ok(Ok(n)) => panic!("server must not answer a bad handshake, got {} bytes", n),
        Ok(Err(e)) => panic!("unexpected read error: {}", e),
    }
    assert!(!crypto.is_authenticated());
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let listener = transport::listen(0).expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    // Server side behaves like the bridge's socket reader: a framing error
    // is fatal and the connection is dropped immediately.
    let server = tokio::spawn(async move {
        let (mut stream, _peer) = transport::accept_one(&listener).await.expect("accept");
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.expect("socket read");
            if n == 0 {
                panic!("attacker closed first");
            }
            decoder.feed(&buf[..n]);
            match decoder.next_frame() {
                Ok(Some(_)) => panic!("oversized frame must not decode"),
                Ok(None) => continue,
                Err(_) => return, // drop the connection
            }
        }
    });

    let mut stream = transport::connect("127.0.0.1", port).await.expect("connect");

    // A header declaring a 2 GiB payload, with no body following.
    let mut header = vec![0u8; HEADER_SIZE];
    header[0] = PacketType::Data.as_byte();
    header[4..8].copy_from_slice(&(1u32 << 31).to_be_bytes());
    stream.write_all(&header).await.expect("send header");

    let start = std::time::Instant::now();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished in time")
        .expect("server dropped the connection");

    // The peer observes the close promptly.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("close observed within a second")
        .expect("read after close");
    assert_eq!(n, 0);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn frames_survive_arbitrary_chunking() {
    let listener = transport::listen(0).expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (mut stream, _peer) = transport::accept_one(&listener).await.expect("accept");
        let crypto = CryptoChannel::new(PSK).expect("server channel");
        let mut decoder = FrameDecoder::new();

        let request = read_frame(&mut stream, &mut decoder).await;
        let response = crypto.handle_auth_request(&request).expect("valid request");
        stream.write_all(&response).await.expect("send response");

        // Two back-to-back data frames, possibly split across reads at any
        // byte boundary, come out whole and in order.
        let first = read_frame(&mut stream, &mut decoder).await;
        let second = read_frame(&mut stream, &mut decoder).await;
        (
            crypto.unwrap(&first).expect("unwrap first"),
            crypto.unwrap(&second).expect("unwrap second"),
        )
    });

    let mut stream = transport::connect("127.0.0.1", port).await.expect("connect");
    let crypto = CryptoChannel::new(PSK).expect("client channel");
    let mut decoder = FrameDecoder::new();

    let request = crypto.create_auth_request().expect("auth request");
    stream.write_all(&request).await.expect("send request");
    let response = read_frame(&mut stream, &mut decoder).await;
    crypto
        .handle_auth_response(&response)
        .expect("server accepted us");

    // Concatenate two frames and push them out in deliberately awkward
    // chunk sizes.
    let mut wire = Vec::new();
    wire.extend_from_slice(&crypto.wrap(b"first packet").expect("wrap"));
    wire.extend_from_slice(&crypto.wrap(b"second packet").expect("wrap"));

    for chunk in wire.chunks(7) {
        stream.write_all(chunk).await.expect("send chunk");
        stream.flush().await.expect("flush");
    }

    let (first, second) = timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished in time")
        .expect("server task");
    assert_eq!(first, b"first packet");
    assert_eq!(second, b"second packet");
}
