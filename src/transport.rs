//! TCP transport: listener/connection setup and socket options.
//!
//! The tunnel runs over a single TCP connection. Both ends disable Nagle
//! and enable TCP keepalive (60 s idle, 10 s interval, 3 probes) so a dead
//! peer is detected at the transport level as well as by the protocol's own
//! liveness probes. After setup the connection is an ordinary
//! [`TcpStream`]; the bridge owns the read and write halves.

use crate::error::{VpnError, VpnResult};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Timeout for a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive: idle time before the first probe.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// TCP keepalive: interval between probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// TCP keepalive: probes before the connection is declared dead.
#[cfg(target_os = "linux")]
const KEEPALIVE_RETRIES: u32 = 3;

/// Bind a listener on `0.0.0.0:port` with `SO_REUSEADDR` and a backlog of
/// one (this is a point-to-point tunnel; a second client waits for the
/// current session to end).
pub fn listen(port: u16) -> VpnResult<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    log::info!("listening on {}", addr);
    Ok(listener)
}

/// Block until one client connects, then apply the tunnel socket options.
pub async fn accept_one(listener: &TcpListener) -> VpnResult<(TcpStream, SocketAddr)> {
    let (stream, peer) = listener.accept().await?;
    configure_stream(&stream)?;
    log::info!("client connected from {}", peer);
    Ok((stream, peer))
}

/// Connect to `host:port` (IP literal or DNS name) and apply the tunnel
/// socket options. Tries each resolved address in order.
pub async fn connect(host: &str, port: u16) -> VpnResult<TcpStream> {
    let addrs = resolve_address(host, port)?;

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                configure_stream(&stream)?;
                log::info!("connected to {}", addr);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                log::debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
            Err(_) => {
                log::debug!("connect to {} timed out", addr);
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ));
            }
        }
    }

    Err(match last_err {
        Some(e) => VpnError::Network(e),
        None => VpnError::config(format!("no addresses resolved for {}:{}", host, port)),
    })
}

/// Resolve a host string to socket addresses. IP literals skip DNS.
fn resolve_address(host: &str, port: u16) -> VpnResult<Vec<SocketAddr>> {
    let addr_str = format!("{}:{}", host, port);

    if let Ok(addr) = addr_str.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }

    let addrs: Vec<SocketAddr> = addr_str
        .to_socket_addrs()
        .map_err(|e| VpnError::config(format!("cannot resolve {}: {}", addr_str, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(VpnError::config(format!(
            "no addresses resolved for {}",
            addr_str
        )));
    }

    Ok(addrs)
}

/// Apply TCP_NODELAY and keepalive options to an established connection.
fn configure_stream(stream: &TcpStream) -> VpnResult<()> {
    stream.set_nodelay(true)?;

    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);

    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);

    sock_ref.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_connect_accept() {
        let listener = listen(0).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();

        let (connected, accepted) = tokio::join!(connect("127.0.0.1", port), async {
            accept_one(&listener).await
        });

        let client = connected.expect("client connects");
        let (server, peer) = accepted.expect("server accepts");

        assert!(client.nodelay().expect("nodelay readable"));
        assert!(server.nodelay().expect("nodelay readable"));
        assert_eq!(peer.ip(), client.local_addr().expect("local addr").ip());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_skips_dns() {
        let addrs = resolve_address("192.0.2.1", 443).expect("resolve literal");
        assert_eq!(addrs, vec!["192.0.2.1:443".parse().expect("parse addr")]);
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        // Bind and drop to get a port that refuses connections.
        let listener = listen(0).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let err = connect("127.0.0.1", port)
            .await
            .expect_err("connection must be refused");
        assert!(err.is_recoverable());
    }
}
