//! SOCKSv5 with the Tor resolver extensions (RESOLVE / RESOLVE_PTR), as
//! spoken by torsocks. References: RFC 1928 and torsocks'
//! doc/socks/socks-extensions.txt.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::dns::{resolve_ipv4, reverse_lookup, DnsState};

const SOCKS_VERSION: u8 = 5;

// Reply codes per the RFC; 4 doubles as "DNS failure" which is what the
// torsocks extensions expect.
const REP_SUCCESS: u8 = 0;
const REP_GENERAL_FAILURE: u8 = 1;
const REP_HOST_UNREACHABLE: u8 = 4;
const REP_CONNECTION_REFUSED: u8 = 5;
const REP_COMMAND_NOT_SUPPORTED: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Resolve,
    ResolvePtr,
}

impl Command {
    fn parse(byte: u8) -> Option<Command> {
        match byte {
            0x01 => Some(Command::Connect),
            0xF0 => Some(Command::Resolve),
            0xF1 => Some(Command::ResolvePtr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Host {
    Ip(Ipv4Addr),
    Name(String),
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Host::Ip(ip) => write!(f, "{}", ip),
            Host::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Name resolution seam, so the protocol handler is testable without real
/// DNS.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<Ipv4Addr>;
    async fn reverse(&self, ip: Ipv4Addr) -> Option<String>;
}

/// Resolves the way a pod-local client would; reverse lookups go straight
/// to the cluster nameserver.
pub struct PodResolver {
    state: Arc<DnsState>,
}

#[async_trait]
impl Resolver for PodResolver {
    async fn resolve(&self, name: &str) -> Option<Ipv4Addr> {
        resolve_ipv4(name).await.into_iter().next()
    }

    async fn reverse(&self, ip: Ipv4Addr) -> Option<String> {
        let server = self.state.config.kube_dns?;
        reverse_lookup(ip, server).await
    }
}

/// Accept SOCKS clients forever.
pub async fn serve(listener: TcpListener, state: Arc<DnsState>) -> anyhow::Result<()> {
    let resolver = Arc::new(PodResolver { state });
    loop {
        let (stream, peer) = listener.accept().await?;
        let resolver = resolver.clone();
        tokio::spawn(async move {
            debug!("SOCKS client connected from {}", peer);
            if let Err(exc) = handle_client(stream, resolver.as_ref()).await {
                debug!("SOCKS connection ended: {}", exc);
            }
        });
    }
}

async fn handle_client<R: Resolver + ?Sized>(
    mut stream: TcpStream,
    resolver: &R,
) -> std::io::Result<()> {
    let Some((command, host, port)) = negotiate(&mut stream).await? else {
        return Ok(());
    };
    match command {
        Command::Connect => connect(stream, resolver, host, port).await,
        Command::Resolve => resolve(stream, resolver, host).await,
        Command::ResolvePtr => resolve_ptr(stream, resolver, host).await,
    }
}

/// Drive the handshake and request parse, writing protocol errors to the
/// peer. Returns `None` when the conversation is already over.
async fn negotiate<S>(stream: &mut S) -> std::io::Result<Option<(Command, Host, u16)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version and the client's auth methods, which we ignore.
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Ok(None);
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    // NO_AUTH response.
    stream.write_all(&[SOCKS_VERSION, 0]).await?;

    // Request: version, command, reserved, address type.
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let Some(command) = Command::parse(request[1]) else {
        write_response(stream, REP_COMMAND_NOT_SUPPORTED, Ipv4Addr::UNSPECIFIED, 0).await?;
        return Ok(None);
    };
    let host = match request[3] {
        1 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Host::Ip(Ipv4Addr::from(addr))
        }
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            Host::Name(String::from_utf8_lossy(&name).into_owned())
        }
        // IPv6 is not carried over the tunnel.
        _ => {
            write_response(stream, REP_COMMAND_NOT_SUPPORTED, Ipv4Addr::UNSPECIFIED, 0).await?;
            return Ok(None);
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some((command, host, u16::from_be_bytes(port))))
}

async fn write_response<S>(
    stream: &mut S,
    code: u8,
    bind_addr: Ipv4Addr,
    bind_port: u16,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = vec![SOCKS_VERSION, code, 0, 1];
    response.extend_from_slice(&bind_addr.octets());
    response.extend_from_slice(&bind_port.to_be_bytes());
    stream.write_all(&response).await
}

/// CONNECT: open the outbound TCP connection and become a byte pump.
async fn connect<R: Resolver + ?Sized>(
    mut stream: TcpStream,
    resolver: &R,
    host: Host,
    port: u16,
) -> std::io::Result<()> {
    let target = match &host {
        Host::Ip(ip) => Some(*ip),
        Host::Name(name) => resolver.resolve(name).await,
    };
    let Some(target) = target else {
        warn!("CONNECT {}:{}: name did not resolve", host, port);
        write_response(&mut stream, REP_HOST_UNREACHABLE, Ipv4Addr::UNSPECIFIED, 0).await?;
        return Ok(());
    };
    let mut outbound = match TcpStream::connect((target, port)).await {
        Ok(outbound) => outbound,
        Err(exc) => {
            warn!("CONNECT {}:{} failed: {}", host, port, exc);
            let code = match exc.kind() {
                std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
                _ => REP_GENERAL_FAILURE,
            };
            write_response(&mut stream, code, Ipv4Addr::UNSPECIFIED, 0).await?;
            return Ok(());
        }
    };
    // Per the RFC, report the bound address back to the client.
    let (bind_addr, bind_port) = match outbound.local_addr() {
        Ok(std::net::SocketAddr::V4(addr)) => (*addr.ip(), addr.port()),
        _ => (Ipv4Addr::UNSPECIFIED, 0),
    };
    write_response(&mut stream, REP_SUCCESS, bind_addr, bind_port).await?;
    // Relay until either side closes.
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await;
    Ok(())
}

/// Tor RESOLVE: reply is `05 00 00 01` plus the bare IPv4 address, then the
/// connection closes.
async fn resolve<R: Resolver + ?Sized>(
    mut stream: TcpStream,
    resolver: &R,
    host: Host,
) -> std::io::Result<()> {
    let result = match &host {
        Host::Ip(ip) => Some(*ip),
        Host::Name(name) => resolver.resolve(name).await,
    };
    match result {
        Some(ip) => {
            debug!("RESOLVE {} -> {}", host, ip);
            let mut response = vec![SOCKS_VERSION, REP_SUCCESS, 0, 1];
            response.extend_from_slice(&ip.octets());
            stream.write_all(&response).await?;
        }
        None => {
            warn!("RESOLVE {} failed", host);
            stream
                .write_all(&[SOCKS_VERSION, REP_HOST_UNREACHABLE, 0, 0])
                .await?;
        }
    }
    Ok(())
}

/// Tor RESOLVE_PTR: reply is `05 00 00 03 <len><name>`, then close.
async fn resolve_ptr<R: Resolver + ?Sized>(
    mut stream: TcpStream,
    resolver: &R,
    host: Host,
) -> std::io::Result<()> {
    let target = match &host {
        Host::Ip(ip) => Some(*ip),
        Host::Name(name) => name.parse().ok(),
    };
    let resolved = match target {
        Some(ip) => resolver.reverse(ip).await,
        None => None,
    };
    match resolved {
        Some(name) => {
            debug!("RESOLVE_PTR {} -> {}", host, name);
            let mut response = vec![SOCKS_VERSION, REP_SUCCESS, 0, 3, name.len() as u8];
            response.extend_from_slice(name.as_bytes());
            stream.write_all(&response).await?;
        }
        None => {
            warn!("RESOLVE_PTR {} failed", host);
            stream
                .write_all(&[SOCKS_VERSION, REP_GENERAL_FAILURE, 0, 0])
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubResolver;

    #[async_trait]
    impl Resolver for StubResolver {
        async fn resolve(&self, name: &str) -> Option<Ipv4Addr> {
            (name == "example.com").then(|| Ipv4Addr::new(93, 184, 216, 34))
        }

        async fn reverse(&self, ip: Ipv4Addr) -> Option<String> {
            (ip == Ipv4Addr::new(10, 0, 0, 1)).then(|| "myservice.default".to_string())
        }
    }

    /// Send one request and read exactly `response_len` bytes back. The
    /// server may close without draining our input, so an open-ended read
    /// could see a reset instead of a clean EOF.
    async fn run_session(request: Vec<u8>, response_len: usize) -> Vec<u8> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_client(stream, &StubResolver).await;
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request).await.unwrap();
        let mut response = vec![0u8; response_len];
        client.read_exact(&mut response).await.unwrap();
        server.await.unwrap();
        response
    }

    fn handshake() -> Vec<u8> {
        // Version 5, one auth method, NO_AUTH.
        vec![5, 1, 0]
    }

    #[tokio::test]
    async fn resolve_returns_the_address_and_closes() {
        let mut request = handshake();
        request.extend([5, 0xF0, 0, 3, 11]);
        request.extend(b"example.com");
        request.extend([0, 0]);
        let response = run_session(request, 10).await;
        // Method selection, then the Tor RESOLVE reply.
        assert_eq!(response[..2], [5, 0]);
        assert_eq!(response[2..], [5, 0, 0, 1, 93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn resolve_failure_reports_dns_error() {
        let mut request = handshake();
        request.extend([5, 0xF0, 0, 3, 7]);
        request.extend(b"nope.io");
        request.extend([0, 0]);
        let response = run_session(request, 6).await;
        assert_eq!(response[2..], [5, 4, 0, 0]);
    }

    #[tokio::test]
    async fn resolve_ptr_returns_the_name() {
        let mut request = handshake();
        request.extend([5, 0xF1, 0, 1, 10, 0, 0, 1, 0, 0]);
        let expected_name = b"myservice.default";
        let response = run_session(request, 7 + expected_name.len()).await;
        assert_eq!(response[2..7], [5, 0, 0, 3, expected_name.len() as u8]);
        assert_eq!(&response[7..], expected_name);
    }

    #[tokio::test]
    async fn ipv6_requests_are_refused() {
        let mut request = handshake();
        request.extend([5, 1, 0, 4]);
        request.extend([0u8; 16]);
        request.extend([0, 80]);
        let response = run_session(request, 12).await;
        assert_eq!(response[2..], [5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn unknown_commands_are_refused() {
        let mut request = handshake();
        request.extend([5, 0x02, 0, 1, 127, 0, 0, 1, 0, 80]);
        let response = run_session(request, 12).await;
        assert_eq!(response[2..], [5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn connect_relays_bytes_both_ways() {
        // An echo server standing in for the cluster-internal destination.
        let echo = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_client(stream, &StubResolver).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut request = handshake();
        request.extend([5, 1, 0, 1, 127, 0, 0, 1]);
        request.extend(echo_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [5, 0]);
        assert_eq!(reply[2..4], [5, 0]);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }
}
