//! Conventional DNS exchange with the configured recursive resolvers, over
//! UDP, TCP or TCP-TLS, with the classical truncation and zone-transfer
//! rules deciding when UDP must give way to TCP.

use crate::bail;
use crate::config::ServerConfig;
use crate::types::{Message, Type, QR};
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::convert::TryFrom;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio_rustls::rustls::{self, OwnedTrustAnchor, ServerName};
use tokio_rustls::TlsConnector;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Proto {
    Udp,
    Tcp,
    TcpTls,
}

fn parse_upstream(upstream: &str) -> Option<(Proto, &str)> {
    let (proto, addr) = upstream.split_once(':')?;
    let proto = match proto {
        "udp" => Proto::Udp,
        "tcp" => Proto::Tcp,
        "tcp-tls" => Proto::TcpTls,
        _ => return None,
    };
    Some((proto, addr))
}

/// Queries one of the configured upstreams, retrying with a fresh random
/// pick up to `tries` times.
pub(crate) async fn query_upstreams(
    conf: &ServerConfig,
    request: &Message,
) -> io::Result<(Message, String)> {
    let mut last_error: Option<io::Error> = None;

    for _ in 0..conf.tries.max(1) {
        let upstream = &conf.upstream[rand::thread_rng().gen_range(0..conf.upstream.len())];

        match exchange(conf, request, upstream).await {
            Ok(response) => return Ok((response, upstream.clone())),
            Err(e) => {
                log::warn!("DNS error from upstream {}: {}", upstream, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no upstreams configured")))
}

async fn exchange(conf: &ServerConfig, request: &Message, upstream: &str) -> io::Result<Message> {
    let (proto, addr) = match parse_upstream(upstream) {
        Some(parsed) => parsed,
        None => bail!(InvalidInput, "invalid upstream {:?}", upstream),
    };

    let timeout = Duration::from_secs(conf.timeout);
    let local = local_addr(conf)?;
    let question_type = request.questions.first().map(|q| q.r#type);

    match proto {
        Proto::Tcp => exchange_tcp(request, addr, local, timeout).await,
        Proto::TcpTls => exchange_tls(request, addr, local, timeout).await,
        Proto::Udp => {
            // Zone transfers never fit a datagram.
            if question_type == Some(Type::AXFR) {
                return exchange_tcp(request, addr, local, timeout).await;
            }

            let response = exchange_udp(request, addr, local, timeout).await?;

            if response.tc {
                log::info!("upstream {} truncated the response, retrying over tcp", upstream);
                return exchange_tcp(request, addr, local, timeout).await;
            }

            // A lone SOA answer to an IXFR means "too big for UDP, ask
            // again over TCP".
            if question_type == Some(Type::IXFR)
                && response.answers.len() == 1
                && response.answers[0].r#type() == Type::SOA
            {
                return exchange_tcp(request, addr, local, timeout).await;
            }

            Ok(response)
        }
    }
}

fn local_addr(conf: &ServerConfig) -> io::Result<Option<IpAddr>> {
    if conf.local_addr.is_empty() {
        return Ok(None);
    }
    match IpAddr::from_str(&conf.local_addr) {
        Ok(ip) => Ok(Some(ip)),
        Err(_) => bail!(InvalidInput, "invalid local_addr {:?}", conf.local_addr),
    }
}

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    match tokio::net::lookup_host(addr).await?.next() {
        Some(server) => Ok(server),
        None => bail!(NotFound, "no addresses for upstream {:?}", addr),
    }
}

fn check_reply(request: &Message, response: &Message) -> io::Result<()> {
    if response.qr != QR::Response || response.id != request.id {
        bail!(InvalidData, "mismatched response from upstream");
    }
    Ok(())
}

async fn exchange_udp(
    request: &Message,
    addr: &str,
    local: Option<IpAddr>,
    timeout: Duration,
) -> io::Result<Message> {
    let exchange = async {
        let server = resolve(addr).await?;

        let bind: SocketAddr = match local {
            Some(ip) => (ip, 0).into(),
            None if server.is_ipv4() => ([0, 0, 0, 0], 0).into(),
            None => ("[::]:0".parse::<SocketAddr>()).unwrap(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(&request.to_vec()?).await?;

        let mut buf = [0; crate::types::DEFAULT_PAYLOAD_SIZE as usize];
        let len = socket.recv(&mut buf).await?;

        let response = Message::from_slice(&buf[..len])?;
        check_reply(request, &response)?;
        Ok(response)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_elapsed) => bail!(TimedOut, "udp exchange with {} timed out", addr),
    }
}

async fn connect_tcp(server: SocketAddr, local: Option<IpAddr>) -> io::Result<TcpStream> {
    match local {
        None => TcpStream::connect(server).await,
        Some(ip) => {
            let socket = if server.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind((ip, 0).into())?;
            socket.connect(server).await
        }
    }
}

async fn stream_exchange<S>(request: &Message, stream: &mut S) -> io::Result<Message>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let wire = request.to_vec()?;
    stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
    stream.write_all(&wire).await?;

    let mut len = [0; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0; u16::from_be_bytes(len).into()];
    stream.read_exact(&mut buf).await?;

    let response = Message::from_slice(&buf)?;
    check_reply(request, &response)?;
    Ok(response)
}

async fn exchange_tcp(
    request: &Message,
    addr: &str,
    local: Option<IpAddr>,
    timeout: Duration,
) -> io::Result<Message> {
    let exchange = async {
        let server = resolve(addr).await?;
        let mut stream = connect_tcp(server, local).await?;
        stream.set_nodelay(true)?;
        stream_exchange(request, &mut stream).await
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_elapsed) => bail!(TimedOut, "tcp exchange with {} timed out", addr),
    }
}

async fn exchange_tls(
    request: &Message,
    addr: &str,
    local: Option<IpAddr>,
    timeout: Duration,
) -> io::Result<Message> {
    let host = addr.rsplit_once(':').map(|(host, _port)| host).unwrap_or(addr);
    let host = host.trim_matches(|c| c == '[' || c == ']');

    // rustls validates against DNS names, so a tcp-tls upstream must be
    // configured by hostname, e.g. tcp-tls:dns.google:853.
    let server_name = match ServerName::try_from(host) {
        Ok(name) => name,
        Err(_) => bail!(
            InvalidInput,
            "tcp-tls upstream {:?} needs a hostname, not an address",
            addr
        ),
    };

    let exchange = async {
        let server = resolve(addr).await?;
        let stream = connect_tcp(server, local).await?;
        stream.set_nodelay(true)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let mut stream = connector.connect(server_name, stream).await?;

        stream_exchange(request, &mut stream).await
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_elapsed) => bail!(TimedOut, "tcp-tls exchange with {} timed out", addr),
    }
}
