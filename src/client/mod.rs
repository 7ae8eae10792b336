//! The client proxy: a classical DNS front end that answers every query by
//! asking a DoH upstream.
//!
//! Each inbound packet runs its own task: parse, sanity checks, passthrough
//! test, upstream pick, format-specific HTTPS exchange, translate back,
//! truncate for UDP if needed, reply. The selector and the HTTP client are
//! the only shared services.

pub use self::http::HttpClientManager;

pub mod bootstrap;
pub mod http;
mod ietf;
mod json;
mod passthrough;

use crate::client::http::ExchangeError;
use crate::config::{ClientConfig, ConfigError};
use crate::content_type;
use crate::selector::{self, Selector, Upstream, UpstreamStatus, UpstreamType};
use crate::types::*;
use crate::util;
use ::http::header::{DATE, LAST_MODIFIED};
use hyper::{Body, Response};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Transport a query arrived on. Replies over UDP must respect the
/// negotiated payload size; TCP replies never truncate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Transport {
    Udp,
    Tcp,
}

pub struct Client {
    conf: ClientConfig,
    timeout: Duration,
    selector: Arc<dyn Selector>,
    http: HttpClientManager,
    passthrough: Vec<String>,
}

impl Client {
    pub fn new(conf: ClientConfig) -> Result<Client, ConfigError> {
        let selector = selector::from_config(&conf);
        let http = HttpClientManager::new(&conf.others)?;
        let passthrough = passthrough::normalise_suffixes(&conf.others.passthrough);
        let timeout = Duration::from_secs(conf.others.timeout);

        Ok(Client {
            conf,
            timeout,
            selector,
            http,
            passthrough,
        })
    }

    /// Runs the proxy: one UDP and one TCP listener per configured address.
    /// Returns on the first listener failure.
    pub async fn start(self: Arc<Self>) -> io::Result<()> {
        self.selector.start_evaluate();
        if self.conf.others.verbose {
            self.selector.start_debug_report();
        }

        let (errors, mut first_error) =
            mpsc::channel::<io::Error>(self.conf.listen.len().max(1) * 2);

        for addr in self.conf.listen.clone() {
            tokio::spawn(udp_listen(self.clone(), addr.clone(), errors.clone()));
            tokio::spawn(tcp_listen(self.clone(), addr, errors.clone()));
        }
        drop(errors);

        match first_error.recv().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handles one inbound packet and returns the bytes to send back, if a
    /// reply could be produced at all.
    pub(crate) async fn handle_packet(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        transport: Transport,
    ) -> Option<Vec<u8>> {
        let query = match Message::from_slice(packet) {
            Ok(query) => query,
            Err(e) => {
                log::warn!("malformed packet from {}: {}", peer, e);
                return formerr_for_raw(packet);
            }
        };

        let udp_size = query.udp_payload_size();

        if query.qr == QR::Response {
            log::warn!("received a response packet from {}", peer);
            let mut reply = query.prepare_reply();
            return self.finish(&mut reply, transport, udp_size);
        }

        if query.questions.len() != 1 {
            log::warn!("number of questions is not 1");
            let mut reply = query.prepare_reply();
            reply.rcode = Rcode::FormErr;
            return self.finish(&mut reply, transport, udp_size);
        }

        let question = &query.questions[0];
        if self.conf.others.verbose {
            log::info!(
                "{} - - \"{} {} {}\"",
                peer,
                question.name,
                question.class,
                question.r#type
            );
        }

        if passthrough::matches(&self.passthrough, &question.name) {
            return match passthrough::forward(
                self.http.resolver().servers(),
                packet,
                transport,
                self.timeout,
            )
            .await
            {
                Ok(raw) => Some(raw),
                Err(e) => {
                    log::warn!("passthrough for {:?} failed: {}", question.name, e);
                    let mut reply = query.prepare_reply();
                    self.finish(&mut reply, transport, udp_size)
                }
            };
        }

        let upstream = match self.selector.get() {
            Some(upstream) => upstream,
            None => {
                log::error!("no upstreams in the pool");
                let mut reply = query.prepare_reply();
                return self.finish(&mut reply, transport, udp_size);
            }
        };

        match upstream.r#type {
            UpstreamType::Google => json::query(self, &query, upstream, peer, transport).await,
            UpstreamType::Ietf => ietf::query(self, &query, upstream, peer, transport).await,
        }
    }

    /// Packs a reply, setting TC and cutting the buffer down when a UDP
    /// response overruns the negotiated payload size.
    pub(crate) fn finish(
        &self,
        reply: &mut Message,
        transport: Transport,
        udp_size: u16,
    ) -> Option<Vec<u8>> {
        let mut buf = match reply.to_vec() {
            Ok(buf) => buf,
            Err(e) => {
                log::error!("failed to encode the reply: {}", e);
                return None;
            }
        };

        if transport == Transport::Udp && buf.len() > udp_size as usize {
            reply.tc = true;
            buf = match reply.to_vec() {
                Ok(buf) => buf,
                Err(e) => {
                    log::error!("failed to encode the truncated reply: {}", e);
                    return None;
                }
            };
            buf.truncate(udp_size as usize);
        }

        Some(buf)
    }

    /// A packed SERVFAIL for the query, subject to the usual truncation.
    pub(crate) fn servfail(
        &self,
        query: &Message,
        transport: Transport,
        udp_size: u16,
    ) -> Option<Vec<u8>> {
        let mut reply = query.prepare_reply();
        self.finish(&mut reply, transport, udp_size)
    }

    /// The client location to convey upstream: the query's own Client
    /// Subnet option wins, else the peer address if it is globally
    /// routable, masked to the conventional /24 or /56.
    pub(crate) fn find_client_subnet(
        &self,
        query: &Message,
        peer: SocketAddr,
    ) -> Option<(IpAddr, u8)> {
        if let Some(ext) = &query.extension {
            if let Some(subnet) = ext.client_subnet() {
                return Some((subnet.address, subnet.source_netmask));
            }
        }

        let ip = peer.ip();
        if util::is_global_ip(ip) {
            let bits = match ip {
                IpAddr::V4(_) => 24,
                IpAddr::V6(_) => 56,
            };
            return Some((util::mask_ip(ip, bits), bits));
        }

        None
    }

    pub(crate) fn no_ecs(&self) -> bool {
        self.conf.others.no_ecs
    }

    /// Sends the request, reporting the outcome to the selector: OK on
    /// 2xx, Error on 5xx or transport failure, Timeout on a blown
    /// deadline. Transport failures also schedule a client rebuild, since
    /// stale pooled connections are the usual cause.
    pub(crate) async fn dispatch(
        &self,
        req: ::http::Request<Body>,
        upstream: &Upstream,
    ) -> Option<Response<Body>> {
        match self.http.execute(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    self.selector.report_status(upstream, UpstreamStatus::Ok);
                } else if resp.status().is_server_error() {
                    self.selector.report_status(upstream, UpstreamStatus::Error);
                }
                Some(resp)
            }
            Err(ExchangeError::Timeout) => {
                log::warn!("{} timed out", upstream);
                self.selector.report_status(upstream, UpstreamStatus::Timeout);
                self.http.rebuild().await;
                None
            }
            Err(e) => {
                log::warn!("{} failed: {}", upstream, e);
                self.selector.report_status(upstream, UpstreamStatus::Error);
                self.http.rebuild().await;
                None
            }
        }
    }

    /// Translates an upstream HTTP response into a DNS reply, keyed on the
    /// response Content-Type rather than on which branch sent the request,
    /// so an upstream is free to answer a JSON query in wire format and
    /// vice versa. Mismatched 2xx responses fall back to the branch's
    /// native parser.
    pub(crate) async fn translate_response(
        &self,
        query: &Message,
        resp: Response<Body>,
        udp_size: u16,
        ecs_netmask: u8,
        native: UpstreamType,
    ) -> Message {
        let status = resp.status();
        let headers = resp.headers().clone();

        let format = match headers.get(::http::header::CONTENT_TYPE) {
            Some(ct) if content_type::is_dns_json(ct) => UpstreamType::Google,
            Some(ct) if content_type::is_dns_message(ct) => UpstreamType::Ietf,
            _ => native,
        };

        if !status.is_success() {
            log::warn!("HTTP error: {}", status);
            // Decode anyway when the body is in a format we understand;
            // the Comment often names the reason.
            if format == UpstreamType::Google {
                if let Ok(body) = hyper::body::to_bytes(resp.into_body()).await {
                    if let Ok(json) = serde_json::from_slice::<crate::json::MessageJson>(&body) {
                        if let Some(comment) = &json.comment {
                            log::warn!("DNS error: {}", comment);
                        }
                    }
                }
            }
            return query.prepare_reply();
        }

        let body = match hyper::body::to_bytes(resp.into_body()).await {
            Ok(body) => body,
            Err(e) => {
                log::warn!("failed to read the response body: {}", e);
                return query.prepare_reply();
            }
        };

        match format {
            UpstreamType::Google => {
                let mut json: crate::json::MessageJson = match serde_json::from_slice(&body) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("failed to decode the JSON response: {}", e);
                        return query.prepare_reply();
                    }
                };

                if json.status != 0 {
                    if let Some(comment) = &json.comment {
                        log::warn!("DNS error: {}", comment);
                    }
                }

                // Some resolvers leave the owner name off records at the
                // zone apex.
                for record in json.answer.iter_mut().chain(json.authority.iter_mut()) {
                    if record.name.is_empty() {
                        record.name = ".".to_string();
                    }
                }

                crate::json::unmarshal(&query.prepare_reply(), &json, udp_size, ecs_netmask)
            }

            UpstreamType::Ietf => {
                let mut reply = match Message::from_slice(&body) {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!("failed to decode the DNS response: {}", e);
                        return query.prepare_reply();
                    }
                };

                // Reconcile TTLs with the time the response spent in HTTP
                // caches, per the Date and Last-Modified headers.
                let date = headers
                    .get(DATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(crate::json::parse_http_date);
                let last_modified = headers
                    .get(LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(crate::json::parse_http_date);

                if let (Some(date), Some(last_modified)) = (date, last_modified) {
                    let age = (date - last_modified).to_std().unwrap_or(Duration::ZERO);
                    reply.decay_ttls(age);
                }

                reply.id = query.id;
                reply
            }
        }
    }
}

/// A minimal FORMERR for a packet that wouldn't parse, echoing its id when
/// enough bytes arrived to carry one.
fn formerr_for_raw(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < 2 {
        return None;
    }

    let reply = Message {
        id: u16::from_be_bytes([packet[0], packet[1]]),
        qr: QR::Response,
        rd: false,
        rcode: Rcode::FormErr,
        ..Message::default()
    };
    reply.to_vec().ok()
}

async fn udp_listen(client: Arc<Client>, addr: String, errors: mpsc::Sender<io::Error>) {
    let socket = match UdpSocket::bind(&addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            log::error!("failed to listen on udp {}: {}", addr, e);
            let _ = errors.send(e).await;
            return;
        }
    };
    log::info!("listening on udp {}", addr);

    let mut buf = [0; DEFAULT_PAYLOAD_SIZE as usize];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let client = client.clone();
                let socket = socket.clone();
                let packet = buf[..len].to_vec();

                tokio::spawn(async move {
                    if let Some(reply) =
                        client.handle_packet(&packet, peer, Transport::Udp).await
                    {
                        // A failed reply write is not retried.
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            log::warn!("failed to reply to {}: {}", peer, e);
                        }
                    }
                });
            }
            Err(e) => {
                log::error!("udp {} receive failed: {}", addr, e);
                let _ = errors.send(e).await;
                return;
            }
        }
    }
}

async fn tcp_listen(client: Arc<Client>, addr: String, errors: mpsc::Sender<io::Error>) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to listen on tcp {}: {}", addr, e);
            let _ = errors.send(e).await;
            return;
        }
    };
    log::info!("listening on tcp {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(tcp_serve(client.clone(), stream, peer));
            }
            Err(e) => {
                log::error!("tcp {} accept failed: {}", addr, e);
                let _ = errors.send(e).await;
                return;
            }
        }
    }
}

async fn tcp_serve(client: Arc<Client>, mut stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);

    // A stub may pipeline several length-prefixed queries per connection.
    loop {
        let mut len = [0; 2];
        match tokio::time::timeout(client.timeout, stream.read_exact(&mut len)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }

        let mut packet = vec![0; u16::from_be_bytes(len).into()];
        match tokio::time::timeout(client.timeout, stream.read_exact(&mut packet)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }

        if let Some(reply) = client.handle_packet(&packet, peer, Transport::Tcp).await {
            if stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .is_err()
                || stream.write_all(&reply).await.is_err()
            {
                log::warn!("failed to reply to {} over tcp", peer);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn test_client() -> Client {
        let conf = ClientConfig {
            others: crate::config::OthersConfig {
                timeout: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        Client::new(conf).unwrap()
    }

    fn query_with_payload(udp_size: u16) -> Message {
        let mut query = Message::default();
        query
            .add_question("example.com", Type::A, Class::Internet)
            .unwrap();
        query.add_extension(Extension {
            payload_size: udp_size,
            ..Extension::default()
        });
        query
    }

    fn big_reply(query: &Message, answers: usize) -> Message {
        let mut reply = query.prepare_reply();
        reply.rcode = Rcode::NoError;
        for i in 0..answers {
            reply.answers.push(Record {
                name: format!("host-{:03}.example.com.", i),
                class: Class::Internet,
                ttl: Duration::from_secs(300),
                resource: Resource::A(Ipv4Addr::new(192, 0, 2, (i % 250) as u8 + 1)),
            });
        }
        reply
    }

    #[test]
    fn test_finish_truncates_udp_replies() {
        let client = test_client();
        let query = query_with_payload(512);
        let mut reply = big_reply(&query, 20);

        let buf = client.finish(&mut reply, Transport::Udp, 512).unwrap();

        assert!(buf.len() <= 512, "reply was {} bytes", buf.len());
        assert!(reply.tc);
        // The truncated header still parses and carries TC.
        assert!(buf[2] & 0b0000_0010 != 0);
    }

    #[test]
    fn test_finish_leaves_tcp_replies_alone() {
        let client = test_client();
        let query = query_with_payload(512);
        let mut reply = big_reply(&query, 20);

        let buf = client.finish(&mut reply, Transport::Tcp, 512).unwrap();

        assert!(buf.len() > 512);
        assert!(!reply.tc);
    }

    #[test]
    fn test_find_client_subnet_prefers_the_query_option() {
        let client = test_client();

        let mut query = query_with_payload(4096);
        let mut ext = query.extension.take().unwrap();
        ext.add_client_subnet(ClientSubnet::new("198.51.100.7".parse().unwrap(), 32));
        query.add_extension(ext);

        let peer: SocketAddr = "203.0.113.5:4242".parse().unwrap();
        let (addr, bits) = client.find_client_subnet(&query, peer).unwrap();
        assert_eq!(addr, "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(bits, 32);
    }

    #[test]
    fn test_find_client_subnet_masks_the_peer() {
        let client = test_client();
        let query = query_with_payload(4096);

        let peer: SocketAddr = "203.0.113.5:4242".parse().unwrap();
        let (addr, bits) = client.find_client_subnet(&query, peer).unwrap();
        assert_eq!(addr, "203.0.113.0".parse::<IpAddr>().unwrap());
        assert_eq!(bits, 24);

        let peer: SocketAddr = "[2001:db8:aaaa:bbbb::7]:4242".parse().unwrap();
        let (addr, bits) = client.find_client_subnet(&query, peer).unwrap();
        assert_eq!(addr, "2001:db8:aaaa:bb00::".parse::<IpAddr>().unwrap());
        assert_eq!(bits, 56);
    }

    #[test]
    fn test_find_client_subnet_ignores_local_peers() {
        let client = test_client();
        let query = query_with_payload(4096);

        let peer: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        assert!(client.find_client_subnet(&query, peer).is_none());
    }

    #[test]
    fn test_formerr_echoes_the_id() {
        let reply = formerr_for_raw(&[0xab, 0xcd, 0xff]).unwrap();
        let reply = Message::from_slice(&reply).unwrap();

        assert_eq!(reply.id, 0xabcd);
        assert_eq!(reply.rcode, Rcode::FormErr);
        assert_eq!(reply.qr, QR::Response);

        assert!(formerr_for_raw(&[0xab]).is_none());
    }
}
