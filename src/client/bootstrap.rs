//! The bootstrap stub resolver.
//!
//! DoH endpoint URLs usually carry hostnames, and resolving a hostname is
//! exactly the job being proxied, so the dialer would chase its own tail.
//! This resolver breaks the loop: it speaks plain UDP DNS to an explicit
//! list of `ip:port` servers, or falls back to the system resolver when the
//! operator configured none. It is used only for the DoH endpoints
//! themselves (and for passthrough suffixes, which want a classical
//! resolver anyway).

use crate::bail;
use crate::resource::Resource;
use crate::types::{Class, Message, Type, QR};
use hyper::client::connect::dns::Name;
use rand::Rng;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::UdpSocket;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BootstrapResolver {
    servers: Arc<Vec<SocketAddr>>,
    ipv4_only: bool,
}

impl BootstrapResolver {
    /// An empty server list means "use the system resolver".
    pub fn new(servers: Vec<SocketAddr>, ipv4_only: bool) -> BootstrapResolver {
        BootstrapResolver {
            servers: Arc::new(servers),
            ipv4_only,
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Resolves `host` to socket addresses (with a zero port; the caller
    /// supplies the real one).
    pub async fn lookup(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        // Address literals skip resolution entirely.
        if let Ok(ip) = IpAddr::from_str(host.trim_matches(|c| c == '[' || c == ']')) {
            return Ok(vec![SocketAddr::new(ip, 0)]);
        }

        if self.servers.is_empty() {
            let addrs = tokio::net::lookup_host((host, 0_u16)).await?;
            return Ok(addrs
                .filter(|addr| !self.ipv4_only || addr.is_ipv4())
                .collect());
        }

        // One server is chosen at random per dial, so a dead bootstrap
        // resolver only costs a fraction of the dials.
        let server = self.servers[rand::thread_rng().gen_range(0..self.servers.len())];

        let mut ips = match self.query(server, host, Type::A).await {
            Ok(ips) => ips,
            Err(e) => {
                log::warn!("bootstrap A lookup of {:?} via {} failed: {}", host, server, e);
                Vec::new()
            }
        };
        if !self.ipv4_only {
            match self.query(server, host, Type::AAAA).await {
                Ok(more) => ips.extend(more),
                Err(e) => {
                    log::debug!("bootstrap AAAA lookup of {:?} via {} failed: {}", host, server, e)
                }
            }
        }

        Ok(ips
            .into_iter()
            .map(|ip| SocketAddr::new(ip, 0))
            .collect())
    }

    async fn query(
        &self,
        server: SocketAddr,
        host: &str,
        r#type: Type,
    ) -> io::Result<Vec<IpAddr>> {
        let mut query = Message::default();
        query.add_question(host, r#type, Class::Internet)?;

        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ("::".parse::<IpAddr>().unwrap(), 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        socket.send(&query.to_vec()?).await?;

        let mut buf = [0; 4096];
        let len = match tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(len) => len?,
            Err(_elapsed) => bail!(TimedOut, "bootstrap resolver {} timed out", server),
        };

        let resp = Message::from_slice(&buf[..len])?;
        if resp.id != query.id || resp.qr != QR::Response {
            bail!(InvalidData, "mismatched response from bootstrap resolver {}", server);
        }

        Ok(resp
            .answers
            .iter()
            .filter_map(|record| match record.resource {
                Resource::A(ip) => Some(IpAddr::V4(ip)),
                Resource::AAAA(ip) => Some(IpAddr::V6(ip)),
                _ => None,
            })
            .collect())
    }
}

// The dialer plugs the resolver into hyper's connector.
impl hyper::service::Service<Name> for BootstrapResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();

        Box::pin(async move {
            let addrs = resolver.lookup(name.as_str()).await?;
            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {}", name),
                ));
            }
            Ok(addrs.into_iter())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_addresses_skip_resolution() {
        // A resolver with an unroutable server must still answer literals.
        let resolver = BootstrapResolver::new(vec!["192.0.2.1:53".parse().unwrap()], false);

        let addrs = resolver.lookup("93.184.216.34").await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34:0".parse().unwrap()]);

        let addrs = resolver.lookup("2606:2800:220:1::1").await.unwrap();
        assert_eq!(addrs, vec!["[2606:2800:220:1::1]:0".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolves_against_a_local_server() {
        // Stand up a one-shot DNS server answering 192.0.2.7 for anything.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0; 4096];
            loop {
                let (len, peer) = match server.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let query = Message::from_slice(&buf[..len]).unwrap();
                let mut reply = query.prepare_reply();
                reply.rcode = crate::Rcode::NoError;
                if query.questions[0].r#type == Type::A {
                    reply.answers.push(crate::Record {
                        name: query.questions[0].name.clone(),
                        class: Class::Internet,
                        ttl: Duration::from_secs(60),
                        resource: Resource::A([192, 0, 2, 7].into()),
                    });
                }
                let _ = server.send_to(&reply.to_vec().unwrap(), peer).await;
            }
        });

        let resolver = BootstrapResolver::new(vec![server_addr], true);
        let addrs = resolver.lookup("doh.example.com").await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7:0".parse().unwrap()]);
    }
}
