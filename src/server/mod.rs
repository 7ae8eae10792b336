//! The server proxy: a DoH endpoint in front of conventional recursive
//! resolvers.
//!
//! Every HTTP request is negotiated into one of the two wire formats,
//! parsed into a DNS query, answered by a randomly picked upstream (with
//! the truncation and zone-transfer rules of classical DNS), and emitted
//! back in the negotiated format with HTTP caching metadata derived from
//! the answer TTLs.

pub use self::cache::ResponseCache;

mod cache;
mod ietf;
mod json;
mod upstream;

use crate::config::ServerConfig;
use crate::content_type::{
    self, APPLICATION_DNS_JSON, APPLICATION_DNS_MESSAGE, APPLICATION_DNS_UDPWIREFORMAT,
    APPLICATION_JSON,
};
use crate::types::*;
use crate::util;
use http::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE, SERVER, USER_AGENT, VARY,
};
use http::{Method, StatusCode};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::TlsAcceptor;

// dnscrypt-proxy probes DoH servers with this fixed query and refuses the
// endpoint unless the reply matches byte for byte what its reference
// server sends. Pattern-match the probe and play along.
const DNSCRYPT_PROXY_PROBE: &[u8] =
    b"\xca\xfe\x01\x00\x00\x01\x00\x00\x00\x00\x00\x01\x00\x00\x02\x00\x01\x00\x00\x29\x10\x00\x00\x00\x80\x00\x00\x00";
const DNSCRYPT_PROXY_REPLY: &[u8] =
    b"\xca\xfe\x81\x05\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x10\x00\x01\x00\x00\x00\x00\x00\x16\x15dnscrypt-proxy on DoH";

/// The wire format negotiated for a request/response pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Format {
    Json,
    Ietf,
}

/// One in-flight query: the assembled DNS request plus what is needed to
/// shape the response.
pub(crate) struct DnsRequest {
    pub request: Message,

    /// The client's transaction id, restored before the reply leaves.
    pub original_id: u16,

    /// Whether the client supplied its own Client Subnet; such responses
    /// are marked `Cache-Control: private`.
    pub has_client_ecs: bool,
}

/// An error surfaced to the HTTP client as a JSON body.
#[derive(Debug)]
pub(crate) struct HttpError {
    pub status: u16,
    pub comment: String,
}

impl HttpError {
    pub fn bad_request(comment: impl Into<String>) -> HttpError {
        HttpError {
            status: 400,
            comment: comment.into(),
        }
    }
}

pub struct Server {
    conf: ServerConfig,
    cache: Option<ResponseCache>,
}

impl Server {
    pub fn new(conf: ServerConfig) -> Server {
        let cache = if conf.caching {
            Some(ResponseCache::new())
        } else {
            None
        };
        Server { conf, cache }
    }

    /// Runs the endpoint: one HTTP(S) listener per configured address.
    /// Returns on the first listener failure.
    pub async fn start(self: Arc<Self>) -> io::Result<()> {
        let tls = if self.conf.cert.is_empty() {
            None
        } else {
            Some(load_tls(&self.conf.cert, &self.conf.key)?)
        };

        let (errors, mut first_error) =
            mpsc::channel::<io::Error>(self.conf.listen.len().max(1));

        for addr in self.conf.listen.clone() {
            tokio::spawn(http_listen(self.clone(), addr, tls.clone(), errors.clone()));
        }
        drop(errors);

        match first_error.recv().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) async fn handle(
        self: Arc<Self>,
        req: Request<Body>,
        peer: SocketAddr,
    ) -> Response<Body> {
        for name in &self.conf.debug_http_headers {
            if let Some(value) = req.headers().get(name.as_str()) {
                log::info!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
            }
        }

        if req.method() == Method::OPTIONS {
            return self
                .response_builder()
                .body(Body::empty())
                .unwrap();
        }

        if req.uri().path() != self.conf.path {
            return self.error_response(404, "404 page not found");
        }

        let params = parse_params(req.uri().query());
        let (parts, body) = req.into_parts();

        let body = if parts.method == Method::POST {
            match hyper::body::to_bytes(body).await {
                Ok(body) => body,
                Err(e) => {
                    return self
                        .error_response(400, &format!("Failed to read request body ({})", e))
                }
            }
        } else {
            bytes::Bytes::new()
        };

        let format = match determine_format(&parts.headers, &params) {
            Some(format) => format,
            None => {
                let ct = params.get("ct").map(String::as_str).unwrap_or("");
                return self
                    .error_response(415, &format!("Invalid argument value: \"ct\" = {:?}", ct));
            }
        };

        let mut req = match format {
            Format::Json => match json::parse_request(&self, &params, &parts.headers, peer) {
                Ok(req) => req,
                Err(e) => return self.error_response(e.status, &e.comment),
            },
            Format::Ietf => {
                let binary = match ietf::extract_binary(&params, &parts.headers, &body) {
                    Ok(binary) => binary,
                    Err(e) => return self.error_response(e.status, &e.comment),
                };

                if binary == DNSCRYPT_PROXY_PROBE && is_dnscrypt_proxy(&parts.headers) {
                    return self.dnscrypt_probe_response();
                }

                match ietf::parse_request(&self, &binary, &parts.headers, peer) {
                    Ok(req) => req,
                    Err(e) => return self.error_response(e.status, &e.comment),
                }
            }
        };

        if self.conf.verbose {
            if let Some(question) = req.request.questions.first() {
                log::info!(
                    "{} - - \"{} {} {}\"",
                    peer,
                    question.name,
                    question.class,
                    question.r#type
                );
            }
        }

        // Unbound answers root queries with REFUSED unless recursion is
        // explicitly requested.
        if let Some(question) = req.request.questions.first() {
            if question.name == "." {
                req.request.rd = true;
            }
        }

        let key = self
            .cache
            .as_ref()
            .and_then(|_| ResponseCache::fingerprint(&req.request));

        let response = key
            .and_then(|key| {
                self.cache
                    .as_ref()
                    .and_then(|cache| cache.lookup(key, req.request.id))
            })
            .map(|(response, _upstream)| response);

        let response = match response {
            Some(response) => response,
            None => {
                let (response, upstream) =
                    match upstream::query_upstreams(&self.conf, &req.request).await {
                        Ok(result) => result,
                        Err(e) => {
                            return self
                                .error_response(503, &format!("DNS query failure ({})", e))
                        }
                    };

                if let (Some(cache), Some(key)) = (self.cache.as_ref(), key) {
                    cache.store(key, &upstream, &response);
                }

                response
            }
        };

        match format {
            Format::Json => json::respond(&self, &req, &response),
            Format::Ietf => ietf::respond(&self, &req, &response),
        }
    }

    /// The client address to convey upstream as a Client Subnet: the first
    /// globally routable address out of X-Forwarded-For, X-Real-IP and the
    /// socket peer.
    pub(crate) fn find_client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> Option<IpAddr> {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            for addr in forwarded.split(',') {
                if let Ok(ip) = addr.trim().parse::<IpAddr>() {
                    if util::is_global_ip(ip) {
                        if self.conf.log_guessed_client_ip {
                            log::info!("client ip {} guessed from X-Forwarded-For", ip);
                        }
                        return Some(ip);
                    }
                }
            }
        }

        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
                if util::is_global_ip(ip) {
                    if self.conf.log_guessed_client_ip {
                        log::info!("client ip {} guessed from X-Real-IP", ip);
                    }
                    return Some(ip);
                }
            }
        }

        let ip = peer.ip();
        if util::is_global_ip(ip) {
            return Some(ip);
        }
        None
    }

    /// The Client Subnet prefix length used for guessed client addresses.
    pub(crate) fn ecs_bits(&self, ip: IpAddr) -> u8 {
        match (ip, self.conf.ecs_use_precise_ip) {
            (IpAddr::V4(_), false) => 24,
            (IpAddr::V6(_), false) => 56,
            (IpAddr::V4(_), true) => 32,
            (IpAddr::V6(_), true) => 128,
        }
    }

    /// Every response carries the identity and CORS headers.
    pub(crate) fn response_builder(&self) -> ::http::response::Builder {
        Response::builder()
            .header(SERVER, crate::USER_AGENT)
            .header("x-powered-by", crate::USER_AGENT)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, HEAD, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
            .header(ACCESS_CONTROL_MAX_AGE, "3600")
    }

    pub(crate) fn error_response(&self, status: u16, comment: &str) -> Response<Body> {
        self.response_builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .body(Body::from(crate::json::error_body(comment)))
            .unwrap()
    }

    fn dnscrypt_probe_response(&self) -> Response<Body> {
        self.response_builder()
            .header(CONTENT_TYPE, APPLICATION_DNS_MESSAGE)
            .header(VARY, "Accept, User-Agent")
            .body(Body::from(DNSCRYPT_PROXY_REPLY))
            .unwrap()
    }
}

fn is_dnscrypt_proxy(headers: &HeaderMap) -> bool {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.contains("dnscrypt-proxy"))
        .unwrap_or(false)
}

/// Collects the query string into a map. The first value wins when a
/// parameter repeats.
fn parse_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        params.entry(name.into_owned()).or_insert_with(|| value.into_owned());
    }
    params
}

/// Negotiates the wire format: the Accept header is preferred, then the
/// `ct` parameter, then inference from the parameters or the request
/// Content-Type. `None` means 415.
fn determine_format(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<Format> {
    if let Some(accept) = headers.get(ACCEPT).and_then(|v| v.to_str().ok()) {
        for candidate in accept.split(',') {
            let essence = candidate.split(';').next().unwrap_or("").trim();
            match essence {
                APPLICATION_JSON | APPLICATION_DNS_JSON => return Some(Format::Json),
                APPLICATION_DNS_MESSAGE | APPLICATION_DNS_UDPWIREFORMAT => {
                    return Some(Format::Ietf)
                }
                _ => {}
            }
        }
    }

    if let Some(ct) = params.get("ct").filter(|ct| !ct.is_empty()) {
        return match ct.as_str() {
            APPLICATION_JSON | APPLICATION_DNS_JSON => Some(Format::Json),
            APPLICATION_DNS_MESSAGE | APPLICATION_DNS_UDPWIREFORMAT => Some(Format::Ietf),
            _ => None,
        };
    }

    if params.contains_key("name") {
        return Some(Format::Json);
    }
    if params.contains_key("dns") {
        return Some(Format::Ietf);
    }

    if let Some(ct) = headers.get(CONTENT_TYPE) {
        if content_type::is_dns_message(ct) {
            return Some(Format::Ietf);
        }
        if content_type::is_dns_json(ct) {
            return Some(Format::Json);
        }
    }

    None
}

async fn http_listen(
    server: Arc<Server>,
    addr: String,
    tls: Option<TlsAcceptor>,
    errors: mpsc::Sender<io::Error>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to listen on {}: {}", addr, e);
            let _ = errors.send(e).await;
            return;
        }
    };
    log::info!(
        "listening on {} {}",
        if tls.is_some() { "https" } else { "http" },
        addr
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("{} accept failed: {}", addr, e);
                let _ = errors.send(e).await;
                return;
            }
        };

        let server = server.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(server.handle(req, peer).await) }
            });

            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => Http::new().serve_connection(stream, service).await,
                    Err(e) => {
                        log::debug!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                },
                None => Http::new().serve_connection(stream, service).await,
            };

            if let Err(e) = result {
                log::debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

fn load_tls(cert: &str, key: &str) -> io::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<Certificate>>();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key)?))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(key)?))?;
    }
    let key = match keys.into_iter().next() {
        Some(key) => PrivateKey(key),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no private key found in {:?}", key),
            ))
        }
    };

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
