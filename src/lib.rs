//! dohproxy is a bidirectional translating proxy between classical DNS and
//! DNS-over-HTTPS, shipped as two programs over one library:
//!
//! * `doh-client` listens for stub-resolver queries on UDP/TCP port 53,
//!   forwards each over HTTPS to a configurable DoH resolver, and turns the
//!   HTTPS response back into a DNS packet.
//! * `doh-server` is the other end: it accepts DoH requests, asks a pool of
//!   conventional recursive resolvers over UDP/TCP/TCP-TLS, and answers in
//!   the requested DoH content type.
//!
//! Both wire formats are spoken on the HTTPS side: the RFC 8484 binary
//! format (`application/dns-message`, base64url GET or raw POST) and the
//! Google JSON format (`application/dns-json`, GET with query parameters).
//!
//! # Features
//! * Symmetric translation between a DNS message and both HTTPS
//!   representations, preserving EDNS(0) semantics (Client Subnet, UDP
//!   payload size, the DO bit).
//! * TTL reconciliation against HTTP caching metadata, in both directions.
//! * Weighted upstream selection (uniform random, smooth weighted
//!   round-robin, LVS-style weighted round-robin) with background health
//!   probes feeding the weights.
//! * A bootstrap resolver so the DoH endpoint's own hostname never needs
//!   DoH to resolve, plus passthrough suffixes answered entirely over
//!   classical DNS.
//! * International domain names throughout (IDNA/Punycode).
//!
//! # Usage (client)
//!
//! ```toml
//! # doh-client.conf
//! listen = ["127.0.0.1:53", "[::1]:53"]
//!
//! [upstream]
//! upstream_google = [{url = "https://dns.google.com/resolve", weight = 50}]
//! upstream_ietf   = [{url = "https://cloudflare-dns.com/dns-query", weight = 50}]
//! upstream_selector = "weighted_round_robin"
//!
//! [others]
//! bootstrap = ["8.8.8.8", "1.1.1.1"]
//! passthrough = ["home.arpa"]
//! timeout = 10
//! ```
//!
//! ```shell
//! $ doh-client -c doh-client.conf --verbose
//! ```
//!
//! # Usage (server)
//!
//! ```toml
//! # doh-server.conf
//! listen   = ["127.0.0.1:8053", "[::1]:8053"]
//! path     = "/dns-query"
//! upstream = ["udp:8.8.8.8:53", "udp:8.8.4.4:53"]
//! timeout  = 10
//! tries    = 3
//! ```
//!
//! ```shell
//! $ doh-server -c doh-server.conf
//! $ curl 'http://127.0.0.1:8053/dns-query?name=example.com&type=A'
//! ```
//!
//! # Testing
//!
//! ```shell
//! $ cargo test
//! ```
//!
//! ## Reference
//!
//! * [rfc1035]: DOMAIN NAMES - IMPLEMENTATION AND SPECIFICATION
//! * [rfc6891]: Extension Mechanisms for DNS (EDNS(0))
//! * [rfc7871]: Client Subnet in DNS Queries
//! * [rfc8484]: DNS Queries over HTTPS (DoH)
//! * [JSON API for DNS over HTTPS](https://developers.google.com/speed/public-dns/docs/doh/json)
//!
//! [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
//! [rfc6891]: https://datatracker.ietf.org/doc/html/rfc6891
//! [rfc7871]: https://datatracker.ietf.org/doc/html/rfc7871
//! [rfc8484]: https://datatracker.ietf.org/doc/html/rfc8484

pub mod client;
pub mod config;
pub mod json;
pub mod resource;
pub mod selector;
pub mod server;
pub mod types;
pub mod util;

mod content_type;
mod display;
mod dns;
mod errors;
mod from_str;
mod io;

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate lazy_static;

// Pull up the various types that should be on the front page of the docs.
#[doc(inline)]
pub use crate::types::*;

#[doc(inline)]
pub use crate::client::Client;

#[doc(inline)]
pub use crate::server::Server;

pub use crate::from_str::FromStrError;

/// Identifies the proxy in outbound User-Agent headers and in the server's
/// Server/X-Powered-By headers.
pub const USER_AGENT: &str = concat!("DoH-Proxy/", env!("CARGO_PKG_VERSION"));
