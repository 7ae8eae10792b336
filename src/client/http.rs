//! The shared HTTP client and its rebuild discipline.
//!
//! One HTTP/2-capable client serves every query. When the transport starts
//! failing (stale pooled connections after a network change are the usual
//! culprit) the pipeline asks for a rebuild: the manager swaps in a fresh
//! client under the write lock and lets the old one drop, which closes its
//! idle pool. Rebuilds within one timeout window collapse into a no-op so a
//! burst of failures doesn't thrash the connection pool.

use crate::client::bootstrap::BootstrapResolver;
use crate::config::{parse_bootstrap, ConfigError, OthersConfig};
use http::header::{COOKIE, SET_COOKIE, USER_AGENT};
use http::{HeaderValue, Request, Response};
use hyper::client::HttpConnector;
use hyper::Body;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

type DohConnector = hyper_rustls::HttpsConnector<HttpConnector<BootstrapResolver>>;
type DohHttpClient = hyper::Client<DohConnector, Body>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("request deadline exceeded")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

struct ManagedClient {
    client: DohHttpClient,
    built_at: Instant,
}

pub struct HttpClientManager {
    state: RwLock<ManagedClient>,
    resolver: BootstrapResolver,
    timeout: Duration,

    /// Per-host cookies, or None with `no_cookies`. Most CDN fronted
    /// resolvers require cookie support to pass their DDoS screens.
    jar: Option<Mutex<HashMap<String, HashMap<String, String>>>>,

    user_agent: Option<HeaderValue>,
    debug_headers: Vec<String>,
}

impl HttpClientManager {
    pub fn new(conf: &OthersConfig) -> Result<HttpClientManager, ConfigError> {
        let resolver = BootstrapResolver::new(parse_bootstrap(&conf.bootstrap)?, conf.no_ipv6);
        let timeout = Duration::from_secs(conf.timeout);

        Ok(HttpClientManager {
            state: RwLock::new(ManagedClient {
                client: build_client(resolver.clone(), timeout),
                built_at: Instant::now(),
            }),
            resolver,
            timeout,
            jar: if conf.no_cookies {
                None
            } else {
                Some(Mutex::new(HashMap::new()))
            },
            user_agent: if conf.no_user_agent {
                None
            } else {
                Some(HeaderValue::from_static(crate::USER_AGENT))
            },
            debug_headers: conf.debug_http_headers.clone(),
        })
    }

    pub fn resolver(&self) -> &BootstrapResolver {
        &self.resolver
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes one request under the configured deadline. The reader lock
    /// is held for the duration, so an in-flight rebuild waits for us.
    pub async fn execute(&self, mut req: Request<Body>) -> Result<Response<Body>, ExchangeError> {
        if let Some(user_agent) = &self.user_agent {
            req.headers_mut().insert(USER_AGENT, user_agent.clone());
        }

        let host = req.uri().host().map(str::to_string);
        if let Some(host) = &host {
            self.apply_cookies(host, &mut req);
        }

        let state = self.state.read().await;
        let result = tokio::time::timeout(self.timeout, state.client.request(req)).await;
        drop(state);

        let resp = match result {
            Err(_elapsed) => return Err(ExchangeError::Timeout),
            Ok(Err(e)) => return Err(ExchangeError::Transport(e)),
            Ok(Ok(resp)) => resp,
        };

        if let Some(host) = &host {
            self.store_cookies(host, &resp);
        }
        for name in &self.debug_headers {
            if let Some(value) = resp.headers().get(name.as_str()) {
                log::info!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
            }
        }

        Ok(resp)
    }

    /// Replaces the client, closing the old idle pool. A rebuild within one
    /// timeout window of the previous build is a no-op.
    pub async fn rebuild(&self) {
        let mut state = self.state.write().await;
        if state.built_at.elapsed() < self.timeout {
            return;
        }

        log::info!("rebuilding the HTTP client");
        state.client = build_client(self.resolver.clone(), self.timeout);
        state.built_at = Instant::now();
        // The previous client drops here along with its idle connections.
    }

    #[cfg(test)]
    pub(crate) async fn built_at(&self) -> Instant {
        self.state.read().await.built_at
    }

    fn apply_cookies(&self, host: &str, req: &mut Request<Body>) {
        let jar = match &self.jar {
            Some(jar) => jar.lock().unwrap(),
            None => return,
        };
        let cookies = match jar.get(host) {
            Some(cookies) if !cookies.is_empty() => cookies,
            _ => return,
        };

        let header = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<String>>()
            .join("; ");
        if let Ok(header) = HeaderValue::from_str(&header) {
            req.headers_mut().insert(COOKIE, header);
        }
    }

    fn store_cookies(&self, host: &str, resp: &Response<Body>) {
        let mut jar = match &self.jar {
            Some(jar) => jar.lock().unwrap(),
            None => return,
        };

        for value in resp.headers().get_all(SET_COOKIE) {
            let value = match value.to_str() {
                Ok(value) => value,
                Err(_) => continue,
            };
            match cookie::Cookie::parse(value) {
                Ok(cookie) => {
                    jar.entry(host.to_string()).or_default().insert(
                        cookie.name().to_string(),
                        cookie.value().to_string(),
                    );
                }
                Err(e) => log::debug!("ignoring malformed cookie from {}: {}", host, e),
            }
        }
    }
}

fn build_client(resolver: BootstrapResolver, timeout: Duration) -> DohHttpClient {
    let mut http = HttpConnector::new_with_resolver(resolver);
    http.enforce_http(false);
    http.set_connect_timeout(Some(timeout));
    http.set_keepalive(Some(TCP_KEEPALIVE));

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    hyper::Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout: u64) -> HttpClientManager {
        HttpClientManager::new(&OthersConfig {
            timeout,
            ..OthersConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent_within_the_window() {
        let manager = manager(10);
        let before = manager.built_at().await;

        // Well within the ten second window, so nothing should change.
        manager.rebuild().await;
        assert_eq!(manager.built_at().await, before);
    }

    #[tokio::test]
    async fn test_rebuild_advances_after_the_window() {
        let manager = manager(0);
        // timeout 0 never suppresses; the guard window has always passed.
        let before = manager.built_at().await;

        manager.rebuild().await;
        assert!(manager.built_at().await > before);
    }
}
