//! Upstream DoH endpoint selection.
//!
//! A [`Selector`] owns the pool of endpoints, hands one out per query, and
//! folds two feedback signals into each endpoint's effective weight: status
//! reports from the request pipeline and a periodic background probe. The
//! effective weight always stays within `[1, configured weight]`, so a
//! misbehaving upstream is throttled but never removed.

pub use self::lvs_wrr::LVSWRRSelector;
pub use self::nginx_wrr::NginxWRRSelector;
pub use self::random::RandomSelector;

mod lvs_wrr;
mod nginx_wrr;
mod random;

use crate::config::{ClientConfig, SELECTOR_LVS_WRR, SELECTOR_NGINX_WRR};
use crate::content_type::{APPLICATION_DNS_JSON, APPLICATION_DNS_MESSAGE};
use http::header::ACCEPT;
use http::{Method, Request};
use hyper::Body;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often the background evaluator probes every upstream.
const EVALUATE_INTERVAL: Duration = Duration::from_secs(15);

/// A fixed `www.example.com A` query, base64url encoded, used as the
/// canonical probe for binary-format upstreams.
const PROBE_DNS_PARAM: &str = "q80BAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB";

/// The wire format an upstream speaks.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UpstreamType {
    /// The JSON format, `?name=...&type=...`.
    Google,

    /// The RFC 8484 binary format, `?dns=...` or POST.
    Ietf,
}

/// The pipeline's verdict on one exchange with an upstream.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UpstreamStatus {
    /// The exchange hit the deadline; the upstream is probably down.
    Timeout,

    /// The upstream answered with a server error; it is alive but unhappy.
    Error,

    /// The exchange completed.
    Ok,
}

/// One DoH endpoint and its selection state.
pub struct Upstream {
    pub url: String,
    pub r#type: UpstreamType,

    /// The request Content-Type this endpoint expects.
    pub request_type: &'static str,

    /// The configured weight, the ceiling for `effective_weight`.
    weight: i32,

    /// The dynamic weight, adjusted by probes and status reports.
    effective_weight: AtomicI32,

    /// Scratch state for the smooth round-robin scan.
    current_weight: AtomicI32,
}

impl Upstream {
    fn new(url: &str, r#type: UpstreamType, weight: i32) -> Upstream {
        Upstream {
            url: url.to_string(),
            r#type,
            request_type: match r#type {
                UpstreamType::Google => APPLICATION_DNS_JSON,
                UpstreamType::Ietf => APPLICATION_DNS_MESSAGE,
            },
            weight,
            effective_weight: AtomicI32::new(weight),
            current_weight: AtomicI32::new(0),
        }
    }

    /// Applies `delta` to the effective weight, clamping the result into
    /// `[1, configured weight]`. The add and the clamp are separate atomic
    /// steps; a racing reader may observe the unclamped value briefly,
    /// which the selection algorithms tolerate.
    pub(crate) fn adjust_weight(&self, delta: i32) {
        let value = self.effective_weight.fetch_add(delta, Ordering::Relaxed) + delta;
        if value < 1 {
            self.effective_weight.store(1, Ordering::Relaxed);
        } else if value > self.weight {
            self.effective_weight.store(self.weight, Ordering::Relaxed);
        }
    }

    pub fn effective_weight(&self) -> i32 {
        self.effective_weight.load(Ordering::Relaxed)
    }

    pub(crate) fn current_weight(&self) -> &AtomicI32 {
        &self.current_weight
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "upstream type: {:?}, upstream url: {}",
            self.r#type, self.url
        )
    }
}

/// The pool of DoH endpoints, behind one of three selection strategies.
pub trait Selector: Send + Sync {
    /// Registers an endpoint. Only called while the pool is being built,
    /// before any `get`.
    fn add(&mut self, url: &str, r#type: UpstreamType, weight: i32);

    /// Picks the endpoint for the next query. `None` on an empty pool.
    fn get(&self) -> Option<Arc<Upstream>>;

    /// Spawns the periodic health evaluator, if the strategy has one.
    fn start_evaluate(&self);

    /// Folds one exchange's outcome into the endpoint's effective weight.
    fn report_status(&self, upstream: &Upstream, status: UpstreamStatus);

    /// Spawns a periodic task logging every endpoint's effective weight.
    fn start_debug_report(&self);
}

/// Builds the selector named by the configuration and fills its pool.
pub fn from_config(conf: &ClientConfig) -> Arc<dyn Selector> {
    let timeout = Duration::from_secs(conf.others.timeout);

    let mut selector: Box<dyn Selector> = match conf.upstream.upstream_selector.as_str() {
        SELECTOR_NGINX_WRR => Box::new(NginxWRRSelector::new(timeout)),
        SELECTOR_LVS_WRR => Box::new(LVSWRRSelector::new(timeout)),
        _ => Box::new(RandomSelector::new()),
    };

    for upstream in &conf.upstream.upstream_google {
        selector.add(&upstream.url, UpstreamType::Google, upstream.weight);
    }
    for upstream in &conf.upstream.upstream_ietf {
        selector.add(&upstream.url, UpstreamType::Ietf, upstream.weight);
    }

    selector.into()
}

/// Weight adjustments applied by the probe evaluator. The two round-robin
/// variants penalise failures slightly differently.
pub(crate) struct ProbeTable {
    pub network_error: i32,
    pub json_http_error: i32,
    pub ietf_http_error: i32,
    pub decode_error: i32,
    pub ok: i32,
}

type ProbeClient =
    hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>, Body>;

fn probe_client() -> ProbeClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    hyper::Client::builder().build(https)
}

/// Spawns the 15 second probe loop over the given pool. Every upstream is
/// probed concurrently; a slow round delays the next one, never the
/// request path.
pub(crate) fn spawn_evaluator(
    upstreams: Vec<Arc<Upstream>>,
    timeout: Duration,
    table: &'static ProbeTable,
) {
    tokio::spawn(async move {
        let client = probe_client();
        loop {
            let mut probes = Vec::with_capacity(upstreams.len());
            for upstream in &upstreams {
                probes.push(tokio::spawn(probe_upstream(
                    client.clone(),
                    timeout,
                    upstream.clone(),
                    table,
                )));
            }
            for probe in probes {
                let _ = probe.await;
            }

            tokio::time::sleep(EVALUATE_INTERVAL).await;
        }
    });
}

async fn probe_upstream(
    client: ProbeClient,
    timeout: Duration,
    upstream: Arc<Upstream>,
    table: &'static ProbeTable,
) {
    let (probe_url, accept) = match upstream.r#type {
        UpstreamType::Google => (
            format!("{}?name=www.example.com&type=A", upstream.url),
            APPLICATION_DNS_JSON,
        ),
        UpstreamType::Ietf => (
            format!("{}?dns={}", upstream.url, PROBE_DNS_PARAM),
            APPLICATION_DNS_MESSAGE,
        ),
    };

    let req = match Request::builder()
        .method(Method::GET)
        .uri(probe_url.as_str())
        .header(ACCEPT, accept)
        .body(Body::empty())
    {
        Ok(req) => req,
        Err(e) => {
            // A URL that can't form a request will fail real queries too.
            log::error!("probe of {} failed to build: {}", upstream, e);
            upstream.adjust_weight(table.network_error);
            return;
        }
    };

    let resp = match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            log::debug!("probe of {} failed: {}", upstream, e);
            upstream.adjust_weight(table.network_error);
            return;
        }
        Err(_elapsed) => {
            log::debug!("probe of {} timed out", upstream);
            upstream.adjust_weight(table.network_error);
            return;
        }
    };

    match upstream.r#type {
        UpstreamType::Google => {
            if !resp.status().is_success() {
                upstream.adjust_weight(table.json_http_error);
                return;
            }
            let body = match hyper::body::to_bytes(resp.into_body()).await {
                Ok(body) => body,
                Err(_e) => {
                    upstream.adjust_weight(table.decode_error);
                    return;
                }
            };
            match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(value) if value.get("Status").and_then(|s| s.as_u64()) == Some(0) => {
                    upstream.adjust_weight(table.ok)
                }
                Ok(_) => upstream.adjust_weight(table.decode_error),
                Err(_) => upstream.adjust_weight(table.decode_error),
            }
        }
        UpstreamType::Ietf => {
            if resp.status().is_success() {
                upstream.adjust_weight(table.ok);
            } else {
                upstream.adjust_weight(table.ietf_http_error);
            }
        }
    }
}

/// Spawns a periodic task logging every endpoint's effective weight.
pub(crate) fn spawn_weight_reporter(upstreams: Vec<Arc<Upstream>>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(EVALUATE_INTERVAL).await;

            for upstream in &upstreams {
                log::info!("{}, effective weight: {}", upstream, upstream.effective_weight());
            }
        }
    });
}
