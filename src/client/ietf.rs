//! The binary-format (RFC 8484) upstream branch of the client pipeline.

use crate::client::{Client, Transport};
use crate::content_type::APPLICATION_DNS_MESSAGE;
use crate::selector::{Upstream, UpstreamType};
use crate::types::*;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Request};
use hyper::Body;
use std::net::SocketAddr;
use std::sync::Arc;

// Requests whose encoded URL stays under this limit travel as GET, which
// caches better; anything larger is POSTed.
const MAX_GET_URL: usize = 2048;

/// Rewrites the query for the HTTPS upstream: lowercased question name, a
/// guaranteed OPT record, the Client Subnet policy applied, and a zero id
/// (restored on the way back; zero on the wire keeps the HTTP cache key
/// stable). Returns the rewritten query and the effective ECS netmask.
fn build_upstream_query(
    query: &Message,
    no_ecs: bool,
    guessed: Option<(std::net::IpAddr, u8)>,
) -> (Message, u8) {
    let mut request = query.clone();
    request.questions[0].name = request.questions[0].name.to_lowercase();

    // Guarantee an OPT record so the upstream may answer large.
    let ext = request.extension.get_or_insert_with(|| Extension {
        payload_size: DEFAULT_PAYLOAD_SIZE,
        dnssec_ok: false,
        ..Extension::default()
    });

    let mut ecs_netmask = 255;
    if no_ecs {
        // Never leak client location, not even one the stub supplied.
        ext.options
            .retain(|option| !matches!(option, EdnsOption::ClientSubnet(_)));
    } else if let Some(subnet) = ext.client_subnet() {
        ecs_netmask = subnet.source_netmask;
    } else if let Some((addr, bits)) = guessed {
        ext.add_client_subnet(ClientSubnet::new(addr, bits));
        ecs_netmask = bits;
    }

    request.id = 0;
    (request, ecs_netmask)
}

pub(crate) async fn query(
    client: &Client,
    query: &Message,
    upstream: Arc<Upstream>,
    peer: SocketAddr,
    transport: Transport,
) -> Option<Vec<u8>> {
    let udp_size = query.udp_payload_size();

    let (request, ecs_netmask) = build_upstream_query(
        query,
        client.no_ecs(),
        client.find_client_subnet(query, peer),
    );

    let wire = match request.to_vec() {
        Ok(wire) => wire,
        Err(e) => {
            log::warn!("failed to encode the query: {}", e);
            let mut reply = query.prepare_reply();
            reply.rcode = Rcode::FormErr;
            return client.finish(&mut reply, transport, udp_size);
        }
    };

    let encoded = base64::encode_config(&wire, base64::URL_SAFE_NO_PAD);
    let request_url = format!(
        "{}?ct={}&dns={}",
        upstream.url, upstream.request_type, encoded
    );

    let req = if request_url.len() < MAX_GET_URL {
        Request::builder()
            .method(Method::GET)
            .uri(request_url.as_str())
            .header(ACCEPT, APPLICATION_DNS_MESSAGE)
            .body(Body::empty())
    } else {
        Request::builder()
            .method(Method::POST)
            .uri(upstream.url.as_str())
            .header(ACCEPT, APPLICATION_DNS_MESSAGE)
            .header(CONTENT_TYPE, APPLICATION_DNS_MESSAGE)
            .body(Body::from(wire))
    };

    let req = match req {
        Ok(req) => req,
        Err(e) => {
            log::error!("failed to build the request: {}", e);
            return client.servfail(query, transport, udp_size);
        }
    };

    let resp = match client.dispatch(req, &upstream).await {
        Some(resp) => resp,
        None => return client.servfail(query, transport, udp_size),
    };

    let mut reply = client
        .translate_response(query, resp, udp_size, ecs_netmask, UpstreamType::Ietf)
        .await;

    client.finish(&mut reply, transport, udp_size)
}
