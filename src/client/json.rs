//! The JSON-format upstream branch of the client pipeline.

use crate::client::{Client, Transport};
use crate::content_type::{APPLICATION_DNS_MESSAGE, APPLICATION_JSON};
use crate::selector::{Upstream, UpstreamType};
use crate::types::*;
use http::header::ACCEPT;
use http::{Method, Request};
use hyper::Body;
use std::net::SocketAddr;
use std::sync::Arc;
use url::Url;

pub(crate) async fn query(
    client: &Client,
    query: &Message,
    upstream: Arc<Upstream>,
    peer: SocketAddr,
    transport: Transport,
) -> Option<Vec<u8>> {
    let question = &query.questions[0];
    let udp_size = query.udp_payload_size();

    // The JSON format has no way to express other classes.
    if question.class != Class::Internet {
        let mut reply = query.prepare_reply();
        reply.rcode = Rcode::Refused;
        return client.finish(&mut reply, transport, udp_size);
    }

    // Some stubs scramble capitalization; lowercase keeps upstream caches
    // warm.
    let name = match idna::domain_to_ascii(&question.name) {
        Ok(name) => name.to_lowercase(),
        Err(e) => {
            log::warn!("invalid question name {:?}: {:?}", question.name, e);
            let mut reply = query.prepare_reply();
            reply.rcode = Rcode::FormErr;
            return client.finish(&mut reply, transport, udp_size);
        }
    };

    let mut url = match Url::parse(&upstream.url) {
        Ok(url) => url,
        Err(e) => {
            log::error!("invalid upstream URL {:?}: {}", upstream.url, e);
            return client.servfail(query, transport, udp_size);
        }
    };

    url.query_pairs_mut()
        .append_pair("ct", upstream.request_type)
        .append_pair("name", &name)
        .append_pair("type", &question.r#type.to_string());

    if query.cd {
        url.query_pairs_mut().append_pair("cd", "1");
    }
    if let Some(ext) = &query.extension {
        if ext.dnssec_ok {
            url.query_pairs_mut().append_pair("do", "1");
        }
    }

    let mut ecs_netmask = 255;
    if client.no_ecs() {
        // An explicit null subnet asks the upstream not to tailor at all.
        url.query_pairs_mut()
            .append_pair("edns_client_subnet", "0.0.0.0/0");
        ecs_netmask = 0;
    } else if let Some((addr, bits)) = client.find_client_subnet(query, peer) {
        url.query_pairs_mut()
            .append_pair("edns_client_subnet", &format!("{}/{}", addr, bits));
        ecs_netmask = bits;
    }

    let req = match Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .header(
            ACCEPT,
            format!("{}, {}", APPLICATION_JSON, APPLICATION_DNS_MESSAGE),
        )
        .body(Body::empty())
    {
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
        .translate_response(query, resp, udp_size, ecs_netmask, UpstreamType::Google)
        .await;

    client.finish(&mut reply, transport, udp_size)
}
