//! Binary-format (RFC 8484) request parsing and response generation for
//! the server.

use crate::content_type::{self, APPLICATION_DNS_MESSAGE};
use crate::json::http_date;
use crate::server::{DnsRequest, HttpError, Server};
use crate::types::*;
use chrono::Utc;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, DATE, EXPIRES, LAST_MODIFIED};
use http::HeaderMap;
use hyper::{Body, Response};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Recovers the raw DNS message from either the `dns` query parameter
/// (base64url, unpadded) or, for POSTs in the right Content-Type, the
/// request body.
pub(crate) fn extract_binary(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Vec<u8>, HttpError> {
    let encoded = params.get("dns").map(String::as_str).unwrap_or("");
    if !encoded.is_empty() {
        return base64::decode_config(encoded, base64::URL_SAFE_NO_PAD).map_err(|_| {
            HttpError::bad_request(format!("Invalid argument value: \"dns\" = {:?}", encoded))
        });
    }

    if !body.is_empty() {
        if let Some(ct) = headers.get(CONTENT_TYPE) {
            if content_type::is_dns_message(ct) {
                return Ok(body.to_vec());
            }
        }
    }

    Err(HttpError::bad_request("Invalid argument value: \"dns\""))
}

pub(crate) fn parse_request(
    server: &Server,
    binary: &[u8],
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<DnsRequest, HttpError> {
    let mut request = Message::from_slice(binary)
        .map_err(|e| HttpError::bad_request(format!("DNS packet parse failure ({})", e)))?;

    // A fresh id decouples the upstream exchange from whatever the client
    // sent; the original comes back at response time.
    let original_id = request.id;
    request.id = Message::random_id();

    let ext = request.extension.get_or_insert_with(|| Extension {
        payload_size: DEFAULT_PAYLOAD_SIZE,
        dnssec_ok: false,
        ..Extension::default()
    });

    let has_client_ecs = ext.client_subnet().is_some();
    if !has_client_ecs {
        if let Some(ip) = server.find_client_ip(headers, peer) {
            let bits = server.ecs_bits(ip);
            ext.add_client_subnet(ClientSubnet::new(ip, bits));
        }
    }

    Ok(DnsRequest {
        request,
        original_id,
        has_client_ecs,
    })
}

pub(crate) fn respond(server: &Server, req: &DnsRequest, response: &Message) -> Response<Body> {
    // Marshalling is only for the TTL metadata driving the cache headers.
    let json = crate::json::marshal(response);

    let mut response = response.clone();
    response.id = req.original_id;
    let wire = match response.to_vec() {
        Ok(wire) => wire,
        Err(e) => {
            log::error!("failed to encode the response: {}", e);
            return server.error_response(500, &format!("DNS packet construct failure ({})", e));
        }
    };

    let now = http_date(Utc::now());
    let mut builder = server
        .response_builder()
        .header(CONTENT_TYPE, APPLICATION_DNS_MESSAGE)
        .header(DATE, now.clone())
        .header(LAST_MODIFIED, now);

    if json.have_ttl {
        let visibility = if req.has_client_ecs { "private" } else { "public" };
        builder = builder.header(
            CACHE_CONTROL,
            format!("{}, max-age={}", visibility, json.least_ttl),
        );
        if let Some(expires) = json.earliest_expires {
            builder = builder.header(EXPIRES, http_date(expires));
        }
    }

    if response.rcode == Rcode::ServFail {
        builder = builder.status(503);
    }

    builder.body(Body::from(wire)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn sample_query() -> Vec<u8> {
        let mut query = Message::default();
        query
            .add_question("example.com", Type::A, Class::Internet)
            .unwrap();
        query.to_vec().unwrap()
    }

    #[test]
    fn test_extract_from_the_query_string() {
        let wire = sample_query();
        let mut params = HashMap::new();
        params.insert(
            "dns".to_string(),
            base64::encode_config(&wire, base64::URL_SAFE_NO_PAD),
        );

        let binary = extract_binary(&params, &HeaderMap::new(), &[]).unwrap();
        assert_eq!(binary, wire);
    }

    #[test]
    fn test_extract_from_the_body() {
        let wire = sample_query();
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(APPLICATION_DNS_MESSAGE),
        );

        let binary = extract_binary(&HashMap::new(), &headers, &wire).unwrap();
        assert_eq!(binary, wire);
    }

    #[test]
    fn test_extract_rejects_bodies_of_other_types() {
        let wire = sample_query();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        assert!(extract_binary(&HashMap::new(), &headers, &wire).is_err());
        assert!(extract_binary(&HashMap::new(), &HeaderMap::new(), &[]).is_err());
    }

    #[test]
    fn test_extract_rejects_bad_base64() {
        let mut params = HashMap::new();
        params.insert("dns".to_string(), "not!base64%".to_string());

        assert!(extract_binary(&params, &HeaderMap::new(), &[]).is_err());
    }
}
