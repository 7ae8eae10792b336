//! JSON-format request parsing and response generation for the server.

use crate::json::http_date;
use crate::server::{DnsRequest, HttpError, Server};
use crate::types::*;
use crate::util;
use chrono::Utc;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, DATE, EXPIRES, LAST_MODIFIED, VARY};
use http::HeaderMap;
use hyper::{Body, Response};
use num_traits::FromPrimitive;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

pub(crate) fn parse_request(
    server: &Server,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<DnsRequest, HttpError> {
    let name = match params.get("name") {
        Some(name) if !name.is_empty() => name,
        _ => return Err(HttpError::bad_request("Invalid argument value: \"name\"")),
    };
    let name = match idna::domain_to_ascii(name) {
        Ok(name) => name.to_lowercase(),
        Err(e) => {
            return Err(HttpError::bad_request(format!(
                "Invalid argument value: \"name\" = {:?} ({:?})",
                name, e
            )))
        }
    };

    let type_param = params.get("type").map(String::as_str).unwrap_or("");
    let r#type = parse_type(type_param).ok_or_else(|| {
        HttpError::bad_request(format!("Invalid argument value: \"type\" = {:?}", type_param))
    })?;

    let cd_param = params.get("cd").map(String::as_str).unwrap_or("");
    let cd = match cd_param {
        "1" => true,
        "0" | "" => false,
        other if other.eq_ignore_ascii_case("true") => true,
        other if other.eq_ignore_ascii_case("false") => false,
        other => {
            return Err(HttpError::bad_request(format!(
                "Invalid argument value: \"cd\" = {:?}",
                other
            )))
        }
    };

    let subnet_param = params
        .get("edns_client_subnet")
        .map(String::as_str)
        .unwrap_or("");
    let has_client_ecs = !subnet_param.is_empty();
    let subnet = if has_client_ecs {
        Some(parse_subnet_param(subnet_param)?)
    } else {
        server
            .find_client_ip(headers, peer)
            .map(|ip| ClientSubnet::new(ip, server.ecs_bits(ip)))
    };

    let mut request = Message::default();
    request.cd = cd;
    if let Err(e) = request.add_question(&name, r#type, Class::Internet) {
        return Err(HttpError::bad_request(format!(
            "Invalid argument value: \"name\" = {:?} ({})",
            name, e
        )));
    }

    let mut ext = Extension {
        payload_size: DEFAULT_PAYLOAD_SIZE,
        dnssec_ok: true,
        ..Extension::default()
    };
    if let Some(subnet) = subnet {
        ext.add_client_subnet(subnet);
    }
    request.add_extension(ext);

    Ok(DnsRequest {
        original_id: request.id,
        request,
        has_client_ecs,
    })
}

fn parse_type(param: &str) -> Option<Type> {
    if param.is_empty() {
        return Some(Type::A);
    }
    if let Ok(value) = param.parse::<u16>() {
        return FromPrimitive::from_u16(value);
    }
    Type::from_str(&param.to_uppercase()).ok()
}

// `addr`, `addr/mask`, and the bare `0/0` alias are all accepted. Without
// a mask the conventional /24 or /56 applies, not the host length.
fn parse_subnet_param(param: &str) -> Result<ClientSubnet, HttpError> {
    let invalid = || {
        HttpError::bad_request(format!(
            "Invalid argument value: \"edns_client_subnet\" = {:?}",
            param
        ))
    };

    if param.contains('/') {
        let (_family, address, bits) = util::parse_subnet(param).map_err(|_| invalid())?;
        let mut subnet = ClientSubnet::new(address, bits);
        // A zero prefix means "no tailoring"; the family defaults to IPv4
        // exactly as the 0/0 alias spells it.
        if bits == 0 {
            subnet = ClientSubnet::unspecified();
        }
        Ok(subnet)
    } else {
        let address: IpAddr = param.parse().map_err(|_| invalid())?;
        let bits = match address {
            IpAddr::V4(_) => 24,
            IpAddr::V6(_) => 56,
        };
        Ok(ClientSubnet::new(address, bits))
    }
}

pub(crate) fn respond(server: &Server, req: &DnsRequest, response: &Message) -> Response<Body> {
    let json = crate::json::marshal(response);
    let body = match serde_json::to_string(&json) {
        Ok(body) => body,
        Err(e) => {
            log::error!("failed to serialize the response: {}", e);
            return server.error_response(500, &format!("DNS packet parse failure ({})", e));
        }
    };

    let now = http_date(Utc::now());
    let mut builder = server
        .response_builder()
        .header(CONTENT_TYPE, "application/json; charset=UTF-8")
        .header(DATE, now.clone())
        .header(LAST_MODIFIED, now)
        .header(VARY, "Accept");

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

    if json.status == Rcode::ServFail as u32 {
        builder = builder.status(503);
    }

    builder.body(Body::from(body)).unwrap()
}
