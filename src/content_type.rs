//! The media types spoken on the HTTPS side of the proxy, and a tolerant
//! comparison that ignores parameters such as `; charset=UTF-8`.

use http::HeaderValue;
use mime::Mime;
use std::str::FromStr;

/// RFC 8484 binary wire format.
pub const APPLICATION_DNS_MESSAGE: &str = "application/dns-message";

/// The pre-standard name for the binary wire format, still sent by some
/// resolvers and clients.
pub const APPLICATION_DNS_UDPWIREFORMAT: &str = "application/dns-udpwireformat";

/// The JSON wire format's request media type.
pub const APPLICATION_DNS_JSON: &str = "application/dns-json";

/// The JSON wire format's response media type.
pub const APPLICATION_JSON: &str = "application/json";

pub(crate) fn content_type_equal(content_type: &HeaderValue, expected: &str) -> bool {
    // Parse the content type, into it's "essence" which is just "type/subtype", instead of
    // "type/subtype+suffix; param=value..."
    let content_type = match content_type.to_str() {
        Ok(t) => t,
        Err(_err) => return false,
    };
    let content_type = match Mime::from_str(content_type) {
        Ok(t) => t,
        Err(_err) => return false,
    };

    content_type.essence_str() == expected
}

/// True when the header names either spelling of the binary wire format.
pub(crate) fn is_dns_message(content_type: &HeaderValue) -> bool {
    content_type_equal(content_type, APPLICATION_DNS_MESSAGE)
        || content_type_equal(content_type, APPLICATION_DNS_UDPWIREFORMAT)
}

/// True when the header names a JSON body.
pub(crate) fn is_dns_json(content_type: &HeaderValue) -> bool {
    content_type_equal(content_type, APPLICATION_JSON)
        || content_type_equal(content_type, APPLICATION_DNS_JSON)
}
